//! Network transport for OCSP requests and CRL downloads

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HOST};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use url::{Host, Url};

use crate::error::TrustError;

/// Fetches revocation data on behalf of the verifiers.
///
/// Calls are synchronous because certificate verification is. Every failure
/// is reported as an error; callers treat it as an inconclusive check.
pub trait RevocationTransport: fmt::Debug + Send + Sync {
    /// POST a DER-encoded OCSP request and return the DER response body
    fn post_ocsp(&self, url: &Url, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TrustError>;

    /// GET a CRL (PEM or DER) from a distribution point
    fn fetch_crl(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>, TrustError>;
}

/// HTTP/1.1 transport over plain TCP.
///
/// OCSP responders and CRL distribution points are served over `http://`;
/// any other scheme is refused.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    max_response_bytes: usize,
}

impl HttpTransport {
    pub fn new(max_response_bytes: usize) -> Self {
        Self { max_response_bytes }
    }

    async fn execute(&self, url: &Url, request: Request<Full<Bytes>>) -> Result<Vec<u8>, TrustError> {
        let target = ConnectTarget::from_url(url)?;
        let stream = target
            .connect()
            .await
            .map_err(|e| TrustError::Network(format!("Failed to connect to {target}: {e}")))?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| TrustError::Network(format!("HTTP handshake with {target} failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("Revocation transport connection closed: {}", e);
            }
        });

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| TrustError::Network(format!("Request to {url} failed: {e}")))?;
        if response.status() != StatusCode::OK {
            return Err(TrustError::Network(format!(
                "{url} answered with HTTP status {}",
                response.status()
            )));
        }

        let body = Limited::new(response.into_body(), self.max_response_bytes)
            .collect()
            .await
            .map_err(|e| TrustError::Network(format!("Failed to read response from {url}: {e}")))?
            .to_bytes();
        if body.is_empty() {
            return Err(TrustError::Network(format!("Empty response from {url}")));
        }
        Ok(body.to_vec())
    }
}

/// Socket endpoint of a revocation URL; IP literals bypass name resolution
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectTarget {
    Name(String, u16),
    Addr(SocketAddr),
}

impl ConnectTarget {
    fn from_url(url: &Url) -> Result<Self, TrustError> {
        let port = url.port_or_known_default().unwrap_or(80);
        match url.host() {
            Some(Host::Domain(name)) => Ok(ConnectTarget::Name(name.to_string(), port)),
            Some(Host::Ipv4(ip)) => Ok(ConnectTarget::Addr(SocketAddr::from((ip, port)))),
            Some(Host::Ipv6(ip)) => Ok(ConnectTarget::Addr(SocketAddr::from((ip, port)))),
            None => Err(TrustError::Network(format!("URL without host: {url}"))),
        }
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        match self {
            ConnectTarget::Name(name, port) => TcpStream::connect((name.as_str(), *port)).await,
            ConnectTarget::Addr(addr) => TcpStream::connect(*addr).await,
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectTarget::Name(name, port) => write!(f, "{name}:{port}"),
            ConnectTarget::Addr(addr) => write!(f, "{addr}"),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(10 * 1024 * 1024)
    }
}

impl RevocationTransport for HttpTransport {
    fn post_ocsp(&self, url: &Url, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TrustError> {
        let http_request = build_request(url, Method::POST, Some(request.to_vec()))?;
        block_on_with_timeout(timeout, url, self.execute(url, http_request))
    }

    fn fetch_crl(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>, TrustError> {
        let http_request = build_request(url, Method::GET, None)?;
        block_on_with_timeout(timeout, url, self.execute(url, http_request))
    }
}

fn build_request(url: &Url, method: Method, body: Option<Vec<u8>>) -> Result<Request<Full<Bytes>>, TrustError> {
    if url.scheme() != "http" {
        return Err(TrustError::Network(format!(
            "Unsupported revocation URL scheme '{}' in {url}",
            url.scheme()
        )));
    }
    let authority = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(TrustError::Network(format!("URL without host: {url}"))),
    };
    let path = match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    };

    let builder = Request::builder().method(method).uri(path).header(HOST, authority);
    let request = match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/ocsp-request")
            .header(ACCEPT, "application/ocsp-response")
            .body(Full::new(Bytes::from(body))),
        None => builder.body(Full::new(Bytes::new())),
    };
    request.map_err(|e| TrustError::Network(format!("Failed to build request for {url}: {e}")))
}

/// Drive `future` to completion from synchronous verifier code.
///
/// Inside a multi-threaded tokio runtime the current worker is handed over
/// with `block_in_place`; anywhere else a scoped thread runs a private
/// current-thread runtime so no runtime is ever nested.
fn block_on_with_timeout<F>(timeout: Duration, url: &Url, future: F) -> Result<Vec<u8>, TrustError>
where
    F: Future<Output = Result<Vec<u8>, TrustError>> + Send,
{
    let bounded = async move {
        tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| TrustError::Network(format!("Request to {url} timed out after {timeout:?}")))?
    };

    if let Ok(handle) = tokio::runtime::Handle::try_current()
        && handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread
    {
        return tokio::task::block_in_place(|| handle.block_on(bounded));
    }

    std::thread::scope(|scope| {
        scope
            .spawn(|| {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| TrustError::Network(format!("Failed to start revocation runtime: {e}")))?
                    .block_on(bounded)
            })
            .join()
            .map_err(|_| TrustError::Network("Revocation fetch thread panicked".to_string()))?
    })
}
