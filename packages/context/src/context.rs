//! Ready-to-use TLS context produced by the builder

use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::TrustError;

/// Server and client configurations sharing one identity and one trust
/// policy.
///
/// Every context owns its configurations; the key and trust managers behind
/// them are shared with the builder and with every other context it made.
#[derive(Debug, Clone)]
pub struct TlsContext {
    server_config: Arc<ServerConfig>,
    client_config: Arc<ClientConfig>,
    need_client_auth: bool,
}

impl TlsContext {
    /// Protocol family negotiated by contexts of this crate
    pub const PROTOCOL: &'static str = "TLS";

    pub(crate) fn new(server_config: ServerConfig, client_config: ClientConfig, need_client_auth: bool) -> Self {
        Self {
            server_config: Arc::new(server_config),
            client_config: Arc::new(client_config),
            need_client_auth,
        }
    }

    pub fn protocol(&self) -> &'static str {
        Self::PROTOCOL
    }

    /// Whether the server side refuses clients that present no certificate
    pub fn need_client_auth(&self) -> bool {
        self.need_client_auth
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Start the server side of one handshake
    pub fn accept(&self) -> Result<ServerConnection, TrustError> {
        ServerConnection::new(self.server_config.clone())
            .map_err(|e| TrustError::ContextInitError(format!("failed to start server connection: {e}")))
    }

    /// Start the client side of one handshake towards `server_name`
    pub fn connect(&self, server_name: &str) -> Result<ClientConnection, TrustError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TrustError::ContextInitError(format!("invalid server name '{server_name}': {e}")))?;
        ClientConnection::new(self.client_config.clone(), name)
            .map_err(|e| TrustError::ContextInitError(format!("failed to start client connection: {e}")))
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config.clone())
    }
}
