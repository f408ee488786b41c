//! OCSP client: request encoding, response evaluation and a status cache

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Encode};
use rand::Rng;
use ring::digest;
use rustls::pki_types::CertificateDer;
use url::Url;
use x509_cert::ext::Extension;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_ocsp::{
    BasicOcspResponse, CertId, CertStatus, OcspRequest, OcspResponse, OcspResponseStatus, Request,
    ResponderId, TbsRequest,
};

use super::signature::verify_signed_data;
use super::transport::RevocationTransport;
use crate::certificate::CertificateInfo;
use crate::config::RevocationConfig;
use crate::error::TrustError;

pub(crate) const OID_SHA1: &str = "1.3.14.3.2.26";
pub(crate) const OID_SHA256: &str = "2.16.840.1.101.3.4.2.1";
pub(crate) const OID_OCSP_BASIC: &str = "1.3.6.1.5.5.7.48.1.1";
pub(crate) const OID_OCSP_NONCE: &str = "1.3.6.1.5.5.7.48.1.2";

const NONCE_LEN: usize = 16;

/// The cache sweeps expired answers once it grows past this many
const CACHE_SWEEP_THRESHOLD: usize = 1024;

/// Tolerated clock difference between us and the responder
const CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Certificate status as reported by a responder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspStatus {
    Good,
    Revoked,
    Unknown,
}

#[derive(Debug, Clone)]
struct OcspCacheEntry {
    status: OcspStatus,
    cached_at: SystemTime,
    next_update: Option<SystemTime>,
}

/// Queries OCSP responders and caches definitive answers
#[derive(Clone)]
pub struct OcspClient {
    cache: Arc<RwLock<HashMap<String, OcspCacheEntry>>>,
    transport: Arc<dyn RevocationTransport>,
    timeout: Duration,
    cache_ttl: Duration,
    responder_override: Option<Url>,
    cache_hits: Arc<AtomicUsize>,
    cache_misses: Arc<AtomicUsize>,
}

impl std::fmt::Debug for OcspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcspClient")
            .field("cache_size", &self.cache_size())
            .field("cache_hits", &self.cache_hits.load(Ordering::Relaxed))
            .field("cache_misses", &self.cache_misses.load(Ordering::Relaxed))
            .field("responder_override", &self.responder_override)
            .finish_non_exhaustive()
    }
}

impl OcspClient {
    pub fn new(config: &RevocationConfig, transport: Arc<dyn RevocationTransport>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::with_capacity(128))),
            transport,
            timeout: config.ocsp_timeout,
            cache_ttl: config.ocsp_cache_ttl,
            responder_override: config.ocsp_responder_override.clone(),
            cache_hits: Arc::new(AtomicUsize::new(0)),
            cache_misses: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cache statistics (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    pub fn cache_size(&self) -> usize {
        match self.cache.read() {
            Ok(cache) => cache.len(),
            Err(poisoned) => {
                tracing::warn!("OCSP cache read lock poisoned during size check, recovering");
                poisoned.into_inner().len()
            }
        }
    }

    /// Ask the responder(s) for the status of `cert`.
    ///
    /// Returns an error when no responder is configured or none of them
    /// produced a valid, signed, fresh answer.
    pub fn check(&self, cert: &CertificateInfo, issuer: &CertificateInfo, now: SystemTime) -> Result<OcspStatus, TrustError> {
        let cache_key = make_cache_key(cert, issuer);
        if let Some(cached) = self.cached_status(&cache_key)
            && !self.is_cache_expired(&cached, now)
        {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("OCSP cache hit for serial {}", hex::encode(&cert.serial));
            return Ok(cached.status);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let urls = self.responder_urls(cert)?;
        let mut last_error = None;
        for url in &urls {
            match self.query_responder(url, cert, issuer, now) {
                Ok((status, next_update)) => {
                    tracing::info!(
                        "OCSP status for '{}' from {}: {:?}",
                        cert.display_name(),
                        url,
                        status
                    );
                    if status != OcspStatus::Unknown {
                        self.cache_status(cache_key, status, now, next_update);
                    }
                    return Ok(status);
                }
                Err(e) => {
                    tracing::warn!("OCSP query to {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TrustError::OcspValidation("no OCSP responder answered".to_string())))
    }

    /// Evaluate an OCSP response stapled to the handshake
    pub fn evaluate_stapled(
        &self,
        response: &[u8],
        cert: &CertificateInfo,
        issuer: &CertificateInfo,
        now: SystemTime,
    ) -> Result<OcspStatus, TrustError> {
        let (status, next_update) = evaluate_response(response, cert, issuer, None, now)?;
        if status != OcspStatus::Unknown {
            self.cache_status(make_cache_key(cert, issuer), status, now, next_update);
        }
        Ok(status)
    }

    /// Drop expired entries
    pub fn cleanup_cache(&self) {
        let now = SystemTime::now();
        let mut cache = match self.cache.write() {
            Ok(cache) => cache,
            Err(poisoned) => {
                tracing::warn!("OCSP cache write lock poisoned during cleanup, recovering");
                poisoned.into_inner()
            }
        };
        cache.retain(|_key, entry| !self.is_cache_expired(entry, now));
        tracing::debug!("OCSP cache cleanup completed, {} entries remaining", cache.len());
    }

    fn responder_urls(&self, cert: &CertificateInfo) -> Result<Vec<Url>, TrustError> {
        if let Some(url) = &self.responder_override {
            return Ok(vec![url.clone()]);
        }
        if cert.ocsp_urls.is_empty() {
            return Err(TrustError::OcspValidation(format!(
                "'{}' names no OCSP responder",
                cert.display_name()
            )));
        }
        cert.ocsp_urls
            .iter()
            .map(|raw| {
                Url::parse(raw).map_err(|e| TrustError::OcspValidation(format!("Invalid OCSP URL '{raw}': {e}")))
            })
            .collect()
    }

    fn query_responder(
        &self,
        url: &Url,
        cert: &CertificateInfo,
        issuer: &CertificateInfo,
        now: SystemTime,
    ) -> Result<(OcspStatus, Option<SystemTime>), TrustError> {
        let nonce = generate_nonce();
        let request = create_request(cert, issuer, &nonce)?;
        let response = self.transport.post_ocsp(url, &request, self.timeout)?;
        evaluate_response(&response, cert, issuer, Some(&nonce), now)
    }

    fn cached_status(&self, cache_key: &str) -> Option<OcspCacheEntry> {
        match self.cache.read() {
            Ok(cache) => cache.get(cache_key).cloned(),
            Err(poisoned) => {
                tracing::warn!("OCSP cache read lock poisoned, recovering");
                poisoned.into_inner().get(cache_key).cloned()
            }
        }
    }

    fn is_cache_expired(&self, entry: &OcspCacheEntry, now: SystemTime) -> bool {
        if let Some(next_update) = entry.next_update {
            return now > next_update;
        }
        now.duration_since(entry.cached_at).unwrap_or(Duration::ZERO) > self.cache_ttl
    }

    fn cache_status(&self, cache_key: String, status: OcspStatus, now: SystemTime, next_update: Option<SystemTime>) {
        let entry = OcspCacheEntry {
            status,
            cached_at: now,
            next_update,
        };
        let mut cache = match self.cache.write() {
            Ok(cache) => cache,
            Err(poisoned) => {
                tracing::warn!("OCSP cache write lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        cache.insert(cache_key, entry);
        if cache.len() > CACHE_SWEEP_THRESHOLD {
            cache.retain(|_key, entry| !self.is_cache_expired(entry, now));
            tracing::debug!("OCSP cache swept, {} entries remaining", cache.len());
        }
    }
}

fn make_cache_key(cert: &CertificateInfo, issuer: &CertificateInfo) -> String {
    let key_hash = digest::digest(&digest::SHA256, &issuer.public_key);
    format!("{}:{}", hex::encode(key_hash.as_ref()), hex::encode(&cert.serial))
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill(&mut nonce[..]);
    nonce
}

fn ocsp_error(context: &str) -> impl Fn(der::Error) -> TrustError + '_ {
    move |e| TrustError::OcspValidation(format!("{context}: {e}"))
}

/// CertID over SHA-1, the hash every responder is required to understand
pub(crate) fn build_cert_id(cert: &CertificateInfo, issuer: &CertificateInfo) -> Result<CertId, TrustError> {
    let name_hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &issuer.subject);
    let key_hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &issuer.public_key);

    Ok(CertId {
        hash_algorithm: AlgorithmIdentifierOwned {
            oid: ObjectIdentifier::new_unwrap(OID_SHA1),
            parameters: None,
        },
        issuer_name_hash: OctetString::new(name_hash.as_ref()).map_err(ocsp_error("issuer name hash"))?,
        issuer_key_hash: OctetString::new(key_hash.as_ref()).map_err(ocsp_error("issuer key hash"))?,
        serial_number: SerialNumber::new(&cert.serial).map_err(ocsp_error("serial number"))?,
    })
}

/// DER-encoded OCSPRequest for one certificate, carrying `nonce`
pub(crate) fn create_request(cert: &CertificateInfo, issuer: &CertificateInfo, nonce: &[u8]) -> Result<Vec<u8>, TrustError> {
    let nonce_value = OctetString::new(nonce)
        .and_then(|octets| octets.to_der())
        .map_err(ocsp_error("nonce"))?;
    let nonce_extension = Extension {
        extn_id: ObjectIdentifier::new_unwrap(OID_OCSP_NONCE),
        critical: false,
        extn_value: OctetString::new(nonce_value).map_err(ocsp_error("nonce extension"))?,
    };

    let request = OcspRequest {
        tbs_request: TbsRequest {
            version: x509_ocsp::Version::V1,
            requestor_name: None,
            request_list: vec![Request {
                req_cert: build_cert_id(cert, issuer)?,
                single_request_extensions: None,
            }],
            request_extensions: Some(vec![nonce_extension]),
        },
        optional_signature: None,
    };

    request.to_der().map_err(ocsp_error("Failed to encode OCSP request"))
}

/// Validate a DER OCSPResponse for `cert` and extract its status.
///
/// The response must be successful, of the basic type, signed by the issuer
/// or by a responder the issuer delegated to, fresh at `now`, and must echo
/// `expected_nonce` when the responder returns a nonce at all.
pub(crate) fn evaluate_response(
    response_bytes: &[u8],
    cert: &CertificateInfo,
    issuer: &CertificateInfo,
    expected_nonce: Option<&[u8]>,
    now: SystemTime,
) -> Result<(OcspStatus, Option<SystemTime>), TrustError> {
    let response = OcspResponse::from_der(response_bytes).map_err(ocsp_error("Failed to decode OCSP response"))?;
    if response.response_status != OcspResponseStatus::Successful {
        return Err(TrustError::OcspValidation(format!(
            "responder returned status {:?}",
            response.response_status
        )));
    }

    let body = response
        .response_bytes
        .as_ref()
        .ok_or_else(|| TrustError::OcspValidation("No response bytes in OCSP response".to_string()))?;
    if body.response_type != ObjectIdentifier::new_unwrap(OID_OCSP_BASIC) {
        return Err(TrustError::OcspValidation(format!(
            "unsupported response type {}",
            body.response_type
        )));
    }
    let basic = BasicOcspResponse::from_der(body.response.as_bytes())
        .map_err(ocsp_error("Failed to parse basic OCSP response"))?;

    verify_response_signature(&basic, issuer, now)?;

    let tbs = &basic.tbs_response_data;
    if let Some(expected) = expected_nonce {
        let nonce = tbs
            .response_extensions
            .as_ref()
            .and_then(|exts| exts.iter().find(|ext| ext.extn_id == ObjectIdentifier::new_unwrap(OID_OCSP_NONCE)));
        if let Some(nonce) = nonce
            && !nonce_matches(nonce.extn_value.as_bytes(), expected)
        {
            return Err(TrustError::OcspValidation(
                "OCSP nonce mismatch - possible replay attack".to_string(),
            ));
        }
    }

    let single = tbs
        .responses
        .iter()
        .find(|single| cert_id_matches(&single.cert_id, cert, issuer))
        .ok_or_else(|| TrustError::OcspValidation("Certificate not found in OCSP response".to_string()))?;

    let this_update = to_system_time(single.this_update.0.to_unix_duration());
    let next_update = single
        .next_update
        .as_ref()
        .map(|time| to_system_time(time.0.to_unix_duration()));
    if this_update > now + CLOCK_SKEW {
        return Err(TrustError::OcspValidation("response thisUpdate lies in the future".to_string()));
    }
    if let Some(next_update) = next_update
        && next_update + CLOCK_SKEW < now
    {
        return Err(TrustError::OcspValidation("response is stale (nextUpdate has passed)".to_string()));
    }

    let status = match &single.cert_status {
        CertStatus::Good(_) => OcspStatus::Good,
        CertStatus::Revoked(info) => {
            tracing::warn!(
                "Responder reports '{}' revoked at {}s since the epoch",
                cert.display_name(),
                info.revocation_time.0.to_unix_duration().as_secs()
            );
            OcspStatus::Revoked
        }
        CertStatus::Unknown(_) => OcspStatus::Unknown,
    };
    Ok((status, next_update))
}

fn verify_response_signature(basic: &BasicOcspResponse, issuer: &CertificateInfo, now: SystemTime) -> Result<(), TrustError> {
    let responder_id = &basic.tbs_response_data.responder_id;
    let delegated = if responder_matches(responder_id, issuer) {
        None
    } else {
        Some(find_delegated_responder(basic, issuer, now)?)
    };
    let signer = delegated.as_ref().unwrap_or(issuer);

    let tbs_der = basic
        .tbs_response_data
        .to_der()
        .map_err(ocsp_error("Failed to encode response data"))?;
    verify_signed_data(
        signer,
        &basic.signature_algorithm.oid.to_string(),
        &tbs_der,
        basic.signature.raw_bytes(),
    )
    .map_err(|reason| TrustError::OcspValidation(format!("OCSP response signature invalid: {reason}")))
}

fn find_delegated_responder(
    basic: &BasicOcspResponse,
    issuer: &CertificateInfo,
    now: SystemTime,
) -> Result<CertificateInfo, TrustError> {
    for cert in basic.certs.iter().flatten() {
        let der = cert.to_der().map_err(ocsp_error("Failed to encode responder certificate"))?;
        let info = CertificateInfo::from_der(&CertificateDer::from(der))?;
        if !responder_matches(&basic.tbs_response_data.responder_id, &info) {
            continue;
        }
        if !info.ocsp_signing {
            return Err(TrustError::OcspValidation(format!(
                "responder certificate '{}' lacks the OCSPSigning extended key usage",
                info.display_name()
            )));
        }
        if !info.is_issued_by(issuer) {
            return Err(TrustError::OcspValidation(format!(
                "responder certificate '{}' is not issued by '{}'",
                info.display_name(),
                issuer.display_name()
            )));
        }
        if info.not_after < now {
            return Err(TrustError::OcspValidation(format!(
                "responder certificate '{}' has expired",
                info.display_name()
            )));
        }
        return Ok(info);
    }
    Err(TrustError::OcspValidation(
        "response is signed neither by the issuer nor by a delegated responder".to_string(),
    ))
}

fn responder_matches(responder_id: &ResponderId, candidate: &CertificateInfo) -> bool {
    match responder_id {
        ResponderId::ByName(name) => name.to_der().is_ok_and(|der| der == candidate.subject),
        ResponderId::ByKey(hash) => {
            hash.as_bytes() == digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &candidate.public_key).as_ref()
        }
    }
}

fn cert_id_matches(id: &CertId, cert: &CertificateInfo, issuer: &CertificateInfo) -> bool {
    let algorithm = match id.hash_algorithm.oid.to_string().as_str() {
        OID_SHA1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
        OID_SHA256 => &digest::SHA256,
        _ => return false,
    };
    id.serial_number.as_bytes() == cert.serial.as_slice()
        && id.issuer_name_hash.as_bytes() == digest::digest(algorithm, &issuer.subject).as_ref()
        && id.issuer_key_hash.as_bytes() == digest::digest(algorithm, &issuer.public_key).as_ref()
}

/// Responders differ on whether the nonce value is wrapped in an OCTET STRING
fn nonce_matches(value: &[u8], expected: &[u8]) -> bool {
    if value == expected {
        return true;
    }
    OctetString::from_der(value).is_ok_and(|inner| inner.as_bytes() == expected)
}

fn to_system_time(since_epoch: Duration) -> SystemTime {
    SystemTime::UNIX_EPOCH + since_epoch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ca_and_leaf() -> (CertificateInfo, CertificateInfo) {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.distinguished_name.push(rcgen::DnType::CommonName, "root-ca");
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        let issuer = rcgen::Issuer::new(ca_params, ca_key);

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let mut leaf_params = rcgen::CertificateParams::new(vec!["alice".to_string()]).unwrap();
        leaf_params.distinguished_name.push(rcgen::DnType::CommonName, "alice");
        let leaf = leaf_params.signed_by(&leaf_key, &issuer).unwrap();

        (
            CertificateInfo::from_der(ca_cert.der()).unwrap(),
            CertificateInfo::from_der(leaf.der()).unwrap(),
        )
    }

    #[test]
    fn test_request_carries_cert_id_and_nonce() {
        let (ca, leaf) = ca_and_leaf();
        let nonce = [7u8; NONCE_LEN];
        let request = OcspRequest::from_der(&create_request(&leaf, &ca, &nonce).unwrap()).unwrap();

        let single = &request.tbs_request.request_list[0];
        assert!(cert_id_matches(&single.req_cert, &leaf, &ca));
        let extensions = request.tbs_request.request_extensions.unwrap();
        assert!(nonce_matches(extensions[0].extn_value.as_bytes(), &nonce));
    }

    #[test]
    fn test_cert_id_does_not_match_other_issuer() {
        let (ca, leaf) = ca_and_leaf();
        let (other_ca, _) = ca_and_leaf();
        let id = build_cert_id(&leaf, &ca).unwrap();
        assert!(!cert_id_matches(&id, &leaf, &other_ca));
    }

    #[test]
    fn test_unsuccessful_response_is_rejected() {
        let (ca, leaf) = ca_and_leaf();
        let response = OcspResponse {
            response_status: OcspResponseStatus::Unauthorized,
            response_bytes: None,
        }
        .to_der()
        .unwrap();
        let err = evaluate_response(&response, &leaf, &ca, None, SystemTime::now()).unwrap_err();
        assert!(matches!(err, TrustError::OcspValidation(msg) if msg.contains("Unauthorized")));
    }

    #[test]
    fn test_garbage_response_is_rejected() {
        let (ca, leaf) = ca_and_leaf();
        let err = evaluate_response(b"not der", &leaf, &ca, None, SystemTime::now()).unwrap_err();
        assert!(matches!(err, TrustError::OcspValidation(_)));
    }

    #[test]
    fn test_unwrapped_nonce_is_accepted() {
        assert!(nonce_matches(&[1, 2, 3], &[1, 2, 3]));
        assert!(nonce_matches(&[0x04, 0x03, 1, 2, 3], &[1, 2, 3]));
        assert!(!nonce_matches(&[0x04, 0x03, 1, 2, 4], &[1, 2, 3]));
    }

    fn client() -> OcspClient {
        #[derive(Debug)]
        struct Silent;

        impl RevocationTransport for Silent {
            fn post_ocsp(&self, url: &Url, _request: &[u8], _timeout: Duration) -> Result<Vec<u8>, TrustError> {
                Err(TrustError::Network(format!("{url} unreachable")))
            }

            fn fetch_crl(&self, url: &Url, _timeout: Duration) -> Result<Vec<u8>, TrustError> {
                Err(TrustError::Network(format!("{url} unreachable")))
            }
        }

        OcspClient::new(&RevocationConfig::default(), Arc::new(Silent))
    }

    #[test]
    fn test_cleanup_drops_expired_answers() {
        let client = client();
        let now = SystemTime::now();
        client.cache_status("stale".to_string(), OcspStatus::Good, now, Some(now - Duration::from_secs(1)));
        client.cache_status("fresh".to_string(), OcspStatus::Revoked, now, Some(now + Duration::from_secs(600)));
        client.cache_status("ttl".to_string(), OcspStatus::Good, now, None);

        client.cleanup_cache();
        assert_eq!(client.cache_size(), 2);
        assert!(client.cached_status("stale").is_none());
    }

    #[test]
    fn test_insert_sweeps_expired_answers_past_threshold() {
        let client = client();
        let now = SystemTime::now();
        let expired = Some(now - Duration::from_secs(1));
        client.cache_status("fresh".to_string(), OcspStatus::Good, now, Some(now + Duration::from_secs(600)));
        for n in 0..CACHE_SWEEP_THRESHOLD {
            client.cache_status(format!("stale-{n}"), OcspStatus::Good, now, expired);
        }

        assert_eq!(client.cache_size(), 1);
        assert!(client.cached_status("fresh").is_some());
    }
}
