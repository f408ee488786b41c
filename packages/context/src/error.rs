//! Error types for store loading, manager derivation and peer validation

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Which of the two credential stores an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    /// Keystore holding the local certificate chain and private key
    Identity,
    /// Truststore holding the anchor certificates
    Trust,
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreRole::Identity => f.write_str("identity"),
            StoreRole::Trust => f.write_str("trust"),
        }
    }
}

/// Errors produced while building trust material or validating peers
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("{role} store not found at {}", path.display())]
    StoreNotFound {
        role: StoreRole,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{role} store at {} could not be read: {source}", path.display())]
    StoreRead {
        role: StoreRole,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{role} store at {} is not a valid {store_type} store: {reason}", path.display())]
    StoreFormatError {
        role: StoreRole,
        path: PathBuf,
        store_type: String,
        reason: String,
    },
    #[error("{role} store type '{store_type}' is not supported")]
    UnsupportedStoreType { role: StoreRole, store_type: String },
    #[error("private key '{alias}' in the identity store could not be recovered: {reason}")]
    KeyRecoveryError { alias: String, reason: String },
    #[error("no default key-management algorithm available: {0}")]
    UnsupportedAlgorithm(String),
    #[error("trust store holds no usable trust anchors: {0}")]
    InvalidTrustAnchor(String),
    #[error("certificate path validation could not be configured: {0}")]
    PathValidationConfigError(String),
    #[error("TLS context initialization failed: {0}")]
    ContextInitError(String),
    #[error("protocol '{0}' is not supported by the crypto provider")]
    NoSuchAlgorithm(String),
    #[error("certificate validation failed: {0}")]
    CertificateValidationFailure(ValidationFailure),
    #[error("required property '{0}' is missing")]
    MissingProperty(&'static str),
    #[error("Certificate parsing failed: {0}")]
    CertificateParsing(String),
    #[error("OCSP validation failed: {0}")]
    OcspValidation(String),
    #[error("CRL validation failed: {0}")]
    CrlValidation(String),
    #[error("Network error during validation: {0}")]
    Network(String),
}

/// Why a peer certificate chain was rejected during a handshake
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    /// PKIX path building or validation against the anchors failed
    #[error("untrusted certificate chain: {0}")]
    Untrusted(String),
    /// A certificate in the path is revoked
    #[error("certificate '{subject}' is revoked ({source_kind})")]
    Revoked {
        subject: String,
        source_kind: RevocationSource,
    },
    /// No revocation source produced a definitive answer
    #[error("revocation status of '{subject}' could not be determined: {detail}")]
    RevocationUndetermined { subject: String, detail: String },
}

/// Where a revocation verdict came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationSource {
    StapledOcsp,
    Ocsp,
    LocalCrl,
    DistributionPointCrl,
}

impl fmt::Display for RevocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevocationSource::StapledOcsp => f.write_str("stapled OCSP response"),
            RevocationSource::Ocsp => f.write_str("OCSP"),
            RevocationSource::LocalCrl => f.write_str("local CRL"),
            RevocationSource::DistributionPointCrl => f.write_str("CRL distribution point"),
        }
    }
}

impl ValidationFailure {
    /// Recover the validation failure carried by a handshake error, if any.
    ///
    /// The verifiers in this crate report every rejection as
    /// `CertificateError::Other` wrapping a [`TrustError::CertificateValidationFailure`].
    pub fn from_tls_error(error: &rustls::Error) -> Option<ValidationFailure> {
        match error {
            rustls::Error::InvalidCertificate(rustls::CertificateError::Other(other)) => {
                match other.0.downcast_ref::<TrustError>() {
                    Some(TrustError::CertificateValidationFailure(failure)) => Some(failure.clone()),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    pub(crate) fn into_tls_error(self) -> rustls::Error {
        let error: Arc<dyn std::error::Error + Send + Sync> =
            Arc::new(TrustError::CertificateValidationFailure(self));
        rustls::Error::InvalidCertificate(rustls::CertificateError::Other(rustls::OtherError(
            error,
        )))
    }
}
