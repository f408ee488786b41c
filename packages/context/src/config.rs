//! Store and revocation configuration

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{StoreRole, TrustError};
use crate::secret::SecretBytes;

/// Property keys understood by [`TrustContextConfig::from_properties`]
pub const KEYSTORE: &str = "security.keystore";
pub const KEYSTORE_PASSWD: &str = "security.keystorePasswd";
pub const KEYSTORE_TYPE: &str = "security.keystoreType";
pub const TRUSTSTORE: &str = "security.truststore";
pub const TRUSTSTORE_PASSWD: &str = "security.truststorePasswd";
pub const TRUSTSTORE_TYPE: &str = "security.truststoreType";

/// Store formats the loader understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    /// Plain PEM blocks: certificates, private keys, CRLs
    Pem,
    /// A PEM store sealed under the store password with AES-256-GCM
    Sealed,
}

impl StoreType {
    /// Parse a declared store type, case-insensitively
    pub fn parse(role: StoreRole, value: &str) -> Result<Self, TrustError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PEM" => Ok(StoreType::Pem),
            "SEALED" => Ok(StoreType::Sealed),
            _ => Err(TrustError::UnsupportedStoreType {
                role,
                store_type: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreType::Pem => f.write_str("PEM"),
            StoreType::Sealed => f.write_str("SEALED"),
        }
    }
}

/// Location, password and declared type of one credential store
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub password: Option<SecretBytes>,
    /// Declared type as supplied; validated when the store is loaded
    #[serde(rename = "type")]
    pub store_type: String,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>, password: Option<&str>, store_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            password: SecretBytes::from_password(password),
            store_type: store_type.into(),
        }
    }
}

/// Revocation checking knobs.
///
/// None of these can turn revocation checking off: a certificate whose
/// status cannot be established is always rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    /// Timeout for one OCSP request
    #[serde(with = "duration_secs")]
    pub ocsp_timeout: Duration,
    /// Timeout for one CRL download
    #[serde(with = "duration_secs")]
    pub crl_timeout: Duration,
    /// Cache lifetime for OCSP answers without a nextUpdate
    #[serde(with = "duration_secs")]
    pub ocsp_cache_ttl: Duration,
    /// Cache lifetime for downloaded CRLs without a nextUpdate
    #[serde(with = "duration_secs")]
    pub crl_cache_ttl: Duration,
    /// CRL files (PEM or DER) consulted before any distribution point
    pub crl_paths: Vec<PathBuf>,
    /// Send every OCSP request here instead of the certificate's AIA URL
    pub ocsp_responder_override: Option<Url>,
    /// Upper bound on OCSP and CRL response bodies
    pub max_response_bytes: usize,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            ocsp_timeout: Duration::from_secs(10),
            crl_timeout: Duration::from_secs(30),
            ocsp_cache_ttl: Duration::from_secs(3600),
            crl_cache_ttl: Duration::from_secs(24 * 3600),
            crl_paths: Vec::new(),
            ocsp_responder_override: None,
            max_response_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Everything the builder needs: both stores plus revocation settings
#[derive(Debug, Clone, Deserialize)]
pub struct TrustContextConfig {
    pub identity: StoreConfig,
    pub trust: StoreConfig,
    #[serde(default)]
    pub revocation: RevocationConfig,
}

impl TrustContextConfig {
    /// Build from the six configuration strings
    pub fn from_strings(
        keystore: &str,
        keystore_password: Option<&str>,
        keystore_type: &str,
        truststore: &str,
        truststore_password: Option<&str>,
        truststore_type: &str,
    ) -> Self {
        Self {
            identity: StoreConfig::new(keystore, keystore_password, keystore_type),
            trust: StoreConfig::new(truststore, truststore_password, truststore_type),
            revocation: RevocationConfig::default(),
        }
    }

    /// Build from a property map using the `security.*` keys.
    ///
    /// Paths and types are required; passwords may be absent.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, TrustError> {
        let required = |key: &'static str| {
            properties
                .get(key)
                .map(String::as_str)
                .filter(|value| !value.trim().is_empty())
                .ok_or(TrustError::MissingProperty(key))
        };
        let optional = |key: &str| properties.get(key).map(String::as_str);

        Ok(Self::from_strings(
            required(KEYSTORE)?,
            optional(KEYSTORE_PASSWD),
            required(KEYSTORE_TYPE)?,
            required(TRUSTSTORE)?,
            optional(TRUSTSTORE_PASSWD),
            required(TRUSTSTORE_TYPE)?,
        ))
    }

    #[must_use]
    pub fn with_revocation(mut self, revocation: RevocationConfig) -> Self {
        self.revocation = revocation;
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
