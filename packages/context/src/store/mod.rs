//! Credential-store loading
//!
//! A store is read fully into memory, the file handle is released, and only
//! then is the content parsed under the declared type. Parsing never leaves
//! partial state behind: either a complete [`CredentialStore`] comes back or
//! an error naming the store and the reason.

pub mod sealed;

use std::io::ErrorKind;
use std::path::Path;

use rustls::pki_types::CertificateDer;

use crate::certificate::CertificateInfo;
use crate::config::{StoreConfig, StoreType};
use crate::error::{StoreRole, TrustError};
use crate::secret::SecretBytes;

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const CRL_TAG: &str = "X509 CRL";

/// Encoding of a private key as found in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    Pkcs8,
    Pkcs1,
    Sec1,
    /// PKCS#8 sealed under the store password
    Sealed,
    /// PKCS#5/PBES2-encrypted PKCS#8, which this crate does not decrypt
    EncryptedPkcs8,
}

/// Private key bytes as stored, not yet recovered
#[derive(Debug, Clone)]
pub struct StoredKey {
    pub encoding: KeyEncoding,
    pub data: SecretBytes,
}

/// One entry of a credential store
#[derive(Debug, Clone)]
pub enum StoreEntry {
    /// A private key with its certificate chain, leaf first
    PrivateKey {
        alias: String,
        chain: Vec<CertificateDer<'static>>,
        key: StoredKey,
    },
    /// A certificate trusted on its own
    TrustedCertificate {
        alias: String,
        certificate: CertificateDer<'static>,
    },
}

impl StoreEntry {
    pub fn alias(&self) -> &str {
        match self {
            StoreEntry::PrivateKey { alias, .. } | StoreEntry::TrustedCertificate { alias, .. } => alias,
        }
    }
}

/// In-memory contents of an identity or trust store
#[derive(Debug, Clone)]
pub struct CredentialStore {
    role: StoreRole,
    store_type: StoreType,
    entries: Vec<StoreEntry>,
    crls: Vec<Vec<u8>>,
}

impl CredentialStore {
    /// Load and parse the store described by `config`
    pub fn load(role: StoreRole, config: &StoreConfig) -> Result<Self, TrustError> {
        let store_type = StoreType::parse(role, &config.store_type)?;
        let bytes = read_store(role, &config.path)?;

        let format_error = |reason: String| TrustError::StoreFormatError {
            role,
            path: config.path.clone(),
            store_type: store_type.to_string(),
            reason,
        };

        let store = match store_type {
            StoreType::Pem => {
                let store = parse_pem_store(role, store_type, &bytes).map_err(format_error)?;
                if config.password.is_some() && !store.holds_sealed_key() {
                    return Err(format_error(
                        "a password was supplied but nothing in the PEM store is sealed".to_string(),
                    ));
                }
                store
            }
            StoreType::Sealed => {
                let plaintext = sealed::open(&bytes, config.password.as_ref())
                    .map_err(|e| format_error(e.to_string()))?;
                plaintext
                    .expose(|pem| parse_pem_store(role, store_type, pem))
                    .map_err(format_error)?
            }
        };

        for entry in &store.entries {
            tracing::debug!("{} store entry '{}'", role, entry.alias());
        }
        tracing::info!(
            "Loaded {} store from {} ({} entries, {} CRLs)",
            role,
            config.path.display(),
            store.entries.len(),
            store.crls.len()
        );
        Ok(store)
    }

    pub fn role(&self) -> StoreRole {
        self.role
    }

    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    pub fn entries(&self) -> &[StoreEntry] {
        &self.entries
    }

    /// DER-encoded CRLs carried in the store
    pub fn crls(&self) -> &[Vec<u8>] {
        &self.crls
    }

    pub fn private_key_entries(&self) -> impl Iterator<Item = &StoreEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, StoreEntry::PrivateKey { .. }))
    }

    fn holds_sealed_key(&self) -> bool {
        self.entries.iter().any(|entry| {
            matches!(
                entry,
                StoreEntry::PrivateKey { key, .. } if key.encoding == KeyEncoding::Sealed
            )
        })
    }

    pub fn trusted_certificates(&self) -> impl Iterator<Item = (&str, &CertificateDer<'static>)> {
        self.entries.iter().filter_map(|entry| match entry {
            StoreEntry::TrustedCertificate { alias, certificate } => Some((alias.as_str(), certificate)),
            StoreEntry::PrivateKey { .. } => None,
        })
    }
}

fn read_store(role: StoreRole, path: &Path) -> Result<Vec<u8>, TrustError> {
    // fs::read opens, reads to completion and closes before returning
    std::fs::read(path).map_err(|source| match source.kind() {
        ErrorKind::NotFound => TrustError::StoreNotFound {
            role,
            path: path.to_path_buf(),
            source,
        },
        _ => TrustError::StoreRead {
            role,
            path: path.to_path_buf(),
            source,
        },
    })
}

fn key_encoding(tag: &str) -> Option<KeyEncoding> {
    match tag {
        "PRIVATE KEY" => Some(KeyEncoding::Pkcs8),
        "RSA PRIVATE KEY" => Some(KeyEncoding::Pkcs1),
        "EC PRIVATE KEY" => Some(KeyEncoding::Sec1),
        sealed::SEALED_KEY_TAG => Some(KeyEncoding::Sealed),
        "ENCRYPTED PRIVATE KEY" => Some(KeyEncoding::EncryptedPkcs8),
        _ => None,
    }
}

fn parse_pem_store(role: StoreRole, store_type: StoreType, bytes: &[u8]) -> Result<CredentialStore, String> {
    if sealed::is_sealed(bytes) {
        return Err("content is a sealed container, declare the store as SEALED".to_string());
    }
    let blocks = pem::parse_many(bytes).map_err(|e| format!("invalid PEM: {e}"))?;
    if blocks.is_empty() {
        return Err("no PEM blocks found".to_string());
    }

    let mut entries = Vec::new();
    let mut crls = Vec::new();
    let mut pending: Vec<CertificateDer<'static>> = Vec::new();

    for (index, block) in blocks.into_iter().enumerate() {
        let tag = block.tag().to_string();
        if tag == CERTIFICATE_TAG {
            let cert = CertificateDer::from(block.into_contents());
            CertificateInfo::from_der(&cert).map_err(|e| format!("block {index}: {e}"))?;
            pending.push(cert);
        } else if tag == CRL_TAG {
            crls.push(block.into_contents());
        } else if let Some(encoding) = key_encoding(&tag) {
            if pending.is_empty() {
                return Err(format!("block {index}: private key without a certificate chain"));
            }
            let chain = std::mem::take(&mut pending);
            let alias = alias_for(&chain[0], entries.len());
            entries.push(StoreEntry::PrivateKey {
                alias,
                chain,
                key: StoredKey {
                    encoding,
                    data: SecretBytes::new(block.into_contents()),
                },
            });
        } else {
            return Err(format!("block {index}: unexpected PEM block '{tag}'"));
        }
    }

    for certificate in pending {
        let alias = alias_for(&certificate, entries.len());
        entries.push(StoreEntry::TrustedCertificate { alias, certificate });
    }

    Ok(CredentialStore {
        role,
        store_type,
        entries,
        crls,
    })
}

fn alias_for(cert: &CertificateDer<'_>, index: usize) -> String {
    CertificateInfo::from_der(cert)
        .ok()
        .and_then(|info| info.common_name)
        .unwrap_or_else(|| format!("entry-{index}"))
}
