//! Key managers: local identity selection during handshakes

use std::sync::Arc;

use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;

use crate::certificate::CertificateInfo;
use crate::error::TrustError;
use crate::secret::SecretBytes;
use crate::store::{sealed, CredentialStore, KeyEncoding, StoreEntry, StoredKey};

#[derive(Debug)]
struct IdentityEntry {
    alias: String,
    certified: Arc<CertifiedKey>,
    /// DER issuer names of every certificate in the chain
    issuers: Vec<Vec<u8>>,
}

/// Presents one of the identity store's certificate/key pairs to a peer
#[derive(Debug)]
pub struct IdentityKeyManager {
    entries: Vec<IdentityEntry>,
}

impl IdentityKeyManager {
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.alias.as_str())
    }

    /// Pick the first entry whose key can sign with one of `schemes`,
    /// preferring entries issued under one of `issuer_hints`
    pub fn choose(&self, schemes: &[SignatureScheme], issuer_hints: &[&[u8]]) -> Option<(&str, Arc<CertifiedKey>)> {
        let mut compatible = self
            .entries
            .iter()
            .filter(|entry| entry.certified.key.choose_scheme(schemes).is_some());

        let chosen = if issuer_hints.is_empty() {
            compatible.next()
        } else {
            let candidates: Vec<&IdentityEntry> = compatible.collect();
            candidates
                .iter()
                .find(|entry| {
                    entry
                        .issuers
                        .iter()
                        .any(|issuer| issuer_hints.contains(&issuer.as_slice()))
                })
                .or_else(|| {
                    tracing::debug!("No identity entry matches the peer's CA hints, using first compatible");
                    candidates.first()
                })
                .copied()
        };

        chosen.map(|entry| (entry.alias.as_str(), entry.certified.clone()))
    }
}

impl ResolvesServerCert for IdentityKeyManager {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.choose(client_hello.signature_schemes(), &[])
            .map(|(alias, key)| {
                tracing::debug!("Presenting server identity '{}'", alias);
                key
            })
    }
}

impl ResolvesClientCert for IdentityKeyManager {
    fn resolve(&self, root_hint_subjects: &[&[u8]], sigschemes: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        self.choose(sigschemes, root_hint_subjects).map(|(alias, key)| {
            tracing::debug!("Presenting client identity '{}'", alias);
            key
        })
    }

    fn has_certs(&self) -> bool {
        !self.entries.is_empty()
    }
}

/// Ordered key managers derived from the identity store
#[derive(Debug, Clone)]
pub struct KeyManagerSet {
    managers: Arc<[Arc<IdentityKeyManager>]>,
}

impl KeyManagerSet {
    /// Recover every private key in `store` and pair it with its chain.
    ///
    /// Keys are loaded through the provider's default key provider so the
    /// supported algorithms follow the platform, not a list fixed here.
    pub fn derive(
        store: &CredentialStore,
        password: Option<&SecretBytes>,
        provider: &CryptoProvider,
    ) -> Result<Self, TrustError> {
        let mut entries = Vec::new();

        for entry in store.private_key_entries() {
            let StoreEntry::PrivateKey { alias, chain, key } = entry else {
                continue;
            };
            let recovery_error = |reason: String| TrustError::KeyRecoveryError {
                alias: alias.clone(),
                reason,
            };

            let key_der = recover_key(key, password).map_err(recovery_error)?;
            let signing_key = provider
                .key_provider
                .load_private_key(key_der)
                .map_err(|e| recovery_error(format!("key rejected by the crypto provider: {e}")))?;

            let certified = CertifiedKey::new(chain.clone(), signing_key);
            match certified.keys_match() {
                Ok(()) | Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => {}
                Err(e) => return Err(recovery_error(format!("key does not match its certificate: {e}"))),
            }

            let issuers = chain
                .iter()
                .filter_map(|cert| CertificateInfo::from_der(cert).ok())
                .map(|info| info.issuer)
                .collect();

            tracing::debug!("Derived key manager entry '{}' ({} certificates)", alias, chain.len());
            entries.push(IdentityEntry {
                alias: alias.clone(),
                certified: Arc::new(certified),
                issuers,
            });
        }

        if entries.is_empty() {
            return Err(TrustError::KeyRecoveryError {
                alias: "*".to_string(),
                reason: "identity store holds no private key entries".to_string(),
            });
        }

        tracing::info!("Derived key managers for {} identity entries", entries.len());
        Ok(Self {
            managers: Arc::from(vec![Arc::new(IdentityKeyManager { entries })]),
        })
    }

    pub fn managers(&self) -> &[Arc<IdentityKeyManager>] {
        &self.managers
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}

impl ResolvesServerCert for KeyManagerSet {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let schemes = client_hello.signature_schemes();
        self.managers
            .iter()
            .find_map(|manager| manager.choose(schemes, &[]).map(|(_, key)| key))
    }
}

impl ResolvesClientCert for KeyManagerSet {
    fn resolve(&self, root_hint_subjects: &[&[u8]], sigschemes: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        self.managers
            .iter()
            .find_map(|manager| ResolvesClientCert::resolve(manager.as_ref(), root_hint_subjects, sigschemes))
    }

    fn has_certs(&self) -> bool {
        self.managers.iter().any(|manager| manager.has_certs())
    }
}

fn recover_key(key: &StoredKey, password: Option<&SecretBytes>) -> Result<PrivateKeyDer<'static>, String> {
    let der = match key.encoding {
        KeyEncoding::Sealed => {
            let sealed_bytes = key.data.expose(<[u8]>::to_vec);
            sealed::open(&sealed_bytes, password).map_err(|e| e.to_string())?
        }
        KeyEncoding::EncryptedPkcs8 => {
            return Err("PBES2-encrypted keys are not supported, store the key as SEALED PRIVATE KEY".to_string());
        }
        _ => key.data.clone(),
    };

    let bytes = der.expose(<[u8]>::to_vec);
    Ok(match key.encoding {
        KeyEncoding::Pkcs1 => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(bytes)),
        KeyEncoding::Sec1 => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(bytes)),
        _ => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(bytes)),
    })
}
