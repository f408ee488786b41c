//! Trust managers: peer-chain validation derived from the trust store

pub mod path;
mod verifier;

use std::sync::Arc;

use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;

pub use verifier::{PeerRole, RevocationEnforcingVerifier};

use crate::certificate::CertificateInfo;
use crate::error::TrustError;
use crate::revocation::{RevocationChecker, RevocationStats};
use crate::store::CredentialStore;

/// Ordered trust managers derived from the trust store
#[derive(Debug, Clone)]
pub struct TrustManagerSet {
    managers: Arc<[Arc<RevocationEnforcingVerifier>]>,
}

impl TrustManagerSet {
    /// Build revocation-enforcing verifiers over every trusted certificate
    /// in `store`.
    ///
    /// Anchors the platform rejects are skipped; a store that leaves no
    /// usable anchor is an error.
    pub fn derive(
        store: &CredentialStore,
        provider: Arc<CryptoProvider>,
        checker: RevocationChecker,
    ) -> Result<Self, TrustError> {
        let mut roots = RootCertStore::empty();
        let mut anchors = Vec::new();

        for (alias, certificate) in store.trusted_certificates() {
            let info = match CertificateInfo::from_der(certificate) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!("Skipping trust anchor '{}': {}", alias, e);
                    continue;
                }
            };
            if let Err(e) = roots.add(certificate.clone()) {
                tracing::warn!("Skipping trust anchor '{}': {}", alias, e);
                continue;
            }
            tracing::debug!("Added trust anchor '{}'", alias);
            anchors.push(info);
        }

        if roots.is_empty() {
            return Err(TrustError::InvalidTrustAnchor(format!(
                "none of the {} entries of the {} store is a usable trust anchor",
                store.entries().len(),
                store.role()
            )));
        }

        let roots = Arc::new(roots);
        let client_inner = WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
            .build()
            .map_err(|e| TrustError::PathValidationConfigError(format!("client verifier: {e}")))?;
        let server_inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| TrustError::PathValidationConfigError(format!("server verifier: {e}")))?;

        tracing::info!("Derived trust managers over {} trust anchors", anchors.len());
        let verifier = RevocationEnforcingVerifier::new(
            client_inner,
            server_inner,
            Arc::from(anchors),
            Arc::new(checker),
        );
        Ok(Self {
            managers: Arc::from(vec![Arc::new(verifier)]),
        })
    }

    pub fn managers(&self) -> &[Arc<RevocationEnforcingVerifier>] {
        &self.managers
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Verifier for server contexts; client authentication is mandatory
    pub fn client_verifier(&self) -> Result<Arc<dyn ClientCertVerifier>, TrustError> {
        let primary = self.primary()?;
        Ok(primary)
    }

    /// Verifier for client contexts
    pub fn server_verifier(&self) -> Result<Arc<dyn ServerCertVerifier>, TrustError> {
        let primary = self.primary()?;
        Ok(primary)
    }

    /// Validate a peer chain for `role` as a handshake would, revocation
    /// included
    pub fn validate_chain(
        &self,
        role: &PeerRole,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<(), TrustError> {
        self.primary()?
            .validate(role, end_entity, intermediates, UnixTime::now())
            .map_err(TrustError::CertificateValidationFailure)
    }

    /// Cache counters of the shared revocation checker
    pub fn revocation_stats(&self) -> RevocationStats {
        self.managers
            .first()
            .map(|manager| manager.checker().stats())
            .unwrap_or_default()
    }

    /// Drop expired OCSP answers and downloaded CRLs
    pub fn cleanup_revocation_caches(&self) {
        for manager in self.managers.iter() {
            manager.checker().cleanup_caches();
        }
    }

    fn primary(&self) -> Result<Arc<RevocationEnforcingVerifier>, TrustError> {
        self.managers
            .first()
            .cloned()
            .ok_or_else(|| TrustError::PathValidationConfigError("no trust manager available".to_string()))
    }
}
