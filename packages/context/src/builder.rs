//! TLS context factory

use std::collections::HashMap;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, ServerConfig};

use crate::config::TrustContextConfig;
use crate::context::TlsContext;
use crate::error::{StoreRole, TrustError};
use crate::keys::KeyManagerSet;
use crate::policy::SecurityPolicy;
use crate::provider::platform_provider;
use crate::revocation::{HttpTransport, RevocationChecker, RevocationTransport};
use crate::store::CredentialStore;
use crate::trust::TrustManagerSet;

/// Loads both stores once, derives the managers, then hands out any number
/// of [`TlsContext`]s built on them.
///
/// Construction either yields a ready builder or fails with the first error;
/// there is no half-initialized builder.
#[derive(Debug, Clone)]
pub struct TrustContextBuilder {
    provider: Arc<CryptoProvider>,
    key_managers: KeyManagerSet,
    trust_managers: TrustManagerSet,
}

impl TrustContextBuilder {
    /// Build with the HTTP revocation transport
    pub fn new(config: &TrustContextConfig) -> Result<Self, TrustError> {
        let transport = Arc::new(HttpTransport::new(config.revocation.max_response_bytes));
        Self::with_transport(config, transport)
    }

    /// Build from a `security.*` property map
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, TrustError> {
        Self::new(&TrustContextConfig::from_properties(properties)?)
    }

    /// Build with a caller-supplied revocation transport
    pub fn with_transport(
        config: &TrustContextConfig,
        transport: Arc<dyn RevocationTransport>,
    ) -> Result<Self, TrustError> {
        SecurityPolicy::enable_revocation_checking();
        let provider = platform_provider()?;

        let identity = CredentialStore::load(StoreRole::Identity, &config.identity)?;
        let key_managers = KeyManagerSet::derive(&identity, config.identity.password.as_ref(), &provider)?;
        drop(identity);

        let trust = CredentialStore::load(StoreRole::Trust, &config.trust)?;
        let checker = RevocationChecker::new(&config.revocation, trust.crls(), transport)?;
        let trust_managers = TrustManagerSet::derive(&trust, provider.clone(), checker)?;

        tracing::info!(
            "Trust context builder ready: identity {}, trust {}",
            config.identity.path.display(),
            config.trust.path.display()
        );
        Ok(Self {
            provider,
            key_managers,
            trust_managers,
        })
    }

    pub fn key_managers(&self) -> &KeyManagerSet {
        &self.key_managers
    }

    pub fn trust_managers(&self) -> &TrustManagerSet {
        &self.trust_managers
    }

    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }

    /// Evict expired revocation answers shared by every context of this
    /// builder; long-running services call this periodically
    pub fn cleanup_revocation_caches(&self) {
        self.trust_managers.cleanup_revocation_caches();
    }

    /// Create a fresh TLS context with mandatory client authentication.
    ///
    /// Each call returns an independent context; the builder is unchanged.
    pub fn create_context(&self) -> Result<TlsContext, TrustError> {
        let mut sample = [0u8; 32];
        self.provider
            .secure_random
            .fill(&mut sample)
            .map_err(|e| TrustError::ContextInitError(format!("secure random source unavailable: {e:?}")))?;

        let client_verifier = self.trust_managers.client_verifier()?;
        let need_client_auth = client_verifier.client_auth_mandatory();
        let server_config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(rustls::DEFAULT_VERSIONS)
            .map_err(|e| {
                tracing::error!("No TLS protocol version available: {}", e);
                TrustError::NoSuchAlgorithm(TlsContext::PROTOCOL.to_string())
            })?
            .with_client_cert_verifier(client_verifier)
            .with_cert_resolver(Arc::new(self.key_managers.clone()));

        let client_config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(rustls::DEFAULT_VERSIONS)
            .map_err(|_| TrustError::NoSuchAlgorithm(TlsContext::PROTOCOL.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(self.trust_managers.server_verifier()?)
            .with_client_cert_resolver(Arc::new(self.key_managers.clone()));

        tracing::debug!("Created TLS context (client authentication required: {})", need_client_auth);
        Ok(TlsContext::new(server_config, client_config, need_client_auth))
    }
}
