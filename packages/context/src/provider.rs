//! Platform default crypto provider resolution

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

use crate::error::TrustError;

/// Resolve the process default [`CryptoProvider`].
///
/// When nothing has been installed yet the `ring` provider becomes the process
/// default, so later callers (and rustls itself) agree on the same one.
pub fn platform_provider() -> Result<Arc<CryptoProvider>, TrustError> {
    if let Some(provider) = CryptoProvider::get_default() {
        return Ok(provider.clone());
    }

    // Losing an install race is fine: someone else's default is read back below
    if rustls::crypto::ring::default_provider().install_default().is_ok() {
        tracing::debug!("Installed ring as the process default crypto provider");
    }

    CryptoProvider::get_default().cloned().ok_or_else(|| {
        TrustError::UnsupportedAlgorithm("no process default crypto provider is available".to_string())
    })
}
