//! Process-wide security policy
//!
//! OCSP support is a property of the whole process, not of one builder or one
//! context. It is switched on once and stays on for the process lifetime.

use std::sync::atomic::{AtomicBool, Ordering};

static OCSP_ENABLED: AtomicBool = AtomicBool::new(false);

/// Handle on the process-global revocation settings
#[derive(Debug, Clone, Copy, Default)]
pub struct SecurityPolicy;

impl SecurityPolicy {
    /// Enable OCSP revocation checking for every verifier in this process.
    ///
    /// Idempotent. Call it once at startup; [`crate::TrustContextBuilder`]
    /// also calls it before deriving any trust manager. Handshakes already in
    /// flight on other threads observe the change at no defined point.
    pub fn enable_revocation_checking() {
        if !OCSP_ENABLED.swap(true, Ordering::SeqCst) {
            tracing::info!("OCSP revocation checking enabled for this process");
        }
    }

    /// Whether OCSP queries may be issued
    pub fn ocsp_enabled() -> bool {
        OCSP_ENABLED.load(Ordering::SeqCst)
    }
}
