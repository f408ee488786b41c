//! Revocation checking
//!
//! Sources are consulted in a fixed order and the first definitive answer
//! wins: a stapled OCSP response, the OCSP responder, local CRLs, then the
//! CRL distribution points. When every source is inconclusive the
//! certificate is treated as unverifiable and rejected.

pub mod crl;
pub mod ocsp;
mod signature;
pub mod transport;

use std::sync::Arc;
use std::time::SystemTime;

pub use crl::{CrlCache, CrlStatus, LocalCrls};
pub use ocsp::{OcspClient, OcspStatus};
pub use transport::{HttpTransport, RevocationTransport};

use crate::certificate::CertificateInfo;
use crate::config::RevocationConfig;
use crate::error::{RevocationSource, TrustError, ValidationFailure};
use crate::policy::SecurityPolicy;

/// What one source had to say about a certificate
enum Verdict {
    Good,
    Revoked,
    Inconclusive(String),
}

impl From<OcspStatus> for Verdict {
    fn from(status: OcspStatus) -> Self {
        match status {
            OcspStatus::Good => Verdict::Good,
            OcspStatus::Revoked => Verdict::Revoked,
            OcspStatus::Unknown => Verdict::Inconclusive("responder does not know the certificate".to_string()),
        }
    }
}

impl From<CrlStatus> for Verdict {
    fn from(status: CrlStatus) -> Self {
        match status {
            CrlStatus::Valid => Verdict::Good,
            CrlStatus::Revoked => Verdict::Revoked,
        }
    }
}

impl<T: Into<Verdict>> From<Result<T, TrustError>> for Verdict {
    fn from(result: Result<T, TrustError>) -> Self {
        match result {
            Ok(status) => status.into(),
            Err(e) => Verdict::Inconclusive(e.to_string()),
        }
    }
}

/// Hit/miss counters and current sizes of the revocation caches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevocationStats {
    pub ocsp_hits: usize,
    pub ocsp_misses: usize,
    pub ocsp_cached: usize,
    pub crl_hits: usize,
    pub crl_misses: usize,
    pub crl_cached: usize,
}

/// Fail-closed revocation policy shared by every verifier of a builder
#[derive(Debug, Clone)]
pub struct RevocationChecker {
    ocsp: OcspClient,
    local_crls: LocalCrls,
    crl_cache: CrlCache,
}

impl RevocationChecker {
    /// Build the checker; local CRL files are read and parsed here so a bad
    /// file fails construction instead of the first handshake
    pub fn new(
        config: &RevocationConfig,
        store_crls: &[Vec<u8>],
        transport: Arc<dyn RevocationTransport>,
    ) -> Result<Self, TrustError> {
        let local_crls = LocalCrls::load(config.crl_paths.as_slice(), store_crls)
            .map_err(|e| TrustError::PathValidationConfigError(e.to_string()))?;
        if local_crls.is_empty() {
            tracing::debug!("No local CRLs; relying on OCSP and distribution points");
        }

        Ok(Self {
            ocsp: OcspClient::new(config, transport.clone()),
            local_crls,
            crl_cache: CrlCache::new(config, transport),
        })
    }

    /// Establish the revocation status of `cert`, issued by `issuer`.
    ///
    /// `Ok` names the source that vouched for the certificate.
    pub fn check(
        &self,
        cert: &CertificateInfo,
        issuer: &CertificateInfo,
        stapled_ocsp: Option<&[u8]>,
        now: SystemTime,
    ) -> Result<RevocationSource, ValidationFailure> {
        let mut reasons = Vec::new();

        if let Some(response) = stapled_ocsp.filter(|response| !response.is_empty()) {
            let verdict = self.ocsp.evaluate_stapled(response, cert, issuer, now).into();
            if let Some(decided) = decide(cert, RevocationSource::StapledOcsp, verdict, &mut reasons) {
                return decided;
            }
        }

        if SecurityPolicy::ocsp_enabled() {
            let verdict = self.ocsp.check(cert, issuer, now).into();
            if let Some(decided) = decide(cert, RevocationSource::Ocsp, verdict, &mut reasons) {
                return decided;
            }
        } else {
            reasons.push("OCSP: revocation checking is not enabled".to_string());
        }

        let verdict = match self.local_crls.check(cert, issuer, now) {
            Some(result) => result.into(),
            None => Verdict::Inconclusive("none issued by the certificate's issuer".to_string()),
        };
        if let Some(decided) = decide(cert, RevocationSource::LocalCrl, verdict, &mut reasons) {
            return decided;
        }

        let verdict = self.crl_cache.check(cert, issuer, now).into();
        if let Some(decided) = decide(cert, RevocationSource::DistributionPointCrl, verdict, &mut reasons) {
            return decided;
        }

        tracing::warn!(
            "Revocation status of '{}' undetermined: {}",
            cert.display_name(),
            reasons.join("; ")
        );
        Err(ValidationFailure::RevocationUndetermined {
            subject: cert.display_name(),
            detail: reasons.join("; "),
        })
    }

    pub fn stats(&self) -> RevocationStats {
        let (ocsp_hits, ocsp_misses) = self.ocsp.stats();
        let (crl_hits, crl_misses) = self.crl_cache.stats();
        RevocationStats {
            ocsp_hits,
            ocsp_misses,
            ocsp_cached: self.ocsp.cache_size(),
            crl_hits,
            crl_misses,
            crl_cached: self.crl_cache.cache_size(),
        }
    }

    /// Drop expired OCSP answers and downloaded CRLs
    pub fn cleanup_caches(&self) {
        self.ocsp.cleanup_cache();
        self.crl_cache.cleanup_cache();
    }
}

fn decide(
    cert: &CertificateInfo,
    source: RevocationSource,
    verdict: Verdict,
    reasons: &mut Vec<String>,
) -> Option<Result<RevocationSource, ValidationFailure>> {
    match verdict {
        Verdict::Good => {
            tracing::debug!("'{}' is not revoked according to {}", cert.display_name(), source);
            Some(Ok(source))
        }
        Verdict::Revoked => {
            tracing::error!("'{}' is revoked according to {}", cert.display_name(), source);
            Some(Err(ValidationFailure::Revoked {
                subject: cert.display_name(),
                source_kind: source,
            }))
        }
        Verdict::Inconclusive(reason) => {
            tracing::debug!("{} inconclusive for '{}': {}", source, cert.display_name(), reason);
            reasons.push(format!("{source}: {reason}"));
            None
        }
    }
}
