//! Certificate revocation lists: local files and distribution-point downloads

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use url::Url;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::revocation_list::CertificateRevocationList;
use x509_parser::{parse_x509_certificate, parse_x509_crl};

use super::transport::RevocationTransport;
use crate::certificate::CertificateInfo;
use crate::config::RevocationConfig;
use crate::error::TrustError;

/// Caches sweep expired entries once they grow past this many
const CACHE_SWEEP_THRESHOLD: usize = 256;

/// Outcome of consulting a CRL that covers the certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrlStatus {
    Valid,
    Revoked,
}

/// What the issuingDistributionPoint extension says the CRL covers.
///
/// A CRL without the extension is complete: every certificate of its
/// issuer, every reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CrlScope {
    distribution_points: Vec<String>,
    only_user_certs: bool,
    only_ca_certs: bool,
    only_attribute_certs: bool,
    only_some_reasons: bool,
    indirect: bool,
}

impl CrlScope {
    fn from_crl(crl: &CertificateRevocationList<'_>) -> Result<Self, String> {
        let mut scope = CrlScope::default();
        for ext in crl.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::IssuingDistributionPoint(idp) => {
                    if let Some(DistributionPointName::FullName(names)) = &idp.distribution_point {
                        for name in names {
                            if let GeneralName::URI(uri) = name {
                                scope.distribution_points.push((*uri).to_string());
                            }
                        }
                    }
                    scope.only_user_certs = idp.only_contains_user_certs;
                    scope.only_ca_certs = idp.only_contains_ca_certs;
                    scope.only_attribute_certs = idp.only_contains_attribute_certs;
                    scope.only_some_reasons = idp.only_some_reasons.is_some();
                    scope.indirect = idp.indirect_crl;
                }
                _ if ext.critical => {
                    return Err(format!("unsupported critical CRL extension {}", ext.oid.to_id_string()));
                }
                _ => {}
            }
        }
        Ok(scope)
    }

    /// Whether certificates like `cert` are within this CRL's scope at all
    fn includes(&self, cert: &CertificateInfo) -> bool {
        if self.only_attribute_certs || (self.only_user_certs && cert.is_ca) || (self.only_ca_certs && !cert.is_ca) {
            return false;
        }
        self.distribution_points.is_empty()
            || cert
                .crl_urls
                .iter()
                .any(|url| self.distribution_points.contains(url))
    }

    /// A CRL fetched from `url` must name that distribution point if it names any
    fn served_from(&self, url: &str) -> bool {
        self.distribution_points.is_empty() || self.distribution_points.iter().any(|point| point == url)
    }
}

/// A parsed CRL; the DER is kept so the signature can be checked against
/// whichever issuer the CRL ends up applied to
#[derive(Debug, Clone)]
pub(crate) struct CrlRecord {
    der: Vec<u8>,
    issuer: Vec<u8>,
    next_update: Option<SystemTime>,
    revoked_serials: HashSet<Vec<u8>>,
    /// `Err` holds why the CRL cannot be relied on
    scope: Result<CrlScope, String>,
    cached_at: SystemTime,
}

impl CrlRecord {
    /// Parse a PEM or DER CRL
    pub(crate) fn parse(bytes: &[u8]) -> Result<Self, TrustError> {
        let der = if bytes.starts_with(b"-----BEGIN") {
            pem::parse_many(bytes)
                .map_err(|e| TrustError::CrlValidation(format!("Invalid PEM: {e}")))?
                .into_iter()
                .find(|block| block.tag() == "X509 CRL")
                .map(|block| block.into_contents())
                .ok_or_else(|| TrustError::CrlValidation("No CRL data found in PEM".to_string()))?
        } else {
            bytes.to_vec()
        };

        let (_, crl) = parse_x509_crl(&der)
            .map_err(|e| TrustError::CrlValidation(format!("CRL parsing failed: {e}")))?;

        let revoked_serials = crl
            .iter_revoked_certificates()
            .map(|revoked| normalize_serial(revoked.raw_serial()).to_vec())
            .collect();
        let next_update = crl
            .next_update()
            .map(|time| SystemTime::UNIX_EPOCH + Duration::from_secs(time.timestamp().max(0) as u64));
        let issuer = crl.issuer().as_raw().to_vec();
        let scope = CrlScope::from_crl(&crl);

        Ok(Self {
            issuer,
            next_update,
            revoked_serials,
            scope,
            cached_at: SystemTime::now(),
            der,
        })
    }

    /// Issued by the certificate's issuer and scoped to include it
    fn covers(&self, cert: &CertificateInfo) -> bool {
        if self.issuer != cert.issuer {
            return false;
        }
        match &self.scope {
            Ok(scope) => scope.includes(cert),
            // Unusable, but still the issuer's word: surface it as an error
            Err(_) => true,
        }
    }

    fn verify(&self, issuer: &CertificateInfo) -> Result<(), TrustError> {
        let (_, crl) = parse_x509_crl(&self.der)
            .map_err(|e| TrustError::CrlValidation(format!("CRL parsing failed: {e}")))?;
        let (_, issuer_cert) = parse_x509_certificate(issuer.der().as_ref())
            .map_err(|e| TrustError::CrlValidation(format!("Issuer parsing failed: {e}")))?;
        crl.verify_signature(issuer_cert.public_key()).map_err(|e| {
            TrustError::CrlValidation(format!(
                "CRL signature does not verify under '{}': {e}",
                issuer.display_name()
            ))
        })
    }

    fn is_stale(&self, now: SystemTime) -> bool {
        self.next_update.is_some_and(|next_update| now > next_update)
    }

    /// Verify the record against `issuer` and look `cert` up in it
    fn status_of(&self, cert: &CertificateInfo, issuer: &CertificateInfo, now: SystemTime) -> Result<CrlStatus, TrustError> {
        let scope = self.scope.as_ref().map_err(|reason| {
            TrustError::CrlValidation(format!("CRL from '{}' is unusable: {reason}", issuer.display_name()))
        })?;
        self.verify(issuer)?;
        if self.is_stale(now) {
            return Err(TrustError::CrlValidation(format!(
                "CRL from '{}' is past its nextUpdate",
                issuer.display_name()
            )));
        }
        if scope.indirect {
            return Err(TrustError::CrlValidation(format!(
                "indirect CRL from '{}' is not supported",
                issuer.display_name()
            )));
        }
        if self.revoked_serials.contains(normalize_serial(&cert.serial)) {
            Ok(CrlStatus::Revoked)
        } else if scope.only_some_reasons {
            Err(TrustError::CrlValidation(format!(
                "CRL from '{}' covers only some revocation reasons",
                issuer.display_name()
            )))
        } else {
            Ok(CrlStatus::Valid)
        }
    }
}

/// Serial numbers compare by value; drop DER sign padding
fn normalize_serial(serial: &[u8]) -> &[u8] {
    let leading = serial.iter().take_while(|byte| **byte == 0).count();
    &serial[leading.min(serial.len().saturating_sub(1))..]
}

/// CRLs supplied up front: configured files and those carried in the trust store
#[derive(Debug, Clone, Default)]
pub struct LocalCrls {
    records: Vec<CrlRecord>,
}

impl LocalCrls {
    pub fn load(paths: &[impl AsRef<Path>], store_crls: &[Vec<u8>]) -> Result<Self, TrustError> {
        let mut records = Vec::with_capacity(paths.len() + store_crls.len());
        for path in paths {
            let path = path.as_ref();
            let bytes = std::fs::read(path)
                .map_err(|e| TrustError::CrlValidation(format!("Failed to read CRL {}: {e}", path.display())))?;
            let record = CrlRecord::parse(&bytes)
                .map_err(|e| TrustError::CrlValidation(format!("{}: {e}", path.display())))?;
            records.push(record);
        }
        for der in store_crls {
            records.push(CrlRecord::parse(der)?);
        }
        if !records.is_empty() {
            tracing::info!("Loaded {} local CRLs", records.len());
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `None` when no local CRL issued by the certificate's issuer has it in
    /// scope.
    ///
    /// Every covering CRL is consulted and a revocation in any of them wins.
    /// A CRL that fails verification or has gone stale is skipped; if every
    /// covering CRL is unusable the last error is returned.
    pub fn check(&self, cert: &CertificateInfo, issuer: &CertificateInfo, now: SystemTime) -> Option<Result<CrlStatus, TrustError>> {
        let mut verdict = None;
        let mut last_error = None;
        for record in self.records.iter().filter(|record| record.covers(cert)) {
            match record.status_of(cert, issuer, now) {
                Ok(CrlStatus::Revoked) => return Some(Ok(CrlStatus::Revoked)),
                Ok(CrlStatus::Valid) => verdict = Some(CrlStatus::Valid),
                Err(e) => {
                    tracing::warn!("Local CRL unusable for '{}': {}", cert.display_name(), e);
                    last_error = Some(e);
                }
            }
        }
        match verdict {
            Some(status) => Some(Ok(status)),
            None => last_error.map(Err),
        }
    }
}

/// Downloads CRLs from distribution points and caches them per URL
#[derive(Clone)]
pub struct CrlCache {
    cache: Arc<RwLock<HashMap<String, CrlRecord>>>,
    transport: Arc<dyn RevocationTransport>,
    timeout: Duration,
    cache_ttl: Duration,
    cache_hits: Arc<AtomicUsize>,
    cache_misses: Arc<AtomicUsize>,
}

impl std::fmt::Debug for CrlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrlCache")
            .field("cache_size", &self.cache_size())
            .field("cache_hits", &self.cache_hits.load(Ordering::Relaxed))
            .field("cache_misses", &self.cache_misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CrlCache {
    pub fn new(config: &RevocationConfig, transport: Arc<dyn RevocationTransport>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::with_capacity(64))),
            transport,
            timeout: config.crl_timeout,
            cache_ttl: config.crl_cache_ttl,
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
                tracing::warn!("CRL cache read lock poisoned during size check, recovering");
                poisoned.into_inner().len()
            }
        }
    }

    /// Check `cert` against the CRLs named in its distribution points.
    ///
    /// The first distribution point that yields a verified, current CRL
    /// decides; errors only when none does.
    pub fn check(&self, cert: &CertificateInfo, issuer: &CertificateInfo, now: SystemTime) -> Result<CrlStatus, TrustError> {
        if cert.crl_urls.is_empty() {
            return Err(TrustError::CrlValidation(format!(
                "'{}' names no CRL distribution point",
                cert.display_name()
            )));
        }

        let mut last_error = None;
        for raw_url in &cert.crl_urls {
            match self.check_against(raw_url, cert, issuer, now) {
                Ok(status) => {
                    tracing::info!(
                        "CRL from {} reports '{}' as {:?}",
                        raw_url,
                        cert.display_name(),
                        status
                    );
                    return Ok(status);
                }
                Err(e) => {
                    tracing::warn!("CRL validation failed for URL {}: {}", raw_url, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| TrustError::CrlValidation("no CRL could be obtained".to_string())))
    }

    /// Drop expired entries
    pub fn cleanup_cache(&self) {
        let now = SystemTime::now();
        let mut cache = match self.cache.write() {
            Ok(cache) => cache,
            Err(poisoned) => {
                tracing::warn!("CRL cache write lock poisoned during cleanup, recovering");
                poisoned.into_inner()
            }
        };
        cache.retain(|_url, record| !self.is_expired(record, now));
        tracing::debug!("CRL cache cleanup completed, {} CRLs remaining", cache.len());
    }

    fn check_against(
        &self,
        raw_url: &str,
        cert: &CertificateInfo,
        issuer: &CertificateInfo,
        now: SystemTime,
    ) -> Result<CrlStatus, TrustError> {
        if let Some(record) = self.cached(raw_url)
            && !self.is_expired(&record, now)
        {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("CRL cache hit for URL: {}", raw_url);
            ensure_applies(&record, raw_url, cert)?;
            return record.status_of(cert, issuer, now);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let url = Url::parse(raw_url).map_err(|e| TrustError::Network(format!("Invalid CRL URL: {e}")))?;
        let bytes = self.transport.fetch_crl(&url, self.timeout)?;
        let record = CrlRecord::parse(&bytes)?;
        ensure_applies(&record, raw_url, cert)?;
        let status = record.status_of(cert, issuer, now)?;

        tracing::debug!(
            "Caching CRL from {} ({} revoked serials)",
            raw_url,
            record.revoked_serials.len()
        );
        self.store(raw_url.to_string(), record);
        Ok(status)
    }

    fn cached(&self, url: &str) -> Option<CrlRecord> {
        match self.cache.read() {
            Ok(cache) => cache.get(url).cloned(),
            Err(poisoned) => {
                tracing::warn!("CRL cache read lock poisoned, recovering");
                poisoned.into_inner().get(url).cloned()
            }
        }
    }

    fn is_expired(&self, record: &CrlRecord, now: SystemTime) -> bool {
        if let Some(next_update) = record.next_update {
            return now > next_update;
        }
        now.duration_since(record.cached_at).unwrap_or(Duration::ZERO) > self.cache_ttl
    }

    fn store(&self, url: String, record: CrlRecord) {
        let now = record.cached_at;
        let mut cache = match self.cache.write() {
            Ok(cache) => cache,
            Err(poisoned) => {
                tracing::warn!("CRL cache write lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        cache.insert(url, record);
        if cache.len() > CACHE_SWEEP_THRESHOLD {
            cache.retain(|_url, record| !self.is_expired(record, now));
            tracing::debug!("CRL cache swept, {} CRLs remaining", cache.len());
        }
    }
}

/// A downloaded CRL must come from the certificate's issuer, have the
/// certificate in scope and name the distribution point it was fetched from
fn ensure_applies(record: &CrlRecord, url: &str, cert: &CertificateInfo) -> Result<(), TrustError> {
    if record.issuer != cert.issuer {
        return Err(TrustError::CrlValidation(format!(
            "CRL at {url} is not issued by the certificate's issuer"
        )));
    }
    if let Ok(scope) = &record.scope
        && !(scope.served_from(url) && scope.includes(cert))
    {
        return Err(TrustError::CrlValidation(format!(
            "CRL at {url} does not cover '{}'",
            cert.display_name()
        )));
    }
    Ok(())
}
