//! Certification path reconstruction
//!
//! rustls validates the peer chain but does not hand the path it built back
//! to the verifier, so the path is rebuilt here to learn which issuer signed
//! each certificate whose revocation status has to be checked.

use rustls::pki_types::CertificateDer;

use crate::certificate::CertificateInfo;

/// Longest path accepted, anchor excluded
const MAX_PATH_DEPTH: usize = 10;

/// A certificate together with the certificate that issued it
#[derive(Debug, Clone)]
pub struct PathLink {
    pub certificate: CertificateInfo,
    pub issuer: CertificateInfo,
}

/// Rebuild the path from `end_entity` to one of `anchors`.
///
/// Returns one link per non-anchor certificate, end entity first.
pub fn build_path(
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    anchors: &[CertificateInfo],
) -> Result<Vec<PathLink>, String> {
    let mut current = CertificateInfo::from_der(end_entity).map_err(|e| e.to_string())?;
    let mut pool: Vec<CertificateInfo> = intermediates
        .iter()
        .filter_map(|der| CertificateInfo::from_der(der).ok())
        .collect();
    let mut links = Vec::new();

    while links.len() < MAX_PATH_DEPTH {
        if let Some(anchor) = anchors.iter().find(|anchor| current.is_issued_by(anchor)) {
            links.push(PathLink {
                certificate: current,
                issuer: anchor.clone(),
            });
            return Ok(links);
        }

        let Some(position) = pool.iter().position(|candidate| current.is_issued_by(candidate)) else {
            return Err(format!(
                "no issuer found for '{}' among the presented intermediates",
                current.display_name()
            ));
        };
        // Each intermediate is used at most once, which also rules out loops
        let issuer = pool.swap_remove(position);
        links.push(PathLink {
            certificate: current,
            issuer: issuer.clone(),
        });
        current = issuer;
    }

    Err(format!("certification path exceeds {MAX_PATH_DEPTH} certificates"))
}
