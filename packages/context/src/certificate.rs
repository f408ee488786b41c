//! Certificate field extraction used by key selection and revocation checks

use std::path::Path;
use std::time::{Duration, SystemTime};

use rustls::pki_types::CertificateDer;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};

use crate::error::TrustError;

/// id-ad-ocsp access method in the AuthorityInfoAccess extension
const OID_AD_OCSP: &str = "1.3.6.1.5.5.7.48.1";

/// Owned view of the certificate fields this crate needs
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    der: CertificateDer<'static>,
    /// DER-encoded subject Name
    pub subject: Vec<u8>,
    /// DER-encoded issuer Name
    pub issuer: Vec<u8>,
    pub serial: Vec<u8>,
    pub common_name: Option<String>,
    /// Dotted OID of the subject public key algorithm
    pub key_algorithm: String,
    /// Contents of the subjectPublicKey BIT STRING
    pub public_key: Vec<u8>,
    pub ocsp_urls: Vec<String>,
    pub crl_urls: Vec<String>,
    pub is_ca: bool,
    /// ExtendedKeyUsage includes id-kp-OCSPSigning
    pub ocsp_signing: bool,
    pub not_after: SystemTime,
}

impl CertificateInfo {
    /// Parse a DER certificate
    pub fn from_der(der: &CertificateDer<'_>) -> Result<Self, TrustError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).map_err(|e| {
            TrustError::CertificateParsing(format!("Failed to parse DER certificate: {e}"))
        })?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        let mut ocsp_urls = Vec::new();
        let mut crl_urls = Vec::new();
        for ext in cert.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::AuthorityInfoAccess(aia) => {
                    for desc in &aia.accessdescs {
                        if desc.access_method.to_id_string() == OID_AD_OCSP
                            && let GeneralName::URI(uri) = &desc.access_location
                        {
                            ocsp_urls.push((*uri).to_string());
                        }
                    }
                }
                ParsedExtension::CRLDistributionPoints(points) => {
                    for point in points.iter() {
                        if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                            for name in names {
                                if let GeneralName::URI(uri) = name {
                                    crl_urls.push((*uri).to_string());
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let ocsp_signing = matches!(
            cert.extended_key_usage(),
            Ok(Some(eku)) if eku.value.ocsp_signing
        );

        let not_after_secs = cert.validity().not_after.timestamp().max(0) as u64;
        let spki = cert.public_key();

        Ok(Self {
            der: der.clone().into_owned(),
            subject: cert.subject().as_raw().to_vec(),
            issuer: cert.issuer().as_raw().to_vec(),
            serial: cert.raw_serial().to_vec(),
            common_name,
            key_algorithm: spki.algorithm.algorithm.to_id_string(),
            public_key: spki.subject_public_key.data.to_vec(),
            ocsp_urls,
            crl_urls,
            is_ca: cert.is_ca(),
            ocsp_signing,
            not_after: SystemTime::UNIX_EPOCH + Duration::from_secs(not_after_secs),
        })
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// Human-readable name for logs and errors: the CN, else the serial in hex
    pub fn display_name(&self) -> String {
        match &self.common_name {
            Some(cn) => cn.clone(),
            None => format!("serial:{}", hex::encode(&self.serial)),
        }
    }

    /// True when `self` names `issuer` as its issuer and carries a signature
    /// that verifies under the issuer's public key
    pub fn is_issued_by(&self, issuer: &CertificateInfo) -> bool {
        if self.issuer != issuer.subject {
            return false;
        }
        let (Ok((_, child)), Ok((_, parent))) = (
            x509_parser::parse_x509_certificate(self.der.as_ref()),
            x509_parser::parse_x509_certificate(issuer.der.as_ref()),
        ) else {
            return false;
        };
        verify_issued_by(&child, &parent)
    }
}

fn verify_issued_by(child: &X509Certificate<'_>, parent: &X509Certificate<'_>) -> bool {
    child.verify_signature(Some(parent.public_key())).is_ok()
}

/// Load one certificate from a PEM or DER file
pub fn load_certificate(path: &Path) -> Result<CertificateDer<'static>, TrustError> {
    let bytes = std::fs::read(path).map_err(|e| {
        TrustError::CertificateParsing(format!("Failed to read {}: {e}", path.display()))
    })?;

    let der = if bytes.starts_with(b"-----BEGIN") {
        let blocks = pem::parse_many(&bytes)
            .map_err(|e| TrustError::CertificateParsing(format!("Invalid PEM: {e}")))?;
        blocks
            .into_iter()
            .find(|block| block.tag() == "CERTIFICATE")
            .map(|block| block.into_contents())
            .ok_or_else(|| {
                TrustError::CertificateParsing(format!("No certificate found in {}", path.display()))
            })?
    } else {
        bytes
    };

    let cert = CertificateDer::from(der);
    // Reject garbage early rather than at handshake time
    CertificateInfo::from_der(&cert)?;
    Ok(cert)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_is_rejected() {
        let err = CertificateInfo::from_der(&CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x01]))
            .unwrap_err();
        assert!(matches!(err, TrustError::CertificateParsing(_)));
    }

    #[test]
    fn test_extracts_subject_and_self_issuance() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(rcgen::DnType::CommonName, "root-ca");
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();

        let info = CertificateInfo::from_der(cert.der()).unwrap();
        assert_eq!(info.common_name.as_deref(), Some("root-ca"));
        assert_eq!(info.display_name(), "root-ca");
        assert!(info.is_ca);
        assert_eq!(info.subject, info.issuer);
        assert!(info.is_issued_by(&info));
        assert!(info.ocsp_urls.is_empty());
    }
}
