//! Shared PKI fixture for the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use der::asn1::{BitString, GeneralizedTime, Ia5String, Null, ObjectIdentifier, OctetString};
use der::{Decode, Encode};
use mtls_context::store::sealed;
use mtls_context::{RevocationTransport, SecretBytes, TlsContext, TrustContextConfig, TrustError};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, CrlDistributionPoint,
    CrlIssuingDistributionPoint, CrlScope, CustomExtension, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, RevocationReason,
    RevokedCertParams, SerialNumber,
};
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use rustls::pki_types::CertificateDer;
use url::Url;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::Extension;
use x509_cert::ext::pkix::{AccessDescription, AuthorityInfoAccessSyntax};
use x509_cert::name::Name;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;
use x509_ocsp::{
    BasicOcspResponse, CertStatus, OcspGeneralizedTime, OcspRequest, OcspResponse, OcspResponseStatus,
    ResponderId, ResponseBytes, ResponseData, RevokedInfo, SingleResponse,
};

pub const OCSP_URL: &str = "http://ocsp.example.test/";
pub const CRL_URL: &str = "http://crl.example.test/root.crl";
pub const CA_CRL_URL: &str = "http://crl.example.test/root-ca-certs.crl";
pub const TEST_ITERATIONS: u32 = 10_000;

const OID_AIA: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 1];
const OID_AD_OCSP: &str = "1.3.6.1.5.5.7.48.1";
const OID_OCSP_BASIC: &str = "1.3.6.1.5.5.7.48.1.1";
const OID_OCSP_NONCE: &str = "1.3.6.1.5.5.7.48.1.2";
const OID_ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";

/// A certificate authority that can issue certificates, CRLs and OCSP answers
pub struct Authority {
    pub name: String,
    pub cert: rcgen::Certificate,
    issuer: Issuer<'static, KeyPair>,
    pkcs8: Vec<u8>,
}

/// An end entity or intermediate issued by an [`Authority`]
pub struct Leaf {
    pub name: String,
    pub cert: rcgen::Certificate,
    pub key: KeyPair,
}

/// Extensions to put into an issued certificate
#[derive(Debug, Default, Clone)]
pub struct LeafOptions {
    pub ocsp_url: Option<String>,
    pub crl_url: Option<String>,
}

impl LeafOptions {
    pub fn with_ocsp() -> Self {
        Self {
            ocsp_url: Some(OCSP_URL.to_string()),
            crl_url: None,
        }
    }

    pub fn with_crl_distribution_point() -> Self {
        Self {
            ocsp_url: None,
            crl_url: Some(CRL_URL.to_string()),
        }
    }
}

/// Key and certificate that sign OCSP answers
#[derive(Debug, Clone)]
pub struct OcspSigner {
    pub cert: CertificateDer<'static>,
    pkcs8: Vec<u8>,
    /// Ship the certificate in the response's certs field
    pub embedded: bool,
}

/// Shape of the answers an [`OcspResponder`] signs
#[derive(Debug, Clone)]
pub struct OcspAnswer {
    /// Signs in place of the issuing authority
    pub signer: Option<OcspSigner>,
    /// thisUpdate in seconds from now
    pub this_update: i64,
    /// nextUpdate in seconds from now
    pub next_update: i64,
    /// Echo a nonce other than the one requested
    pub foreign_nonce: bool,
    /// Report every certificate as unknown
    pub unknown: bool,
}

impl Default for OcspAnswer {
    fn default() -> Self {
        Self {
            signer: None,
            this_update: -60,
            next_update: 3600,
            foreign_nonce: false,
            unknown: false,
        }
    }
}

impl OcspAnswer {
    pub fn signed_by(signer: OcspSigner) -> Self {
        Self {
            signer: Some(signer),
            ..Self::default()
        }
    }
}

fn ca_params(name: &str) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

fn apply_options(params: &mut CertificateParams, options: &LeafOptions) {
    if let Some(url) = &options.ocsp_url {
        params.custom_extensions.push(aia_extension(url));
    }
    if let Some(url) = &options.crl_url {
        params.crl_distribution_points = vec![CrlDistributionPoint {
            uris: vec![url.clone()],
        }];
    }
}

fn aia_extension(ocsp_url: &str) -> CustomExtension {
    let aia = AuthorityInfoAccessSyntax(vec![AccessDescription {
        access_method: ObjectIdentifier::new_unwrap(OID_AD_OCSP),
        access_location: GeneralName::UniformResourceIdentifier(Ia5String::new(ocsp_url).unwrap()),
    }]);
    CustomExtension::from_oid_content(OID_AIA, aia.to_der().unwrap())
}

impl Authority {
    pub fn root(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let pkcs8 = key.serialize_der();
        let params = ca_params(name);
        let cert = params.self_signed(&key).unwrap();
        Self {
            name: name.to_string(),
            cert,
            issuer: Issuer::new(params, key),
            pkcs8,
        }
    }

    /// An intermediate CA issued by `self`
    pub fn intermediate(&self, name: &str, options: &LeafOptions) -> Authority {
        let key = KeyPair::generate().unwrap();
        let pkcs8 = key.serialize_der();
        let mut params = ca_params(name);
        apply_options(&mut params, options);
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        Authority {
            name: name.to_string(),
            cert,
            issuer: Issuer::new(params, key),
            pkcs8,
        }
    }

    /// An end entity valid for `localhost` and for its own name
    pub fn issue(&self, name: &str, options: &LeafOptions) -> Leaf {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string(), "localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
        apply_options(&mut params, options);
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        Leaf {
            name: name.to_string(),
            cert,
            key,
        }
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// PEM CRL listing `revoked`, valid for a day
    pub fn crl_pem(&self, revoked: &[&CertificateDer<'_>]) -> String {
        self.crl_pem_until(revoked, time::OffsetDateTime::now_utc() + time::Duration::days(1))
    }

    pub fn crl_pem_until(&self, revoked: &[&CertificateDer<'_>], next_update: time::OffsetDateTime) -> String {
        self.signed_crl_pem(revoked, next_update, None)
    }

    /// PEM CRL carrying an issuingDistributionPoint for `url`, limited to `scope`
    pub fn crl_pem_scoped(&self, revoked: &[&CertificateDer<'_>], url: &str, scope: Option<CrlScope>) -> String {
        let idp = CrlIssuingDistributionPoint {
            distribution_point: CrlDistributionPoint {
                uris: vec![url.to_string()],
            },
            scope,
        };
        self.signed_crl_pem(revoked, time::OffsetDateTime::now_utc() + time::Duration::days(1), Some(idp))
    }

    fn signed_crl_pem(
        &self,
        revoked: &[&CertificateDer<'_>],
        next_update: time::OffsetDateTime,
        issuing_distribution_point: Option<CrlIssuingDistributionPoint>,
    ) -> String {
        let now = time::OffsetDateTime::now_utc();
        let params = CertificateRevocationListParams {
            this_update: now - time::Duration::hours(1),
            next_update,
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point,
            revoked_certs: revoked
                .iter()
                .map(|cert| RevokedCertParams {
                    serial_number: SerialNumber::from_slice(&serial_of(cert)),
                    revocation_time: now - time::Duration::minutes(30),
                    reason_code: Some(RevocationReason::KeyCompromise),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let crl = params.signed_by(&self.issuer).unwrap();
        pem::encode(&pem::Pem::new("X509 CRL", crl.der().to_vec()))
    }

    /// This authority's own key and certificate as an OCSP signer
    pub fn ocsp_signer(&self) -> OcspSigner {
        OcspSigner {
            cert: self.cert_der(),
            pkcs8: self.pkcs8.clone(),
            embedded: false,
        }
    }

    /// A responder certificate issued by `self` for signing OCSP answers on
    /// its behalf
    pub fn delegated_responder(&self, name: &str, ocsp_signing: bool, expired: bool) -> OcspSigner {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = if ocsp_signing {
            vec![ExtendedKeyUsagePurpose::OcspSigning]
        } else {
            vec![ExtendedKeyUsagePurpose::ClientAuth]
        };
        if expired {
            let now = time::OffsetDateTime::now_utc();
            params.not_before = now - time::Duration::days(30);
            params.not_after = now - time::Duration::days(1);
        }
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        OcspSigner {
            cert: cert.der().clone(),
            pkcs8: key.serialize_der(),
            embedded: true,
        }
    }

    /// Sign an OCSP answer for every certificate asked about in `request`
    pub fn ocsp_response(&self, request: &[u8], revoked: &HashSet<Vec<u8>>) -> Vec<u8> {
        self.ocsp_answer(request, revoked, &OcspAnswer::default())
    }

    /// Like [`Authority::ocsp_response`], shaped by `answer`
    pub fn ocsp_answer(&self, request: &[u8], revoked: &HashSet<Vec<u8>>, answer: &OcspAnswer) -> Vec<u8> {
        let own = self.ocsp_signer();
        let signer = answer.signer.as_ref().unwrap_or(&own);
        let request = OcspRequest::from_der(request).unwrap();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let at = |offset: i64| {
            let secs = (now.as_secs() as i64 + offset) as u64;
            OcspGeneralizedTime(GeneralizedTime::from_unix_duration(Duration::from_secs(secs)).unwrap())
        };

        let responses = request
            .tbs_request
            .request_list
            .iter()
            .map(|single| {
                let serial = single.req_cert.serial_number.as_bytes().to_vec();
                let cert_status = if answer.unknown {
                    CertStatus::Unknown(Null)
                } else if revoked.contains(&serial) {
                    CertStatus::Revoked(RevokedInfo {
                        revocation_time: at(-600),
                        revocation_reason: None,
                    })
                } else {
                    CertStatus::Good(Null)
                };
                SingleResponse {
                    cert_id: single.req_cert.clone(),
                    cert_status,
                    this_update: at(answer.this_update),
                    next_update: Some(at(answer.next_update)),
                    single_extensions: None,
                }
            })
            .collect();

        let response_extensions = if answer.foreign_nonce {
            Some(vec![nonce_extension(&[0xAA; 16])])
        } else {
            request.tbs_request.request_extensions.clone()
        };
        let tbs = ResponseData {
            version: x509_ocsp::Version::V1,
            responder_id: ResponderId::ByName(Name::from_der(&subject_of(&signer.cert)).unwrap()),
            produced_at: at(0),
            responses,
            response_extensions,
        };

        let rng = ring::rand::SystemRandom::new();
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &signer.pkcs8, &rng).unwrap();
        let signature = key.sign(&rng, &tbs.to_der().unwrap()).unwrap();

        let basic = BasicOcspResponse {
            tbs_response_data: tbs,
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: ObjectIdentifier::new_unwrap(OID_ECDSA_WITH_SHA256),
                parameters: None,
            },
            signature: BitString::from_bytes(signature.as_ref()).unwrap(),
            certs: signer
                .embedded
                .then(|| vec![Certificate::from_der(signer.cert.as_ref()).unwrap()]),
        };

        OcspResponse {
            response_status: OcspResponseStatus::Successful,
            response_bytes: Some(ResponseBytes {
                response_type: ObjectIdentifier::new_unwrap(OID_OCSP_BASIC),
                response: OctetString::new(basic.to_der().unwrap()).unwrap(),
            }),
        }
        .to_der()
        .unwrap()
    }
}

fn subject_of(cert: &CertificateDer<'_>) -> Vec<u8> {
    mtls_context::CertificateInfo::from_der(cert).unwrap().subject
}

fn nonce_extension(nonce: &[u8]) -> Extension {
    Extension {
        extn_id: ObjectIdentifier::new_unwrap(OID_OCSP_NONCE),
        critical: false,
        extn_value: OctetString::new(OctetString::new(nonce).unwrap().to_der().unwrap()).unwrap(),
    }
}

impl Leaf {
    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn serial(&self) -> Vec<u8> {
        serial_of(self.cert.der())
    }
}

pub fn serial_of(cert: &CertificateDer<'_>) -> Vec<u8> {
    mtls_context::CertificateInfo::from_der(cert).unwrap().serial
}

/// Identity store: the leaf, then its chain, then its key
pub fn identity_pem(leaf: &Leaf, chain: &[&Authority]) -> String {
    let mut pem = leaf.cert.pem();
    for authority in chain {
        pem.push_str(&authority.cert_pem());
    }
    pem.push_str(&leaf.key.serialize_pem());
    pem
}

/// Identity store whose key is sealed under `password`
pub fn sealed_identity_pem(leaf: &Leaf, password: &str) -> String {
    let iterations = NonZeroU32::new(TEST_ITERATIONS).unwrap();
    let key = sealed::seal_private_key_pem(&leaf.key.serialize_der(), &SecretBytes::from(password), iterations).unwrap();
    format!("{}{}", leaf.cert.pem(), key)
}

/// Trust store: the anchors plus any CRLs
pub fn trust_pem(anchors: &[&Authority], crls: &[String]) -> String {
    let mut pem = String::new();
    for anchor in anchors {
        pem.push_str(&anchor.cert_pem());
    }
    for crl in crls {
        pem.push_str(crl);
    }
    pem
}

/// Temporary directory holding the store files of one test
pub struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn pem_config(identity: &Path, trust: &Path) -> TrustContextConfig {
    TrustContextConfig::from_strings(
        identity.to_str().unwrap(),
        None,
        "PEM",
        trust.to_str().unwrap(),
        None,
        "PEM",
    )
}

/// Transport for which every responder and distribution point is down
#[derive(Debug, Default)]
pub struct Unreachable {
    pub calls: AtomicUsize,
}

impl RevocationTransport for Unreachable {
    fn post_ocsp(&self, url: &Url, _request: &[u8], _timeout: Duration) -> Result<Vec<u8>, TrustError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TrustError::Network(format!("connection to {url} refused")))
    }

    fn fetch_crl(&self, url: &Url, _timeout: Duration) -> Result<Vec<u8>, TrustError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TrustError::Network(format!("connection to {url} refused")))
    }
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Owned OCSP responder: keeps a copy of the authority needed for signing
#[derive(Debug)]
pub struct OcspResponder {
    authority: Authority,
    revoked: Mutex<HashSet<Vec<u8>>>,
    answer: OcspAnswer,
    crl: Option<Vec<u8>>,
    pub ocsp_requests: AtomicUsize,
    pub crl_requests: AtomicUsize,
}

impl OcspResponder {
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            revoked: Mutex::new(HashSet::new()),
            answer: OcspAnswer::default(),
            crl: None,
            ocsp_requests: AtomicUsize::new(0),
            crl_requests: AtomicUsize::new(0),
        }
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn serving_crl(mut self, crl_pem: String) -> Self {
        self.crl = Some(crl_pem.into_bytes());
        self
    }

    pub fn answering(mut self, answer: OcspAnswer) -> Self {
        self.answer = answer;
        self
    }

    pub fn revoke(&self, cert: &CertificateDer<'_>) {
        self.revoked.lock().unwrap().insert(serial_of(cert));
    }
}

impl RevocationTransport for OcspResponder {
    fn post_ocsp(&self, _url: &Url, request: &[u8], _timeout: Duration) -> Result<Vec<u8>, TrustError> {
        self.ocsp_requests.fetch_add(1, Ordering::SeqCst);
        let revoked = self.revoked.lock().unwrap().clone();
        Ok(self.authority.ocsp_answer(request, &revoked, &self.answer))
    }

    fn fetch_crl(&self, url: &Url, _timeout: Duration) -> Result<Vec<u8>, TrustError> {
        self.crl_requests.fetch_add(1, Ordering::SeqCst);
        self.crl
            .clone()
            .ok_or_else(|| TrustError::Network(format!("{url} not found")))
    }
}

/// Which side of an in-memory handshake failed
#[derive(Debug)]
pub enum HandshakeFailure {
    Client(rustls::Error),
    Server(rustls::Error),
}

/// Run a complete handshake between two contexts without sockets
pub fn handshake(server_ctx: &TlsContext, client_ctx: &TlsContext, server_name: &str) -> Result<(), HandshakeFailure> {
    let mut client = client_ctx.connect(server_name).unwrap();
    let mut server = server_ctx.accept().unwrap();

    for _ in 0..32 {
        if !client.is_handshaking() && !server.is_handshaking() {
            return Ok(());
        }

        let mut buffer = Vec::new();
        while client.wants_write() {
            client.write_tls(&mut buffer).unwrap();
        }
        let mut incoming = buffer.as_slice();
        while !incoming.is_empty() {
            server.read_tls(&mut incoming).unwrap();
            server.process_new_packets().map_err(HandshakeFailure::Server)?;
        }

        let mut buffer = Vec::new();
        while server.wants_write() {
            server.write_tls(&mut buffer).unwrap();
        }
        let mut incoming = buffer.as_slice();
        while !incoming.is_empty() {
            client.read_tls(&mut incoming).unwrap();
            client.process_new_packets().map_err(HandshakeFailure::Client)?;
        }
    }
    panic!("handshake did not complete");
}
