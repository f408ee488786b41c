//! Peer verification with mandatory revocation checking

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};

use super::path;
use crate::certificate::CertificateInfo;
use crate::error::ValidationFailure;
use crate::revocation::RevocationChecker;

/// Which side of the handshake the peer is on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRole {
    /// The peer is a client presenting its certificate to us
    Client,
    /// The peer is a server we connect to under `name`
    Server { name: ServerName<'static> },
}

/// Validates the peer chain against the trust anchors, then requires a
/// definitive "not revoked" answer for every certificate in the path.
///
/// Serves both handshake roles: as the client verifier of a server
/// context (client authentication mandatory) and as the server verifier of
/// a client context.
#[derive(Debug)]
pub struct RevocationEnforcingVerifier {
    client_inner: Arc<dyn ClientCertVerifier>,
    server_inner: Arc<WebPkiServerVerifier>,
    anchors: Arc<[CertificateInfo]>,
    checker: Arc<RevocationChecker>,
}

impl RevocationEnforcingVerifier {
    pub(crate) fn new(
        client_inner: Arc<dyn ClientCertVerifier>,
        server_inner: Arc<WebPkiServerVerifier>,
        anchors: Arc<[CertificateInfo]>,
        checker: Arc<RevocationChecker>,
    ) -> Self {
        Self {
            client_inner,
            server_inner,
            anchors,
            checker,
        }
    }

    pub fn checker(&self) -> &RevocationChecker {
        &self.checker
    }

    /// Full validation of a peer chain outside a handshake
    pub fn validate(
        &self,
        role: &PeerRole,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), ValidationFailure> {
        let pkix = match role {
            PeerRole::Client => self
                .client_inner
                .verify_client_cert(end_entity, intermediates, now)
                .map(|_| ()),
            PeerRole::Server { name } => self
                .server_inner
                .verify_server_cert(end_entity, intermediates, name, &[], now)
                .map(|_| ()),
        };
        pkix.map_err(|e| ValidationFailure::Untrusted(e.to_string()))?;
        self.enforce_revocation(end_entity, intermediates, None, now)
    }

    fn enforce_revocation(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        stapled_ocsp: Option<&[u8]>,
        now: UnixTime,
    ) -> Result<(), ValidationFailure> {
        let links = path::build_path(end_entity, intermediates, &self.anchors).map_err(ValidationFailure::Untrusted)?;
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(now.as_secs());

        for (depth, link) in links.iter().enumerate() {
            // A staple only ever speaks for the end entity
            let stapled = if depth == 0 { stapled_ocsp } else { None };
            let source = self.checker.check(&link.certificate, &link.issuer, stapled, now)?;
            tracing::debug!(
                "Revocation check passed for '{}' via {}",
                link.certificate.display_name(),
                source
            );
        }
        Ok(())
    }
}

impl ClientCertVerifier for RevocationEnforcingVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.client_inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.client_inner
            .verify_client_cert(end_entity, intermediates, now)
            .map_err(|e| {
                tracing::warn!("Client certificate rejected: {}", e);
                ValidationFailure::Untrusted(e.to_string()).into_tls_error()
            })?;
        self.enforce_revocation(end_entity, intermediates, None, now)
            .map_err(ValidationFailure::into_tls_error)?;

        tracing::info!("Client certificate accepted");
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.client_inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.client_inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.client_inner.supported_verify_schemes()
    }
}

impl ServerCertVerifier for RevocationEnforcingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.server_inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .map_err(|e| {
                tracing::warn!("Server certificate for {:?} rejected: {}", server_name, e);
                ValidationFailure::Untrusted(e.to_string()).into_tls_error()
            })?;
        self.enforce_revocation(end_entity, intermediates, Some(ocsp_response), now)
            .map_err(ValidationFailure::into_tls_error)?;

        tracing::info!("Server certificate for {:?} accepted", server_name);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.server_inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.server_inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.server_inner.supported_verify_schemes()
    }
}
