//! Validate one certificate against a trust store, revocation included.
//!
//! ```text
//! cargo run --example validate_path -- <cert> <truststore> <type> [password] [--server NAME]
//! ```
//!
//! Without `--server` the certificate is validated as a client certificate.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mtls_context::revocation::HttpTransport;
use mtls_context::store::CredentialStore;
use mtls_context::{
    load_certificate, PeerRole, RevocationChecker, RevocationConfig, SecurityPolicy, StoreConfig, StoreRole,
    TrustError, TrustManagerSet,
};
use rustls::pki_types::ServerName;

#[derive(Debug, Parser)]
#[command(name = "validate_path", about = "Validate a certificate against a trust store")]
struct Args {
    /// PEM or DER certificate to validate
    certificate: PathBuf,
    /// Trust store holding the anchors and any CRLs
    truststore: PathBuf,
    /// Declared trust store type (PEM or SEALED)
    store_type: String,
    /// Trust store password
    password: Option<String>,
    /// Validate as a server certificate for this name
    #[arg(long, value_name = "NAME")]
    server: Option<String>,
}

impl Args {
    fn truststore_config(&self) -> StoreConfig {
        StoreConfig::new(&self.truststore, self.password.as_deref(), self.store_type.as_str())
    }

    fn role(&self) -> Result<PeerRole, TrustError> {
        match &self.server {
            Some(name) => Ok(PeerRole::Server {
                name: ServerName::try_from(name.clone())
                    .map_err(|e| TrustError::PathValidationConfigError(format!("invalid server name: {e}")))?,
            }),
            None => Ok(PeerRole::Client),
        }
    }
}

fn run(args: &Args) -> Result<(), TrustError> {
    SecurityPolicy::enable_revocation_checking();
    let provider = mtls_context::provider::platform_provider()?;

    let role = args.role()?;
    let certificate = load_certificate(&args.certificate)?;
    let store = CredentialStore::load(StoreRole::Trust, &args.truststore_config())?;
    let revocation = RevocationConfig::default();
    let checker = RevocationChecker::new(
        &revocation,
        store.crls(),
        Arc::new(HttpTransport::new(revocation.max_response_bytes)),
    )?;
    let trust = TrustManagerSet::derive(&store, provider, checker)?;

    trust.validate_chain(&role, &certificate, &[])
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => {
            println!("{}: valid", args.certificate.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{}: {e}", args.certificate.display());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_arguments() {
        let args = Args::try_parse_from(["validate_path", "alice.pem", "trust.sealed", "SEALED", "changeit"]).unwrap();
        assert_eq!(args.certificate, PathBuf::from("alice.pem"));
        assert_eq!(args.password.as_deref(), Some("changeit"));
        assert!(matches!(args.role().unwrap(), PeerRole::Client));

        let config = args.truststore_config();
        assert_eq!(config.store_type, "SEALED");
        assert!(config.password.is_some());
    }

    #[test]
    fn test_server_flag_selects_server_role() {
        let args =
            Args::try_parse_from(["validate_path", "--server", "localhost", "server.pem", "trust.pem", "PEM"]).unwrap();
        assert!(args.password.is_none());
        assert!(matches!(args.role().unwrap(), PeerRole::Server { .. }));
    }

    #[test]
    fn test_missing_store_type_is_a_usage_error() {
        assert!(Args::try_parse_from(["validate_path", "alice.pem", "trust.pem"]).is_err());
    }
}
