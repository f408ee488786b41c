//! # mtls_context
//!
//! Mutually-authenticated TLS contexts built from an identity store and a
//! trust store.
//!
//! ## Features
//!
//! - **PEM and sealed stores**: certificate chains, private keys and CRLs,
//!   optionally sealed under the store password (AES-256-GCM, PBKDF2)
//! - **Mandatory client authentication** on every server context
//! - **Fail-closed revocation checking**: stapled OCSP, OCSP responders, local
//!   CRLs and CRL distribution points; a peer whose status cannot be
//!   established is rejected
//! - **rustls configurations** plus `tokio-rustls` acceptor and connector
//!
//! ## Usage
//!
//! ```no_run
//! use mtls_context::{TrustContextBuilder, TrustContextConfig};
//!
//! let config = TrustContextConfig::from_strings(
//!     "/etc/tls/keystore.pem",
//!     None,
//!     "PEM",
//!     "/etc/tls/truststore.pem",
//!     None,
//!     "PEM",
//! );
//! let builder = TrustContextBuilder::new(&config)?;
//! let context = builder.create_context()?;
//! assert!(context.need_client_auth());
//! # Ok::<(), mtls_context::TrustError>(())
//! ```

#![deny(unsafe_code)]

pub mod builder;
pub mod certificate;
pub mod config;
pub mod context;
pub mod error;
pub mod keys;
pub mod policy;
pub mod provider;
pub mod revocation;
pub mod secret;
pub mod store;
pub mod trust;

pub use builder::TrustContextBuilder;
pub use certificate::{load_certificate, CertificateInfo};
pub use config::{RevocationConfig, StoreConfig, StoreType, TrustContextConfig};
pub use context::TlsContext;
pub use error::{RevocationSource, StoreRole, TrustError, ValidationFailure};
pub use keys::{IdentityKeyManager, KeyManagerSet};
pub use policy::SecurityPolicy;
pub use revocation::{HttpTransport, RevocationChecker, RevocationStats, RevocationTransport};
pub use secret::SecretBytes;
pub use store::{CredentialStore, StoreEntry};
pub use trust::{PeerRole, RevocationEnforcingVerifier, TrustManagerSet};
