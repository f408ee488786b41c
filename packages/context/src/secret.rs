//! Secret byte buffers that zero on drop

use std::fmt;

use serde::{Deserialize, Deserializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Password or key material that is cleared from memory when dropped.
///
/// Contents are only reachable through [`SecretBytes::expose`], which scopes
/// the borrow to a closure.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes {
    data: Vec<u8>,
}

impl SecretBytes {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Copy a password string into a secret buffer; empty strings are absent.
    pub fn from_password(password: Option<&str>) -> Option<Self> {
        password
            .filter(|p| !p.is_empty())
            .map(|p| Self::new(p.as_bytes().to_vec()))
    }

    /// Run `f` with the secret bytes borrowed for the duration of the call
    pub fn expose<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<&str> for SecretBytes {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBytes([REDACTED])")
    }
}

impl<'de> Deserialize<'de> for SecretBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut value = String::deserialize(deserializer)?;
        let secret = Self::new(value.as_bytes().to_vec());
        value.zeroize();
        Ok(secret)
    }
}
