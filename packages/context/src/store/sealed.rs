//! Password-sealed containers for stores and private keys
//!
//! Layout: `MTLSSEAL | version:1 | iterations:u32be | salt:32 | nonce:12 | ciphertext+tag`.
//! The key is PBKDF2-HMAC-SHA256 over the password; the header is bound as
//! AES-256-GCM associated data so the iteration count cannot be rewritten.

use std::num::NonZeroU32;

use ring::{aead, pbkdf2, rand};

use crate::secret::SecretBytes;

const MAGIC: &[u8; 8] = b"MTLSSEAL";
const VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// PBKDF2 iteration count used when sealing (OWASP 2024 minimum)
pub const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(600_000) {
    Some(n) => n,
    None => unreachable!(),
};

/// Containers below this iteration count are refused when opening
pub const MIN_PBKDF2_ITERATIONS: u32 = 10_000;

/// PEM tag for a private key sealed under the store password
pub const SEALED_KEY_TAG: &str = "SEALED PRIVATE KEY";

/// Why a sealed container could not be opened
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SealError {
    #[error("content is not a sealed container")]
    NotSealed,
    #[error("unsupported sealed container version {0}")]
    UnsupportedVersion(u8),
    #[error("iteration count {0} is below the minimum of {MIN_PBKDF2_ITERATIONS}")]
    WeakIterations(u32),
    #[error("a password is required to open a sealed container")]
    PasswordRequired,
    #[error("authentication failed: wrong password or corrupted data")]
    Authentication,
    #[error("failed to generate random {0}")]
    Random(&'static str),
}

/// Whether `data` starts with the sealed-container magic
pub fn is_sealed(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}

/// Seal `plaintext` under `password`
pub fn seal(plaintext: &[u8], password: &SecretBytes, iterations: NonZeroU32) -> Result<Vec<u8>, SealError> {
    if iterations.get() < MIN_PBKDF2_ITERATIONS {
        return Err(SealError::WeakIterations(iterations.get()));
    }

    let rng = rand::SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    rand::SecureRandom::fill(&rng, &mut salt).map_err(|_| SealError::Random("salt"))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::SecureRandom::fill(&rng, &mut nonce_bytes).map_err(|_| SealError::Random("nonce"))?;

    let header = header(iterations.get());
    let key = derive_key(password, iterations, &salt)?;

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        aead::Nonce::assume_unique_for_key(nonce_bytes),
        aead::Aad::from(&header[..]),
        &mut in_out,
    )
    .map_err(|_| SealError::Authentication)?;

    let mut result = Vec::with_capacity(HEADER_LEN + SALT_LEN + NONCE_LEN + in_out.len());
    result.extend_from_slice(&header);
    result.extend_from_slice(&salt);
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&in_out);
    Ok(result)
}

/// Open a sealed container; the plaintext comes back as secret bytes
pub fn open(sealed: &[u8], password: Option<&SecretBytes>) -> Result<SecretBytes, SealError> {
    if !is_sealed(sealed) {
        return Err(SealError::NotSealed);
    }
    if sealed.len() < HEADER_LEN + SALT_LEN + NONCE_LEN + TAG_LEN {
        return Err(SealError::Authentication);
    }

    let version = sealed[MAGIC.len()];
    if version != VERSION {
        return Err(SealError::UnsupportedVersion(version));
    }
    let mut count = [0u8; 4];
    count.copy_from_slice(&sealed[MAGIC.len() + 1..HEADER_LEN]);
    let iterations = u32::from_be_bytes(count);
    if iterations < MIN_PBKDF2_ITERATIONS {
        return Err(SealError::WeakIterations(iterations));
    }
    let iterations = NonZeroU32::new(iterations).ok_or(SealError::WeakIterations(0))?;

    let password = password.ok_or(SealError::PasswordRequired)?;
    let (header, rest) = sealed.split_at(HEADER_LEN);
    let (salt, rest) = rest.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(password, iterations, salt)?;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);

    // Constant error for every authentication failure
    let mut in_out = ciphertext.to_vec();
    let opened = key
        .open_in_place(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::from(header),
            &mut in_out,
        )
        .map_err(|_| SealError::Authentication);
    let result = opened.map(|plaintext| SecretBytes::new(plaintext.to_vec()));
    zeroize::Zeroize::zeroize(&mut in_out);
    result
}

/// PEM-encode a PKCS#8 private key sealed under `password`
pub fn seal_private_key_pem(
    pkcs8_der: &[u8],
    password: &SecretBytes,
    iterations: NonZeroU32,
) -> Result<String, SealError> {
    let sealed = seal(pkcs8_der, password, iterations)?;
    Ok(pem::encode(&pem::Pem::new(SEALED_KEY_TAG, sealed)))
}

fn header(iterations: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..MAGIC.len()].copy_from_slice(MAGIC);
    header[MAGIC.len()] = VERSION;
    header[MAGIC.len() + 1..].copy_from_slice(&iterations.to_be_bytes());
    header
}

fn derive_key(password: &SecretBytes, iterations: NonZeroU32, salt: &[u8]) -> Result<aead::LessSafeKey, SealError> {
    let mut key_bytes = [0u8; 32];
    password.expose(|secret| {
        pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iterations, salt, secret, &mut key_bytes);
    });
    let key = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes).map_err(|_| SealError::Authentication);
    zeroize::Zeroize::zeroize(&mut key_bytes);
    Ok(aead::LessSafeKey::new(key?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ITERATIONS: NonZeroU32 = match NonZeroU32::new(MIN_PBKDF2_ITERATIONS) {
        Some(n) => n,
        None => unreachable!(),
    };

    #[test]
    fn test_open_recovers_plaintext() {
        let password = SecretBytes::from("montana-to-rice");
        let sealed = seal(b"-----BEGIN CERTIFICATE-----", &password, TEST_ITERATIONS).unwrap();
        assert!(is_sealed(&sealed));

        let opened = open(&sealed, Some(&password)).unwrap();
        assert!(opened.expose(|bytes| bytes == b"-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_wrong_password_fails_authentication() {
        let sealed = seal(b"secret", &SecretBytes::from("right"), TEST_ITERATIONS).unwrap();
        assert_eq!(
            open(&sealed, Some(&SecretBytes::from("wrong"))).unwrap_err(),
            SealError::Authentication
        );
        assert_eq!(open(&sealed, None).unwrap_err(), SealError::PasswordRequired);
    }

    #[test]
    fn test_tampered_iteration_count_is_detected() {
        let password = SecretBytes::from("pw");
        let mut sealed = seal(b"secret", &password, TEST_ITERATIONS).unwrap();
        sealed[MAGIC.len() + 4] ^= 0x01;
        assert_eq!(open(&sealed, Some(&password)).unwrap_err(), SealError::Authentication);
    }

    #[test]
    fn test_plain_content_is_not_sealed() {
        assert_eq!(open(b"-----BEGIN", None).unwrap_err(), SealError::NotSealed);
    }

    #[test]
    fn test_weak_iteration_counts_are_refused() {
        let weak = NonZeroU32::new(1_000).unwrap();
        assert_eq!(
            seal(b"x", &SecretBytes::from("pw"), weak).unwrap_err(),
            SealError::WeakIterations(1_000)
        );
    }
}
