//! Signature checks over OCSP responses and CRLs

use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};

use crate::certificate::CertificateInfo;

const RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const ED25519: &str = "1.3.101.112";

const SHA256_WITH_RSA: &str = "1.2.840.113549.1.1.11";
const SHA384_WITH_RSA: &str = "1.2.840.113549.1.1.12";
const SHA512_WITH_RSA: &str = "1.2.840.113549.1.1.13";
const ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";
const ECDSA_WITH_SHA384: &str = "1.2.840.10045.4.3.3";

/// Uncompressed SEC1 point lengths
const P256_POINT_LEN: usize = 65;
const P384_POINT_LEN: usize = 97;

/// Verify `signature` over `message` with the public key of `signer`.
///
/// `signature_algorithm` is the dotted OID from the signed structure.
pub(crate) fn verify_signed_data(
    signer: &CertificateInfo,
    signature_algorithm: &str,
    message: &[u8],
    signature: &[u8],
) -> Result<(), String> {
    let algorithm = select_algorithm(signer, signature_algorithm).ok_or_else(|| {
        format!(
            "unsupported signature algorithm {signature_algorithm} for {} key",
            signer.key_algorithm
        )
    })?;

    UnparsedPublicKey::new(algorithm, &signer.public_key)
        .verify(message, signature)
        .map_err(|_| format!("signature does not verify under the key of '{}'", signer.display_name()))
}

fn select_algorithm(signer: &CertificateInfo, signature_algorithm: &str) -> Option<&'static dyn VerificationAlgorithm> {
    let point_len = signer.public_key.len();
    let algorithm: &'static dyn VerificationAlgorithm = match (signer.key_algorithm.as_str(), signature_algorithm) {
        (RSA_ENCRYPTION, SHA256_WITH_RSA) => &signature::RSA_PKCS1_2048_8192_SHA256,
        (RSA_ENCRYPTION, SHA384_WITH_RSA) => &signature::RSA_PKCS1_2048_8192_SHA384,
        (RSA_ENCRYPTION, SHA512_WITH_RSA) => &signature::RSA_PKCS1_2048_8192_SHA512,
        (EC_PUBLIC_KEY, ECDSA_WITH_SHA256) if point_len == P256_POINT_LEN => &signature::ECDSA_P256_SHA256_ASN1,
        (EC_PUBLIC_KEY, ECDSA_WITH_SHA384) if point_len == P256_POINT_LEN => &signature::ECDSA_P256_SHA384_ASN1,
        (EC_PUBLIC_KEY, ECDSA_WITH_SHA256) if point_len == P384_POINT_LEN => &signature::ECDSA_P384_SHA256_ASN1,
        (EC_PUBLIC_KEY, ECDSA_WITH_SHA384) if point_len == P384_POINT_LEN => &signature::ECDSA_P384_SHA384_ASN1,
        (ED25519, ED25519) => &signature::ED25519,
        _ => return None,
    };
    Some(algorithm)
}
