//! HMAC-SHA256 signatures over raw request bodies.
//!
//! Senders sign the exact bytes they POST with a shared secret and send the
//! lowercase hex digest in `X-Webhook-Signature`. Verification runs on the
//! raw body before it is parsed, and the comparison is constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Signature validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The header is absent or empty.
    #[error("missing signature")]
    Missing,
    /// The header is not valid hex.
    #[error("signature is not valid hex")]
    InvalidFormat,
    /// The digest does not match.
    #[error("signature verification failed")]
    Mismatch,
    /// The secret cannot key an HMAC.
    #[error("invalid signing secret")]
    InvalidSecret,
}

/// Hex HMAC-SHA256 of `payload` under `secret`.
///
/// # Errors
///
/// Returns `InvalidSecret` if the secret is rejected as an HMAC key.
pub fn sign(secret: &[u8], payload: &[u8]) -> Result<String, SignatureError> {
    Ok(hex::encode(mac(secret, payload)?.finalize().into_bytes()))
}

/// Decodes the signature header value.
///
/// # Errors
///
/// Returns `Missing` for an empty value and `InvalidFormat` if it is not hex.
pub fn decode_signature(header: &str) -> Result<Vec<u8>, SignatureError> {
    let header = header.trim();
    if header.is_empty() {
        return Err(SignatureError::Missing);
    }
    hex::decode(header).map_err(|_| SignatureError::InvalidFormat)
}

/// Checks a decoded signature against `payload` in constant time.
///
/// # Errors
///
/// Returns `Mismatch` if the digest differs, including when its length is
/// wrong.
pub fn verify(secret: &[u8], payload: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    mac(secret, payload)?.verify_slice(signature).map_err(|_| SignatureError::Mismatch)
}

fn mac(secret: &[u8], payload: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(payload);
    Ok(mac)
}
