//! GitHub-style HMAC-SHA-256 body signatures: `sha256=<hex>` computed over
//! the raw, unparsed request body, verified with a constant-time
//! comparison. The scheme carries no embedded timestamp component —
//! delivery-id and event-type arrive as separate headers instead.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug)]
pub enum SignatureError {
    /// Header did not carry the expected `sha256=` prefix.
    InvalidFormat,
    /// Signature did not match the computed HMAC.
    Mismatch,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFormat => write!(f, "signature header is not in sha256=<hex> format"),
            Self::Mismatch => write!(f, "signature does not match"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Computes `sha256=HEX(HMAC-SHA-256(body, secret))`.
pub fn sign_hmac_sha256(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    format!("{SIGNATURE_PREFIX}{}", hex::encode(digest))
}

/// Verifies a `sha256=<hex>` header against the raw body and shared secret,
/// using a constant-time comparison.
pub fn verify_hmac_sha256(secret: &str, body: &[u8], header_value: &str) -> Result<(), SignatureError> {
    let provided_hex = header_value
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::InvalidFormat)?;

    let expected = sign_hmac_sha256(secret, body);
    let expected_hex = expected
        .strip_prefix(SIGNATURE_PREFIX)
        .expect("sign_hmac_sha256 always emits the sha256= prefix");

    if constant_time_compare(provided_hex, expected_hex) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Hex-encoded SHA-256 digest of the raw payload bytes, stored as
/// `Event.payload_hash`.
pub fn hash_payload(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Compares two strings without leaking timing information about where
/// they first differ. Length differences still short-circuit, which
/// cannot leak content of either string.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let body = b"{\"ref\":\"refs/heads/main\"}";
        let sig = sign_hmac_sha256("core-secret", body);
        assert!(sig.starts_with("sha256="));
        assert!(verify_hmac_sha256("core-secret", body, &sig).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = b"payload";
        let sig = sign_hmac_sha256("wrong", body);
        assert!(verify_hmac_sha256("core-secret", body, &sig).is_err());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let sig = sign_hmac_sha256("core-secret", b"original");
        assert!(verify_hmac_sha256("core-secret", b"tampered", &sig).is_err());
    }

    #[test]
    fn missing_prefix_is_invalid_format() {
        let err = verify_hmac_sha256("s", b"b", "deadbeef").unwrap_err();
        assert!(matches!(err, SignatureError::InvalidFormat));
    }

    #[test]
    fn constant_time_compare_rejects_different_lengths() {
        assert!(!constant_time_compare("abc", "abcd"));
    }

    #[test]
    fn constant_time_compare_accepts_equal_strings() {
        assert!(constant_time_compare("abcdef", "abcdef"));
    }
}
