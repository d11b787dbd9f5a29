//! # hookrelay-crypto
//!
//! HMAC-SHA-256 signing/verification with constant-time comparison,
//! and PBKDF2 + AES-256-GCM header encryption.

pub mod encryption;
pub mod signature;

pub use encryption::{EncryptedHeaders, HeaderCipher};
pub use signature::{constant_time_compare, hash_payload, sign_hmac_sha256, verify_hmac_sha256, SignatureError};
