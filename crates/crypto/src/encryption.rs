//! Header encryption: AES-256-GCM over a PBKDF2-derived key.
//!
//! `headers_data` stores `{encrypted, iv, tag, salt}`, all hex-encoded.
//! Key derivation: PBKDF2-HMAC-SHA-256 over a configured master secret
//! with a fresh random salt at 100,000 iterations, producing a 32-byte
//! AES-256 key. Cipher: AES-256-GCM with a 16-byte IV and a fixed
//! associated-data string.

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, AesGcm, Key};
use aes_gcm::aes::Aes256;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const ASSOCIATED_DATA: &[u8] = b"hookrelay:headers:v1";

/// AES-256-GCM parameterized to the spec's 16-byte IV (AES-GCM's default
/// nonce size is 12 bytes; the spec mandates 16).
type Aes256Gcm16 = AesGcm<Aes256, U16>;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed: corrupt or mis-keyed headers_data")]
    DecryptFailed,
    #[error("malformed encrypted headers bundle: {0}")]
    Malformed(String),
}

/// The serialized `{encrypted, iv, tag, salt}` bundle stored in
/// `events.headers_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedHeaders {
    pub encrypted: String,
    pub iv: String,
    pub tag: String,
    pub salt: String,
}

/// Derives a key and performs AES-256-GCM encrypt/decrypt of header maps
/// under a single master secret.
#[derive(Clone)]
pub struct HeaderCipher {
    master_secret: String,
}

impl HeaderCipher {
    pub fn new(master_secret: impl Into<String>) -> Self {
        Self {
            master_secret: master_secret.into(),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> Key<Aes256Gcm> {
        let mut key_bytes = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(
            self.master_secret.as_bytes(),
            salt,
            PBKDF2_ITERATIONS,
            &mut key_bytes,
        );
        Key::<Aes256Gcm>::clone_from_slice(&key_bytes)
    }

    /// Encrypts a header map (as its JSON serialization) into the bundle
    /// format persisted in `headers_data`.
    pub fn encrypt(&self, headers: &std::collections::HashMap<String, String>) -> Result<EncryptedHeaders, EncryptionError> {
        let plaintext = serde_json::to_vec(headers).map_err(|_| EncryptionError::EncryptFailed)?;

        let mut salt = [0u8; SALT_LEN];
        aes_gcm::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut salt);
        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm16::new(&key);
        let nonce = Aes256Gcm16::generate_nonce(&mut OsRng);

        let mut ciphertext_and_tag = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: ASSOCIATED_DATA,
                },
            )
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let tag = ciphertext_and_tag.split_off(ciphertext_and_tag.len() - 16);

        Ok(EncryptedHeaders {
            encrypted: hex::encode(ciphertext_and_tag),
            iv: hex::encode(nonce),
            tag: hex::encode(tag),
            salt: hex::encode(salt),
        })
    }

    /// Decrypts a bundle back into the original header map.
    pub fn decrypt(
        &self,
        bundle: &EncryptedHeaders,
    ) -> Result<std::collections::HashMap<String, String>, EncryptionError> {
        let salt = hex::decode(&bundle.salt).map_err(|e| EncryptionError::Malformed(e.to_string()))?;
        let iv = hex::decode(&bundle.iv).map_err(|e| EncryptionError::Malformed(e.to_string()))?;
        let tag = hex::decode(&bundle.tag).map_err(|e| EncryptionError::Malformed(e.to_string()))?;
        let mut encrypted =
            hex::decode(&bundle.encrypted).map_err(|e| EncryptionError::Malformed(e.to_string()))?;
        encrypted.extend_from_slice(&tag);

        if iv.len() != 16 {
            return Err(EncryptionError::Malformed("iv must be 16 bytes".into()));
        }

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm16::new(&key);
        let nonce = aes_gcm::aead::generic_array::GenericArray::<u8, U16>::clone_from_slice(&iv);

        let plaintext = cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: &encrypted,
                    aad: ASSOCIATED_DATA,
                },
            )
            .map_err(|_| EncryptionError::DecryptFailed)?;

        serde_json::from_slice(&plaintext).map_err(|e| EncryptionError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_headers() -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert("signature".to_string(), "sha256=deadbeef".to_string());
        h.insert("content-type".to_string(), "application/json".to_string());
        h
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cipher = HeaderCipher::new("master-secret");
        let headers = sample_headers();
        let bundle = cipher.encrypt(&headers).unwrap();
        let decrypted = cipher.decrypt(&bundle).unwrap();
        assert_eq!(decrypted, headers);
    }

    #[test]
    fn bundle_fields_are_hex_encoded() {
        let cipher = HeaderCipher::new("master-secret");
        let bundle = cipher.encrypt(&sample_headers()).unwrap();
        for field in [&bundle.encrypted, &bundle.iv, &bundle.tag, &bundle.salt] {
            assert!(hex::decode(field).is_ok());
        }
        assert_eq!(hex::decode(&bundle.iv).unwrap().len(), 16);
        assert_eq!(hex::decode(&bundle.tag).unwrap().len(), 16);
    }

    #[test]
    fn wrong_master_secret_fails_to_decrypt() {
        let bundle = HeaderCipher::new("right-secret").encrypt(&sample_headers()).unwrap();
        let err = HeaderCipher::new("wrong-secret").decrypt(&bundle).unwrap_err();
        assert!(matches!(err, EncryptionError::DecryptFailed));
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let cipher = HeaderCipher::new("master-secret");
        let mut bundle = cipher.encrypt(&sample_headers()).unwrap();
        let mut bytes = hex::decode(&bundle.encrypted).unwrap();
        bytes[0] ^= 0xFF;
        bundle.encrypted = hex::encode(bytes);
        assert!(cipher.decrypt(&bundle).is_err());
    }
}
