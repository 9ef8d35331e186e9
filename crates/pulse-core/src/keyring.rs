//! Credential keyring.
//!
//! Integration credentials are stored as opaque encrypted blobs; this is the
//! single component that can open them. AES-256-GCM with a key derived from
//! the process signing key; blobs are base64(nonce ‖ ciphertext).

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("credential blob is not valid base64")]
    Encoding(#[from] base64::DecodeError),
    #[error("credential blob is truncated")]
    Truncated,
    #[error("credential decryption failed")]
    Decrypt,
    #[error("credential encryption failed")]
    Encrypt,
    #[error("decrypted credential is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub struct Keyring {
    cipher: Aes256Gcm,
}

impl Keyring {
    /// Derive the cipher key from the process signing key.
    pub fn new(signing_key: &str) -> Self {
        let digest = Sha256::digest(signing_key.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, KeyringError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| KeyringError::Encrypt)?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> Result<String, KeyringError> {
        let bytes = BASE64.decode(blob)?;
        if bytes.len() <= NONCE_LEN {
            return Err(KeyringError::Truncated);
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| KeyringError::Decrypt)?;
        Ok(String::from_utf8(plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let keyring = Keyring::new("test-signing-key");
        let blob = keyring.encrypt("ghp_secret_token").unwrap();
        assert_ne!(blob, "ghp_secret_token");
        assert_eq!(keyring.decrypt(&blob).unwrap(), "ghp_secret_token");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let blob = Keyring::new("key-a").encrypt("secret").unwrap();
        assert!(matches!(
            Keyring::new("key-b").decrypt(&blob),
            Err(KeyringError::Decrypt)
        ));
    }

    #[test]
    fn garbage_blob_is_rejected() {
        let keyring = Keyring::new("key");
        assert!(keyring.decrypt("not base64 !!").is_err());
        assert!(matches!(
            keyring.decrypt(&BASE64.encode([0u8; 8])),
            Err(KeyringError::Truncated)
        ));
    }
}
