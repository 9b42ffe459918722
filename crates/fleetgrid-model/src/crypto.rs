//! Encryption at rest for dependency values and depender data.
//!
//! ChaCha20-Poly1305 under a key derived from the configured secret with
//! SHA-256. Ciphertexts are stored as base64 of `nonce || ciphertext`.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{ModelError, ModelResult};

/// Nonce length for ChaCha20-Poly1305 (12 bytes).
pub const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct Cipher {
    key: [u8; 32],
}

impl Cipher {
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> ModelResult<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| ModelError::Crypto(format!("encryption failed: {e}")))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub fn decrypt(&self, encoded: &str) -> ModelResult<Vec<u8>> {
        let sealed = BASE64
            .decode(encoded)
            .map_err(|e| ModelError::Crypto(format!("malformed ciphertext: {e}")))?;
        if sealed.len() < NONCE_LEN {
            return Err(ModelError::Crypto("ciphertext shorter than nonce".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ModelError::Crypto("failed to decrypt value (wrong secret?)".into()))
    }

    pub fn encrypt_str(&self, plaintext: &str) -> ModelResult<String> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, encoded: &str) -> ModelResult<String> {
        let bytes = self.decrypt(encoded)?;
        String::from_utf8(bytes).map_err(|e| ModelError::Crypto(e.to_string()))
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt() {
        let cipher = Cipher::from_secret("s3cret");
        let sealed = cipher.encrypt_str("postgres://db:5432").unwrap();
        assert_ne!(sealed, "postgres://db:5432");
        assert_eq!(cipher.decrypt_str(&sealed).unwrap(), "postgres://db:5432");
    }

    #[test]
    fn nonces_differ() {
        let cipher = Cipher::from_secret("s3cret");
        assert_ne!(
            cipher.encrypt_str("same").unwrap(),
            cipher.encrypt_str("same").unwrap()
        );
    }

    #[test]
    fn wrong_secret_fails() {
        let sealed = Cipher::from_secret("a").encrypt_str("value").unwrap();
        assert!(Cipher::from_secret("b").decrypt_str(&sealed).is_err());
        assert!(Cipher::from_secret("a").decrypt_str("not base64!").is_err());
    }
}
