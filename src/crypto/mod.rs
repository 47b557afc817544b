//! AES-256-GCM encryption for stored token secrets.
//!
//! The key is derived once at startup by hashing a configured passphrase,
//! so ciphertexts survive process restarts. Each value is encrypted with a
//! fresh nonce; the nonce is carried inside the ciphertext string, which
//! keeps stored secrets a single opaque column.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Symmetric cipher for token secrets.
///
/// Cheap to clone behind an `Arc`; the key lives in memory only.
/// Rotating the passphrase invalidates every stored ciphertext — there is
/// no migration path, decryption simply fails with [`CryptoError`].
pub struct Cipher {
    key: [u8; 32],
}

impl Cipher {
    /// Derives the encryption key from a passphrase via SHA-256.
    ///
    /// Derivation is deterministic: the same passphrase always yields the
    /// same key, so two processes configured alike can read each other's
    /// ciphertexts.
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Encrypts a plaintext secret.
    ///
    /// Returns `base64(nonce || ciphertext)`. A random nonce is generated
    /// per call, so encrypting the same value twice yields different
    /// ciphertexts.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&combined))
    }

    /// Decrypts a ciphertext produced by [`encrypt`](Self::encrypt).
    ///
    /// Fails on invalid base64, truncated input, a key mismatch, or
    /// tampering (GCM is authenticated). Callers must propagate this —
    /// a decrypt failure on stored data means corruption or a passphrase
    /// rotation without migration.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let combined = BASE64
            .decode(ciphertext)
            .map_err(|e| CryptoError::InvalidCiphertext(format!("invalid base64: {}", e)))?;

        if combined.len() < NONCE_SIZE {
            return Err(CryptoError::InvalidCiphertext(format!(
                "ciphertext too short: {} bytes",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext_bytes) = combined.split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext_bytes)
            .map_err(|_| CryptoError::DecryptionFailed("wrong key or corrupted data".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::InvalidCiphertext("decrypted data is not UTF-8".to_string()))
    }
}

/// Cipher errors
#[derive(Debug, Clone, PartialEq)]
pub enum CryptoError {
    /// Ciphertext is not valid base64, is truncated, or decodes to non-UTF-8
    InvalidCiphertext(String),
    /// AEAD decryption failed (wrong key or tampered data)
    DecryptionFailed(String),
    /// AEAD encryption failed
    EncryptionFailed(String),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::InvalidCiphertext(msg) => write!(f, "Invalid ciphertext: {}", msg),
            CryptoError::DecryptionFailed(msg) => write!(f, "Decryption failed: {}", msg),
            CryptoError::EncryptionFailed(msg) => write!(f, "Encryption failed: {}", msg),
        }
    }
}

impl std::error::Error for CryptoError {}
