//! At-rest encryption for installation credentials.
//!
//! Access and refresh tokens are stored as AES-256-GCM ciphertext. The stored
//! format is: `ENC:` + base64(nonce || ciphertext || tag), where the nonce is
//! 12 bytes and the tag is the 16-byte AES-GCM authentication tag.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::pbkdf2;
use std::num::NonZeroU32;
use thiserror::Error;

/// The length of the AES-256 key in bytes
const KEY_LENGTH: usize = 32;

/// The length of the AES-GCM nonce in bytes
const NONCE_LENGTH: usize = 12;

/// Number of PBKDF2 iterations for key derivation
const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => unreachable!(),
};

/// Salt for PBKDF2 key derivation
const PBKDF2_SALT: &[u8] = b"hubgate-credential-encryption-v1";

/// Prefix marking a value as ciphertext produced by this module
pub const ENCRYPTED_PREFIX: &str = "ENC:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("input to encrypt/decrypt must not be empty")]
    EmptyInput,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,
}

/// Derive a 256-bit encryption key from a secret string using PBKDF2.
fn derive_key(secret: &str) -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        PBKDF2_SALT,
        secret.as_bytes(),
        &mut key,
    );
    key
}

/// Symmetric cipher for secrets at rest.
///
/// The key is derived once from the process-wide `encryption.key` setting and
/// the cipher is shared by every component that reads or writes credentials.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(secret: &str) -> Self {
        let key = derive_key(secret);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Encrypt a non-empty plaintext.
    ///
    /// A fresh random nonce is used on every call, so encrypting the same value
    /// twice yields different ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        use rand::RngCore;

        if plaintext.is_empty() {
            return Err(CryptoError::EmptyInput);
        }

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(&combined)))
    }

    /// Decrypt a value produced by [`CredentialCipher::encrypt`].
    ///
    /// Anything that does not decrypt to a non-empty UTF-8 string is reported
    /// as `DecryptionFailed`; an empty plaintext is never a valid secret.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        if ciphertext.is_empty() {
            return Err(CryptoError::EmptyInput);
        }

        let encoded = ciphertext
            .strip_prefix(ENCRYPTED_PREFIX)
            .ok_or(CryptoError::DecryptionFailed)?;

        let combined = BASE64
            .decode(encoded)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        if combined.len() <= NONCE_LENGTH {
            return Err(CryptoError::DecryptionFailed);
        }

        let (nonce_bytes, ciphertext_bytes) = combined.split_at(NONCE_LENGTH);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext_bytes)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let plaintext = String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)?;
        if plaintext.is_empty() {
            return Err(CryptoError::DecryptionFailed);
        }

        Ok(plaintext)
    }

    /// Encrypt an optional secret, passing `None` through.
    pub fn encrypt_optional(&self, plaintext: Option<&str>) -> Result<Option<String>, CryptoError> {
        plaintext.map(|p| self.encrypt(p)).transpose()
    }
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}
