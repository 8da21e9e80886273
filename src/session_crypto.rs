//! AES-256-GCM envelope for session records.
//!
//! The key is SHA-256 of the configured secret. Each encryption draws a fresh 16-byte IV;
//! the 16-byte tag is kept detached so the stored record is `{iv, authTag, encrypted}`,
//! every field lowercase hex.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::SessionError;

/// AES-256-GCM with a 16-byte nonce
type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

/// Encrypted session record as persisted in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub iv: String,
    #[serde(rename = "authTag")]
    pub auth_tag: String,
    pub encrypted: String,
}

pub struct SessionCipher {
    cipher: Aes256Gcm16,
}

impl SessionCipher {
    /// Derive the cipher key from a secret string
    pub fn from_secret(secret: &str) -> Result<Self, SessionError> {
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&Sha256::digest(secret.as_bytes()));
        let cipher = Aes256Gcm16::new_from_slice(key.as_slice())
            .map_err(|e| SessionError::Encryption(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Build from the secret held in environment variable `var`.
    ///
    /// Unset or empty is a configuration error; there is no unencrypted mode.
    pub fn from_env(var: &str) -> Result<Self, SessionError> {
        let secret = Zeroizing::new(
            std::env::var(var)
                .ok()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| SessionError::MissingEncryptionKey(var.to_string()))?,
        );
        Self::from_secret(&secret)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedData, SessionError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::<U16>::from_slice(&iv), b"", &mut buffer)
            .map_err(|e| SessionError::Encryption(e.to_string()))?;

        Ok(EncryptedData {
            iv: hex::encode(iv),
            auth_tag: hex::encode(tag),
            encrypted: hex::encode(buffer),
        })
    }

    /// Decrypt and authenticate a record. Any tampering, truncation or bad hex is an error.
    pub fn decrypt(&self, data: &EncryptedData) -> Result<String, SessionError> {
        let iv = decode_exact(&data.iv, IV_LEN, "iv")?;
        let tag = decode_exact(&data.auth_tag, TAG_LEN, "authTag")?;
        let mut buffer = hex::decode(&data.encrypted)
            .map_err(|e| SessionError::Encryption(format!("invalid ciphertext hex: {}", e)))?;

        self.cipher
            .decrypt_in_place_detached(
                Nonce::<U16>::from_slice(&iv),
                b"",
                &mut buffer,
                Tag::<U16>::from_slice(&tag),
            )
            .map_err(|_| SessionError::Encryption("authentication failed".to_string()))?;

        String::from_utf8(buffer)
            .map_err(|e| SessionError::Encryption(format!("plaintext is not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher").finish_non_exhaustive()
    }
}

fn decode_exact(value: &str, len: usize, field: &str) -> Result<Vec<u8>, SessionError> {
    let bytes = hex::decode(value)
        .map_err(|e| SessionError::Encryption(format!("invalid {} hex: {}", field, e)))?;
    if bytes.len() != len {
        return Err(SessionError::Encryption(format!(
            "{} must be {} bytes, got {}",
            field,
            len,
            bytes.len()
        )));
    }
    Ok(bytes)
}
