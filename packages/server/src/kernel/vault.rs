//! Credential vault: authenticated encryption for engine credentials.
//!
//! Service-account JSON and IndexNow keys are stored encrypted with
//! AES-256-GCM. Each record gets a fresh 32-byte salt (scrypt key
//! derivation from the process-wide master passphrase) and a fresh 12-byte
//! IV; the 16-byte GCM tag is kept alongside the ciphertext so tampering
//! with any of the four parts fails decryption.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use scrypt::Params;
use thiserror::Error;
use zeroize::Zeroizing;

/// scrypt cost parameter (N = 2^14).
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

const SALT_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum VaultError {
    /// GCM tag verification failed: wrong key, or ciphertext/IV/tag/salt
    /// was altered.
    #[error("invalid credential: decryption failed")]
    InvalidCredential,
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("decrypted credential is not valid UTF-8")]
    NotUtf8,
}

/// An encrypted credential record, one row's worth of ciphertext material.
#[derive(Debug, Clone)]
pub struct EncryptedCredential {
    pub encrypted_data: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub salt: Vec<u8>,
}

/// Encrypts and decrypts credential payloads with a master passphrase.
#[derive(Clone)]
pub struct CredentialVault {
    passphrase: String,
}

impl CredentialVault {
    /// The passphrase length is validated at config load; this constructor
    /// trusts its caller.
    pub fn new(passphrase: String) -> Self {
        Self { passphrase }
    }

    fn derive_key(&self, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, VaultError> {
        let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32)
            .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;
        let mut key = Zeroizing::new([0u8; 32]);
        scrypt::scrypt(self.passphrase.as_bytes(), salt, &params, key.as_mut())
            .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;
        Ok(key)
    }

    /// Encrypt a plaintext credential. Every call draws a fresh salt and IV.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedCredential, VaultError> {
        let mut salt = vec![0u8; SALT_LEN];
        let mut iv = vec![0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut iv);

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));

        // aes-gcm appends the tag to the ciphertext; store it separately
        let mut sealed = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &[],
                },
            )
            .map_err(|_| VaultError::InvalidCredential)?;
        let auth_tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(EncryptedCredential {
            encrypted_data: sealed,
            iv,
            auth_tag,
            salt,
        })
    }

    /// Decrypt a stored credential. The returned buffer zeroes itself when
    /// dropped; callers must not copy the secret into longer-lived storage.
    pub fn decrypt(&self, record: &EncryptedCredential) -> Result<Zeroizing<String>, VaultError> {
        let key = self.derive_key(&record.salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));

        let mut sealed = record.encrypted_data.clone();
        sealed.extend_from_slice(&record.auth_tag);

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&record.iv),
                Payload {
                    msg: &sealed,
                    aad: &[],
                },
            )
            .map_err(|_| VaultError::InvalidCredential)?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|_| VaultError::NotUtf8)
    }
}

/// 32 lowercase hex chars from a CSPRNG, the IndexNow key format.
pub fn generate_indexnow_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
