//! Key derivation for payload encryption.
//!
//! passphrase → [`RepoSecret`] (Argon2id, per-repository salt) →
//! [`ContentKey`] (HKDF-SHA256 subkey). Rotating the passphrase changes
//! every derived key, which is why rotation requires re-encrypting all
//! payloads on the relay.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::ContentError;
use crate::frame::NONCE_SIZE;

/// Key size in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Per-repository salt size in bytes.
pub const SALT_SIZE: usize = 16;

/// The repository secret derived from the configured passphrase.
#[derive(Clone)]
pub struct RepoSecret([u8; KEY_SIZE]);

impl RepoSecret {
    /// Derive the secret from a passphrase and the repository salt.
    ///
    /// Argon2id with the library defaults (19 MiB, 2 iterations). The
    /// salt is generated once at repository creation and stored in the
    /// configuration; every client of the repository must use the same
    /// salt to derive the same secret.
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Self, ContentError> {
        let params = Params::new(
            Params::DEFAULT_M_COST,
            Params::DEFAULT_T_COST,
            Params::DEFAULT_P_COST,
            Some(KEY_SIZE),
        )
        .map_err(|e| ContentError::EncryptionFailed(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut output = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut output)
            .map_err(|e| ContentError::EncryptionFailed(e.to_string()))?;
        Ok(Self(output))
    }

    /// Wrap pre-derived secret bytes.
    pub fn from_raw(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// A random secret (tests).
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// The raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

// Don't leak the secret in debug output.
impl std::fmt::Debug for RepoSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RepoSecret([REDACTED])")
    }
}

/// The AEAD key payloads are encrypted with.
#[derive(Clone)]
pub struct ContentKey([u8; KEY_SIZE]);

impl ContentKey {
    /// Derive the content key from the repository secret.
    pub fn derive(secret: &RepoSecret) -> Self {
        let hkdf = Hkdf::<Sha256>::new(Some(b"escale-content-key-v1"), secret.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(b"payload-encryption", &mut key)
            .expect("HKDF expand with valid length");
        Self(key)
    }

    /// Encrypt with XChaCha20-Poly1305 under a fresh random nonce.
    ///
    /// 192-bit nonces are safe to generate randomly without coordination
    /// between clients.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), ContentError> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| ContentError::EncryptionFailed(e.to_string()))?;

        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| ContentError::EncryptionFailed(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| ContentError::EncryptionFailed("aead encrypt failed".into()))?;
        Ok((ciphertext, nonce))
    }

    /// Decrypt; fails on any tampering with ciphertext or nonce.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, ContentError> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|_| ContentError::DecryptionFailed)?;
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| ContentError::DecryptionFailed)
    }
}

// Don't leak the key in debug output.
impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentKey([REDACTED])")
    }
}
