//! Error types for payload framing.

use thiserror::Error;

/// Errors from framing and unframing payload blobs.
#[derive(Debug, Error)]
pub enum ContentError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// The blob does not look like an Escale frame.
    #[error("malformed frame: {0}")]
    BadFrame(String),

    /// The frame version is newer than this client understands.
    #[error("unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    /// The frame is encrypted but no passphrase is configured.
    #[error("payload is encrypted but no passphrase is configured")]
    MissingKey,

    /// A passphrase is configured but the frame is not encrypted.
    #[error("payload is not encrypted but a passphrase is configured")]
    UnencryptedPayload,

    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// The unframed plaintext does not match the declared length.
    #[error("plaintext length mismatch: declared {declared}, got {actual}")]
    LengthMismatch {
        /// Length from the frame header.
        declared: u64,
        /// Length actually produced.
        actual: u64,
    },

    /// Plaintext exceeds the framing size limit.
    #[error("payload too large: {0} bytes")]
    TooLarge(usize),
}
