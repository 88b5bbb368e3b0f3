//! Identity, ordering and integrity types for Escale.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A client's stable pseudonym.
///
/// Chosen once at configuration time, it identifies the client in locks,
/// placeholders and messages on the relay. Opaque to every other client.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pseudonym(String);

/// Maximum pseudonym length in bytes.
pub const MAX_PSEUDONYM_LEN: usize = 64;

/// Errors from pseudonym validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PseudonymError {
    /// Empty pseudonym.
    #[error("pseudonym must not be empty")]
    Empty,

    /// Too long.
    #[error("pseudonym exceeds {MAX_PSEUDONYM_LEN} bytes")]
    TooLong,

    /// Contains a character outside `[A-Za-z0-9._-]`.
    #[error("pseudonym contains invalid character {0:?}")]
    InvalidChar(char),
}

impl Pseudonym {
    /// Validate and wrap a pseudonym string.
    ///
    /// Pseudonyms appear verbatim in relay blob names, so the alphabet is
    /// restricted to `[A-Za-z0-9._-]`.
    pub fn new(s: &str) -> Result<Self, PseudonymError> {
        if s.is_empty() {
            return Err(PseudonymError::Empty);
        }
        if s.len() > MAX_PSEUDONYM_LEN {
            return Err(PseudonymError::TooLong);
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(PseudonymError::InvalidChar(c));
        }
        Ok(Self(s.to_string()))
    }

    /// The pseudonym as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Pseudonym {
    type Err = PseudonymError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pseudonym({})", self.0)
    }
}

/// A per-path version counter.
///
/// Versions are strictly monotonic across the lifetime of a logical path:
/// a client never re-uses or rewinds a version it has written. Counters
/// are compared numerically; the relay never assigns them.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Wrap a raw counter value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The version meaning "never written".
    pub fn zero() -> Self {
        Self(0)
    }

    /// The numeric counter value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The next version in the sequence.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

/// A 32-byte BLAKE3 hash of a file's plaintext content.
///
/// The digest recorded in a placeholder is always computed over the
/// plaintext, so clients with different compression or cipher settings
/// still compare equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest([u8; 32]);

/// Errors from parsing a hex digest.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestParseError {
    /// Not valid hex.
    #[error("digest is not valid hex: {0}")]
    BadHex(String),

    /// Wrong length.
    #[error("digest must be 32 bytes, got {0}")]
    BadLength(usize),
}

impl Digest {
    /// Wrap raw hash bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a lowercase hex digest as produced by [`Digest::to_hex`].
    pub fn parse_hex(s: &str) -> Result<Self, DigestParseError> {
        let bytes = hex::decode(s).map_err(|e| DigestParseError::BadHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(DigestParseError::BadLength(bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Hex encoding of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..8])
    }
}
