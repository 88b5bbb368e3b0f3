//! Placeholder blobs.
//!
//! A placeholder records the most recent sender, version counter and
//! plaintext digest for a logical path. Its presence means "a payload for
//! this path exists (or recently existed) on the relay"; a placeholder
//! without payload is the consumed state. A placeholder with no digest is
//! a tombstone advertising a deletion.

use chrono::{DateTime, SecondsFormat, Utc};
use escale_types::{Digest, Pseudonym, Version};

use crate::header::{Header, HeaderError};

/// On-relay metadata for one logical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// The client that wrote the current version; `None` once consumed.
    pub sender: Option<Pseudonym>,
    /// Version counter, strictly increasing per path.
    pub version: Version,
    /// Plaintext content digest; `None` for a tombstone.
    pub digest: Option<Digest>,
    /// When the placeholder was written.
    pub timestamp: DateTime<Utc>,
    /// Free-form flags; unknown flags are carried through untouched.
    pub flags: Vec<String>,
}

impl Placeholder {
    /// A placeholder for a freshly pushed payload.
    pub fn pushed(sender: Pseudonym, version: Version, digest: Digest) -> Self {
        Self {
            sender: Some(sender),
            version,
            digest: Some(digest),
            timestamp: Utc::now(),
            flags: Vec::new(),
        }
    }

    /// A tombstone advertising deletion of the path.
    pub fn tombstone(sender: Pseudonym, version: Version) -> Self {
        Self {
            sender: Some(sender),
            version,
            digest: None,
            timestamp: Utc::now(),
            flags: Vec::new(),
        }
    }

    /// The consumed form of this placeholder (retain-history mode).
    ///
    /// Keeps version and digest so version continuity survives the pull,
    /// but drops the sender to record that the payload was taken.
    pub fn consumed(&self) -> Self {
        Self {
            sender: None,
            version: self.version,
            digest: self.digest,
            timestamp: Utc::now(),
            flags: self.flags.clone(),
        }
    }

    /// Whether this placeholder advertises a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.digest.is_none()
    }

    /// Whether the payload has been consumed by a receiver.
    pub fn is_consumed(&self) -> bool {
        self.sender.is_none() && self.digest.is_some()
    }

    /// Serialize to the textual header format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = Header::new();
        if let Some(sender) = &self.sender {
            header.set("sender", sender.as_str());
        }
        header.set("version", self.version.to_string());
        if let Some(digest) = &self.digest {
            header.set("digest", digest.to_hex());
        }
        header.set(
            "timestamp",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        if !self.flags.is_empty() {
            header.set("flags", self.flags.join(","));
        }
        header.to_bytes()
    }

    /// Parse the textual header format. Unknown keys are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        let header = Header::from_bytes(bytes)?;
        let sender = header
            .get("sender")
            .map(|s| {
                Pseudonym::new(s).map_err(|e| HeaderError::InvalidValue {
                    key: "sender",
                    reason: e.to_string(),
                })
            })
            .transpose()?;
        let version = header
            .require("version")?
            .parse::<u64>()
            .map(Version::new)
            .map_err(|e| HeaderError::InvalidValue {
                key: "version",
                reason: e.to_string(),
            })?;
        let digest = header
            .get("digest")
            .map(|s| {
                Digest::parse_hex(s).map_err(|e| HeaderError::InvalidValue {
                    key: "digest",
                    reason: e.to_string(),
                })
            })
            .transpose()?;
        let timestamp = header
            .require("timestamp")?
            .parse::<DateTime<Utc>>()
            .map_err(|e| HeaderError::InvalidValue {
                key: "timestamp",
                reason: e.to_string(),
            })?;
        let flags = header
            .get("flags")
            .map(|s| s.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        Ok(Self {
            sender,
            version,
            digest,
            timestamp,
            flags,
        })
    }
}
