//! Naming and encoding of relay blobs.
//!
//! A logical path maps to a family of relay names: the payload itself
//! plus the protocol blobs derived from it by a category suffix. The
//! escape is reversible, so a directory listing can be mapped back to
//! logical paths without a lookup table (except for over-long names,
//! which are hashed into a bucket and resolved through the index).

use std::fmt;

use escale_types::{LogicalPath, Pseudonym};

/// Suffix of placeholder blobs.
pub const PLACEHOLDER_SUFFIX: &str = ".placeholder";

/// Suffix of lock blobs.
pub const LOCK_SUFFIX: &str = ".lock";

/// Infix of addressed message blobs; the recipient pseudonym follows.
pub const MESSAGE_INFIX: &str = ".message.";

/// Infix of in-flight upload blobs; a nonce follows.
pub const TMP_INFIX: &str = ".tmp.";

/// Prefix of client identity markers.
pub const IDENTITY_PREFIX: &str = ".identity.";

/// Bucket prefix for hashed over-long names.
const HASH_BUCKET: &str = "_x/";

/// Default maximum relay name length in bytes.
///
/// 255 is the common denominator of FTP servers and POSIX filesystems.
pub const DEFAULT_MAX_NAME_LEN: usize = 255;

/// Bytes reserved for the longest category suffix a base name can grow
/// (`.message.` plus a maximal pseudonym).
const SUFFIX_RESERVE: usize = 80;

/// A blob name on the relay, relative to the repository's relay root.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayName(String);

impl RelayName {
    /// Wrap an already-formed relay name (adapters, tests).
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayName({})", self.0)
    }
}

/// What a listed relay name is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    /// A framed payload blob.
    Payload,
    /// A placeholder blob.
    Placeholder,
    /// A lock blob.
    Lock,
    /// An addressed message blob.
    Message {
        /// The recipient pseudonym (unvalidated; from the name).
        recipient: String,
    },
    /// An in-flight upload; transient, ignored by scans.
    Temp,
    /// A client identity marker.
    Identity {
        /// The advertised pseudonym (unvalidated; from the name).
        pseudonym: String,
    },
}

/// Relay name construction and parsing for one repository.
#[derive(Debug, Clone)]
pub struct Naming {
    max_name_len: usize,
}

impl Default for Naming {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NAME_LEN)
    }
}

impl Naming {
    /// Create a naming scheme with the backend's maximum name length.
    pub fn new(max_name_len: usize) -> Self {
        Self { max_name_len }
    }

    /// The escaped base name for a logical path.
    ///
    /// Over-long names are replaced by a 2-level bucketed digest; the
    /// caller records the mapping in the index side table.
    pub fn base(&self, path: &LogicalPath) -> String {
        let escaped = escape(path.as_str());
        if escaped.len() + SUFFIX_RESERVE > self.max_name_len {
            let digest = blake3::hash(path.as_str().as_bytes()).to_hex().to_string();
            format!("{HASH_BUCKET}{}/{digest}", &digest[..2])
        } else {
            escaped
        }
    }

    /// Whether a base name is a hashed bucket entry.
    pub fn is_hashed(base: &str) -> bool {
        base.starts_with(HASH_BUCKET)
    }

    /// Payload blob name for a path.
    pub fn payload(&self, path: &LogicalPath) -> RelayName {
        RelayName(self.base(path))
    }

    /// Placeholder blob name for a path.
    pub fn placeholder(&self, path: &LogicalPath) -> RelayName {
        RelayName(format!("{}{PLACEHOLDER_SUFFIX}", self.base(path)))
    }

    /// Lock blob name for a path.
    pub fn lock(&self, path: &LogicalPath) -> RelayName {
        RelayName(format!("{}{LOCK_SUFFIX}", self.base(path)))
    }

    /// Message blob name for a path, addressed to `recipient`.
    pub fn message(&self, path: &LogicalPath, recipient: &Pseudonym) -> RelayName {
        RelayName(format!("{}{MESSAGE_INFIX}{recipient}", self.base(path)))
    }

    /// A fresh in-flight upload name for a path.
    pub fn tmp(&self, path: &LogicalPath) -> RelayName {
        RelayName(format!(
            "{}{TMP_INFIX}{}",
            self.base(path),
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Identity marker name for a pseudonym.
    pub fn identity(pseudonym: &Pseudonym) -> RelayName {
        RelayName(format!("{IDENTITY_PREFIX}{pseudonym}"))
    }

    /// Split a listed relay name into its escaped base and category.
    pub fn parse(name: &RelayName) -> (String, Category) {
        let s = name.as_str();
        if let Some(pseudonym) = s.strip_prefix(IDENTITY_PREFIX) {
            return (
                String::new(),
                Category::Identity {
                    pseudonym: pseudonym.to_string(),
                },
            );
        }
        if let Some(pos) = s.rfind(TMP_INFIX) {
            return (s[..pos].to_string(), Category::Temp);
        }
        if let Some(base) = s.strip_suffix(PLACEHOLDER_SUFFIX) {
            return (base.to_string(), Category::Placeholder);
        }
        if let Some(base) = s.strip_suffix(LOCK_SUFFIX) {
            return (base.to_string(), Category::Lock);
        }
        if let Some(pos) = s.rfind(MESSAGE_INFIX) {
            return (
                s[..pos].to_string(),
                Category::Message {
                    recipient: s[pos + MESSAGE_INFIX.len()..].to_string(),
                },
            );
        }
        (s.to_string(), Category::Payload)
    }

    /// Map an escaped base name back to a logical path.
    ///
    /// Returns `None` for hashed bucket entries (resolved through the
    /// index side table) and for names that fail to unescape.
    pub fn logical_from_base(base: &str) -> Option<LogicalPath> {
        if Self::is_hashed(base) {
            return None;
        }
        let unescaped = unescape(base)?;
        LogicalPath::new(&unescaped).ok()
    }
}

/// Reversibly escape a logical path for use as a relay name.
///
/// Bytes outside `[A-Za-z0-9._/-]`, plus `%` itself, become `%XX`.
fn escape(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for &b in path.as_bytes() {
        let keep = b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'/');
        if keep {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&format!("{b:02X}"));
        }
    }
    out
}

/// Invert [`escape`]. Returns `None` on malformed escapes or invalid UTF-8.
fn unescape(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
