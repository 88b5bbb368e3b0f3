//! Logical paths - the identity of a synchronized file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Suffixes reserved for protocol blobs on the relay.
///
/// A local file whose name ends in one of these (or contains a reserved
/// marker such as `.message.` or `.tmp.`) is rejected at scan time, since
/// its relay name would collide with a protocol blob.
pub const RESERVED_SUFFIXES: &[&str] = &[".placeholder", ".lock"];

/// Markers that may be followed by an arbitrary tail (recipient, nonce,
/// conflict tag) and are therefore matched anywhere in the final
/// component.
pub const RESERVED_MARKERS: &[&str] = &[".message.", ".tmp.", ".conflict-"];

/// A canonical UTF-8 relative path from the repository root.
///
/// Always uses forward slashes, never starts with `/`, and contains no
/// `.` or `..` segments. Two clients referring to the same file always
/// produce the same `LogicalPath`, which makes it the identity of a
/// synchronized object.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalPath(String);

/// Errors from logical path canonicalization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    /// Empty path.
    #[error("path must not be empty")]
    Empty,

    /// Absolute paths are not relative to the repository root.
    #[error("path must be relative: {0}")]
    Absolute(String),

    /// `.` or `..` segments are not allowed.
    #[error("path contains a relative segment: {0}")]
    RelativeSegment(String),

    /// Embedded NUL or backslash.
    #[error("path contains a forbidden character: {0}")]
    ForbiddenChar(String),

    /// The final component ends in a reserved protocol suffix.
    #[error("path collides with a reserved relay suffix: {0}")]
    ReservedSuffix(String),
}

impl LogicalPath {
    /// Canonicalize and validate a relative path string.
    pub fn new(s: &str) -> Result<Self, PathError> {
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        if s.contains('\0') || s.contains('\\') {
            return Err(PathError::ForbiddenChar(s.to_string()));
        }
        if s.starts_with('/') {
            return Err(PathError::Absolute(s.to_string()));
        }
        let mut segments = Vec::new();
        for segment in s.split('/') {
            match segment {
                "" => continue, // collapse duplicate slashes and trailing slash
                "." | ".." => return Err(PathError::RelativeSegment(s.to_string())),
                other => segments.push(other),
            }
        }
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        let canonical = segments.join("/");
        let name = segments[segments.len() - 1];
        if Self::name_is_reserved(name) {
            return Err(PathError::ReservedSuffix(canonical));
        }
        Ok(Self(canonical))
    }

    /// Whether a file name collides with a protocol blob name.
    pub fn name_is_reserved(name: &str) -> bool {
        RESERVED_SUFFIXES.iter().any(|s| name.ends_with(s))
            || RESERVED_MARKERS.iter().any(|m| name.contains(m))
    }

    /// The canonical path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The final path component.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Resolve against a local repository root.
    pub fn to_local(&self, root: &Path) -> std::path::PathBuf {
        let mut out = root.to_path_buf();
        for segment in self.0.split('/') {
            out.push(segment);
        }
        out
    }
}

impl FromStr for LogicalPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalPath({})", self.0)
    }
}
