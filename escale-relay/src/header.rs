//! The textual header format shared by placeholder, lock and message
//! blobs.
//!
//! One `key=value` pair per line, values URL-escaped. Parsers ignore
//! unknown keys so older clients survive format additions.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors from header parsing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeaderError {
    /// The blob body is not UTF-8.
    #[error("header is not valid UTF-8")]
    NotUtf8,

    /// A line has no `=` separator.
    #[error("malformed header line: {0:?}")]
    MalformedLine(String),

    /// A value failed to unescape.
    #[error("malformed header value for {0:?}")]
    MalformedValue(String),

    /// A required key is missing.
    #[error("missing header key: {0}")]
    MissingKey(&'static str),

    /// A value failed domain validation.
    #[error("invalid header value for {key}: {reason}")]
    InvalidValue {
        /// The offending key.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// An ordered key/value header.
#[derive(Debug, Default, Clone)]
pub struct Header {
    fields: BTreeMap<String, String>,
}

impl Header {
    /// An empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field (raw value; escaping happens on serialization).
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Look up a field or fail with [`HeaderError::MissingKey`].
    pub fn require(&self, key: &'static str) -> Result<&str, HeaderError> {
        self.get(key).ok_or(HeaderError::MissingKey(key))
    }

    /// Serialize to the on-relay line format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push('=');
            out.push_str(&urlencoding::encode(value));
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Parse the on-relay line format. Unknown keys are retained and
    /// accessible; blank lines are skipped.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        let text = std::str::from_utf8(bytes).map_err(|_| HeaderError::NotUtf8)?;
        let mut fields = BTreeMap::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| HeaderError::MalformedLine(line.to_string()))?;
            let value = urlencoding::decode(value)
                .map_err(|_| HeaderError::MalformedValue(key.to_string()))?;
            fields.insert(key.to_string(), value.into_owned());
        }
        Ok(Self { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_escaping() {
        let mut header = Header::new();
        header.set("sender", "alice");
        header.set("note", "two words & more");

        let bytes = header.to_bytes();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("note=two%20words%20%26%20more"));

        let parsed = Header::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.get("sender"), Some("alice"));
        assert_eq!(parsed.get("note"), Some("two words & more"));
    }

    #[test]
    fn unknown_keys_are_kept() {
        let parsed = Header::from_bytes(b"sender=a\nfuture-key=whatever\n").unwrap();
        assert_eq!(parsed.get("future-key"), Some("whatever"));
    }

    #[test]
    fn malformed_lines_fail() {
        assert!(matches!(
            Header::from_bytes(b"no separator here\n"),
            Err(HeaderError::MalformedLine(_))
        ));
        assert!(matches!(
            Header::from_bytes(&[0xFF, 0xFE]),
            Err(HeaderError::NotUtf8)
        ));
    }

    #[test]
    fn require_reports_missing_keys() {
        let header = Header::from_bytes(b"a=1\n").unwrap();
        assert_eq!(header.require("a"), Ok("1"));
        assert_eq!(header.require("b"), Err(HeaderError::MissingKey("b")));
    }
}
