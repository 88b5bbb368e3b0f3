//! Per-path access rights.
//!
//! Each synchronized path carries a read flag and a write flag. A flag is
//! either allowed, denied, or gated: a gated operation requires an
//! explicit grant message on the relay before it proceeds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// State of a single access flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessFlag {
    /// The operation is allowed.
    #[default]
    Allowed,
    /// The operation is denied.
    Denied,
    /// The operation requires a grant message from a peer.
    Gated,
}

impl AccessFlag {
    fn sigil(&self) -> &'static str {
        match self {
            AccessFlag::Allowed => "",
            AccessFlag::Denied => "-",
            AccessFlag::Gated => "?",
        }
    }
}

/// Read and write rights for one path.
///
/// The textual form combines `r`/`w` with a trailing sigil: none
/// (allowed), `-` (denied) or `?` (gated). Example: `"r w?"` reads as
/// "read allowed, write gated".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct AccessRights {
    /// Whether this client may pull the path.
    pub read: AccessFlag,
    /// Whether this client may push the path.
    pub write: AccessFlag,
}

/// Errors from parsing the access modifier syntax.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessParseError {
    /// A token did not start with `r` or `w`.
    #[error("unknown access token: {0:?}")]
    UnknownToken(String),

    /// A flag appeared twice.
    #[error("duplicate access flag: {0:?}")]
    Duplicate(char),
}

impl AccessRights {
    /// Rights allowing both directions.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parse the `access` modifier syntax, e.g. `"r w?"` or `"r- w"`.
    ///
    /// Omitted flags keep their default (allowed).
    pub fn parse(s: &str) -> Result<Self, AccessParseError> {
        let mut rights = Self::default();
        let mut seen_r = false;
        let mut seen_w = false;
        for token in s.split_whitespace() {
            let (which, rest) = token.split_at(1);
            let flag = match rest {
                "" => AccessFlag::Allowed,
                "-" => AccessFlag::Denied,
                "?" => AccessFlag::Gated,
                _ => return Err(AccessParseError::UnknownToken(token.to_string())),
            };
            match which {
                "r" => {
                    if seen_r {
                        return Err(AccessParseError::Duplicate('r'));
                    }
                    seen_r = true;
                    rights.read = flag;
                }
                "w" => {
                    if seen_w {
                        return Err(AccessParseError::Duplicate('w'));
                    }
                    seen_w = true;
                    rights.write = flag;
                }
                _ => return Err(AccessParseError::UnknownToken(token.to_string())),
            }
        }
        Ok(rights)
    }
}

impl FromStr for AccessRights {
    type Err = AccessParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AccessRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{} w{}", self.read.sigil(), self.write.sigil())
    }
}
