//! Addressed message blobs.
//!
//! Messages carry directed requests between clients that never talk to
//! each other: "please push me this path", access grants and access
//! changes. The recipient consumes a message on its next scan and
//! deletes it after applying. Payloads are idempotent, so repeated
//! delivery is harmless.

use chrono::{DateTime, SecondsFormat, Utc};
use escale_types::{AccessRights, Pseudonym};

use crate::header::{Header, HeaderError};

/// What a message asks of its recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Ask the recipient to push the path (also the gated-read request).
    PullRequest,
    /// Grant a gated operation requested earlier.
    AccessGrant,
    /// Advertise changed access rights for the path.
    AccessChange {
        /// The new rights.
        rights: AccessRights,
    },
}

impl MessageKind {
    fn tag(&self) -> &'static str {
        match self {
            MessageKind::PullRequest => "pull-request",
            MessageKind::AccessGrant => "access-grant",
            MessageKind::AccessChange { .. } => "access-change",
        }
    }
}

/// A directed request blob, stored as `<escaped-path>.message.<to>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    /// Sender pseudonym.
    pub from: Pseudonym,
    /// The request.
    pub kind: MessageKind,
    /// When the message was posted.
    pub timestamp: DateTime<Utc>,
}

impl RelayMessage {
    /// A new message from `from`, stamped now.
    pub fn new(from: Pseudonym, kind: MessageKind) -> Self {
        Self {
            from,
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Serialize to the textual header format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = Header::new();
        header.set("from", self.from.as_str());
        header.set("kind", self.kind.tag());
        if let MessageKind::AccessChange { rights } = &self.kind {
            header.set("access", rights.to_string());
        }
        header.set(
            "timestamp",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        header.to_bytes()
    }

    /// Parse the textual header format. Unknown keys are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        let header = Header::from_bytes(bytes)?;
        let from = Pseudonym::new(header.require("from")?).map_err(|e| {
            HeaderError::InvalidValue {
                key: "from",
                reason: e.to_string(),
            }
        })?;
        let kind = match header.require("kind")? {
            "pull-request" => MessageKind::PullRequest,
            "access-grant" => MessageKind::AccessGrant,
            "access-change" => {
                let rights = AccessRights::parse(header.require("access")?).map_err(|e| {
                    HeaderError::InvalidValue {
                        key: "access",
                        reason: e.to_string(),
                    }
                })?;
                MessageKind::AccessChange { rights }
            }
            other => {
                return Err(HeaderError::InvalidValue {
                    key: "kind",
                    reason: format!("unknown message kind {other:?}"),
                })
            }
        };
        let timestamp = header
            .require("timestamp")?
            .parse::<DateTime<Utc>>()
            .map_err(|e| HeaderError::InvalidValue {
                key: "timestamp",
                reason: e.to_string(),
            })?;
        Ok(Self {
            from,
            kind,
            timestamp,
        })
    }
}
