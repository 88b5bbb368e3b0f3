//! Best-effort path locks over an eventually consistent store.
//!
//! The relay offers no compare-and-swap, so mutual exclusion is
//! probabilistic: write a lock blob carrying a fresh nonce, wait a
//! settling interval so a near-simultaneous competing put becomes
//! visible, then read the lock back and check the nonce survived. The
//! sync engine treats a lost race as `Busy` and relies on conflict
//! detection for the residual failure window.
//!
//! Locks carry a TTL. A lock older than the TTL is stale and may be
//! reaped by any party; staleness is a liveness mechanism, the nonce
//! confirmation is the safety mechanism.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use escale_types::Pseudonym;
use thiserror::Error;

use crate::header::{Header, HeaderError};
use crate::naming::RelayName;
use crate::store::{RelayError, RelayStore};

/// Lock acquisition tunables.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Age after which a foreign lock is considered stale.
    pub ttl: Duration,
    /// Pause between writing the lock and confirming the nonce.
    pub settle: Duration,
}

/// The settling interval is never optimized away, even on backends with
/// atomic rename; this is the floor it is clamped to.
pub(crate) const MIN_SETTLE: Duration = Duration::from_millis(10);

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            settle: Duration::from_millis(500),
        }
    }
}

/// Parsed body of a lock blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// The locking client's pseudonym.
    pub owner: Pseudonym,
    /// Fresh per-acquisition nonce.
    pub nonce: String,
    /// Wall-clock creation time as claimed by the owner.
    pub created: DateTime<Utc>,
}

impl LockInfo {
    /// A new lock body for `owner` with a fresh nonce.
    pub fn new(owner: Pseudonym) -> Self {
        Self {
            owner,
            nonce: uuid::Uuid::new_v4().simple().to_string(),
            created: Utc::now(),
        }
    }

    /// Serialize to the textual header format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = Header::new();
        header.set("owner", self.owner.as_str());
        header.set("nonce", self.nonce.clone());
        header.set(
            "created",
            self.created.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        header.to_bytes()
    }

    /// Parse the textual header format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        let header = Header::from_bytes(bytes)?;
        let owner = Pseudonym::new(header.require("owner")?).map_err(|e| {
            HeaderError::InvalidValue {
                key: "owner",
                reason: e.to_string(),
            }
        })?;
        let nonce = header.require("nonce")?.to_string();
        let created = header
            .require("created")?
            .parse::<DateTime<Utc>>()
            .map_err(|e| HeaderError::InvalidValue {
                key: "created",
                reason: e.to_string(),
            })?;
        Ok(Self {
            owner,
            nonce,
            created,
        })
    }

    /// Whether this lock has outlived the TTL.
    pub fn is_stale(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.created);
        age.to_std().map(|age| age > ttl).unwrap_or(false)
    }
}

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another client holds a valid lock, or won the settling race.
    #[error("path is locked by {holder:?}")]
    Busy {
        /// The competing holder, when known.
        holder: Option<Pseudonym>,
    },

    /// The relay failed underneath the lock dance.
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// A held lock on one logical path.
///
/// There is no async `Drop`; every owner must call [`PathLock::release`]
/// on success and failure paths alike. The scheduler's repair pass reaps
/// anything that slips through once the TTL expires.
#[derive(Debug)]
pub struct PathLock {
    name: RelayName,
    nonce: String,
}

impl PathLock {
    /// Acquire the lock named `name` for `owner`.
    ///
    /// Returns [`LockError::Busy`] when a valid foreign lock exists or a
    /// competing writer wins the settling race. A stale foreign lock is
    /// overwritten regardless of holder.
    pub async fn acquire(
        store: &dyn RelayStore,
        name: RelayName,
        owner: &Pseudonym,
        options: &LockOptions,
    ) -> Result<Self, LockError> {
        match store.get(&name).await {
            Ok(body) => match LockInfo::from_bytes(&body) {
                Ok(existing) => {
                    if existing.owner != *owner && !existing.is_stale(options.ttl) {
                        return Err(LockError::Busy {
                            holder: Some(existing.owner),
                        });
                    }
                    // Stale, or our own leftover from a crashed run: take over.
                    tracing::debug!(lock = %name, owner = %existing.owner, "overriding stale lock");
                }
                Err(_) => {
                    // Unreadable body: fall back to the relay mtime for staleness.
                    let stale = match store.mtime(&name).await? {
                        Some(mtime) => {
                            mtime.elapsed().map(|age| age > options.ttl).unwrap_or(false)
                        }
                        None => false,
                    };
                    if !stale {
                        return Err(LockError::Busy { holder: None });
                    }
                    tracing::warn!(lock = %name, "overriding stale unreadable lock");
                }
            },
            Err(RelayError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let info = LockInfo::new(owner.clone());
        store.put(&name, &info.to_bytes()).await?;

        tokio::time::sleep(options.settle.max(MIN_SETTLE)).await;

        let body = match store.get(&name).await {
            Ok(body) => body,
            // Someone reaped or replaced-and-released the lock under us.
            Err(RelayError::NotFound(_)) => return Err(LockError::Busy { holder: None }),
            Err(e) => return Err(e.into()),
        };
        match LockInfo::from_bytes(&body) {
            Ok(read_back) if read_back.nonce == info.nonce => Ok(Self {
                name,
                nonce: info.nonce,
            }),
            Ok(read_back) => Err(LockError::Busy {
                holder: Some(read_back.owner),
            }),
            Err(_) => Err(LockError::Busy { holder: None }),
        }
    }

    /// The nonce this acquisition won with.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Release the lock. Deleting is idempotent, so releasing a lock
    /// already reaped by a peer succeeds.
    pub async fn release(self, store: &dyn RelayStore) -> Result<(), RelayError> {
        store.delete(&self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRelay;
    use crate::naming::Naming;
    use escale_types::LogicalPath;
    use std::time::SystemTime;

    fn quick_options() -> LockOptions {
        LockOptions {
            ttl: Duration::from_secs(60),
            settle: Duration::from_millis(10),
        }
    }

    fn lock_name() -> RelayName {
        Naming::default().lock(&LogicalPath::new("a.txt").unwrap())
    }

    fn client(name: &str) -> Pseudonym {
        Pseudonym::new(name).unwrap()
    }

    #[test]
    fn lock_info_roundtrip() {
        let info = LockInfo::new(client("alice"));
        let parsed = LockInfo::from_bytes(&info.to_bytes()).unwrap();
        assert_eq!(parsed.owner, info.owner);
        assert_eq!(parsed.nonce, info.nonce);
    }

    #[test]
    fn staleness_by_ttl() {
        let mut info = LockInfo::new(client("alice"));
        assert!(!info.is_stale(Duration::from_secs(60)));
        info.created = Utc::now() - chrono::Duration::seconds(120);
        assert!(info.is_stale(Duration::from_secs(60)));
        // A lock dated in the future is not stale.
        info.created = Utc::now() + chrono::Duration::seconds(120);
        assert!(!info.is_stale(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let relay = MemoryRelay::new();
        let lock = PathLock::acquire(&relay, lock_name(), &client("alice"), &quick_options())
            .await
            .unwrap();
        assert!(relay.exists(&lock_name()).await.unwrap());

        lock.release(&relay).await.unwrap();
        assert!(!relay.exists(&lock_name()).await.unwrap());
    }

    #[tokio::test]
    async fn foreign_valid_lock_is_busy() {
        let relay = MemoryRelay::new();
        let _held = PathLock::acquire(&relay, lock_name(), &client("alice"), &quick_options())
            .await
            .unwrap();

        let result =
            PathLock::acquire(&relay, lock_name(), &client("bob"), &quick_options()).await;
        match result {
            Err(LockError::Busy { holder }) => assert_eq!(holder, Some(client("alice"))),
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_foreign_lock_is_taken_over() {
        let relay = MemoryRelay::new();
        let mut info = LockInfo::new(client("alice"));
        info.created = Utc::now() - chrono::Duration::seconds(7200);
        relay.put(&lock_name(), &info.to_bytes()).await.unwrap();

        let lock = PathLock::acquire(&relay, lock_name(), &client("bob"), &quick_options())
            .await
            .unwrap();
        lock.release(&relay).await.unwrap();
    }

    #[tokio::test]
    async fn own_leftover_lock_is_taken_over() {
        let relay = MemoryRelay::new();
        let info = LockInfo::new(client("alice"));
        relay.put(&lock_name(), &info.to_bytes()).await.unwrap();

        // Fresh, but ours: a crashed previous run. Takeover allowed.
        let lock = PathLock::acquire(&relay, lock_name(), &client("alice"), &quick_options())
            .await
            .unwrap();
        assert_ne!(lock.nonce(), info.nonce);
    }

    #[tokio::test]
    async fn losing_the_settling_race_is_busy() {
        let relay = MemoryRelay::new();
        // Overwrite the lock body during the settle window, simulating a
        // competing put that lands after ours.
        let competing = LockInfo::new(client("bob"));
        relay.overwrite_during_settle(lock_name(), competing.to_bytes());

        let result =
            PathLock::acquire(&relay, lock_name(), &client("alice"), &quick_options()).await;
        match result {
            Err(LockError::Busy { holder }) => assert_eq!(holder, Some(client("bob"))),
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreadable_fresh_lock_is_busy() {
        let relay = MemoryRelay::new();
        relay.put(&lock_name(), b"garbage bytes").await.unwrap();
        relay.set_mtime(&lock_name(), SystemTime::now());

        let result =
            PathLock::acquire(&relay, lock_name(), &client("bob"), &quick_options()).await;
        assert!(matches!(result, Err(LockError::Busy { holder: None })));
    }
}
