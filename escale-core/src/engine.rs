//! The per-path synchronization engine.
//!
//! For each candidate path the engine computes a local state (from the
//! file and the index) and a remote state (from the placeholder), feeds
//! both through the pure [`decide`] table, and executes the resulting
//! transition under the on-relay lock protocol.
//!
//! The decision function is side-effect free and exhaustively tested;
//! all I/O lives in the executors. One path's failure never aborts the
//! surrounding scan - errors are returned to the scheduler, which backs
//! off or surfaces them and moves on.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use escale_content::{digest, frame, unframe, ContentError, ContentKey, RepoSecret};
use escale_relay::{
    with_deadline, HeaderError, LockError, LockOptions, MessageKind, Naming, PathLock, Placeholder,
    RelayError, RelayMessage, RelayName, RelayStore,
};
use escale_types::{AccessFlag, AccessRights, Digest, LogicalPath, Pseudonym, Version};

use crate::config::RepositoryConfig;
use crate::index::{Index, IndexEntry};
use crate::scan::hash_file;

/// Conflict resolution policy, fixed at repository creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// The later local mtime wins; the loser becomes a sidecar.
    NewerWins,
    /// The remote is pulled into a sidecar; the local file is preserved.
    PullFirst,
    /// Abort the path with a conflict error; for interactive modes.
    Reject,
}

/// What a successful pull does to the placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsumeMode {
    /// Delete the payload; rewrite the placeholder to consumed.
    OneShot,
    /// Keep the payload; rewrite the placeholder to consumed.
    RetainHistory,
}

/// Engine errors. The split drives the scheduler: busy and transient
/// kinds are retried with back-off, the rest are surfaced per path.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Static configuration problem, fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The relay failed; retryability comes from the inner kind.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Another client holds the path's lock; expected, deferred.
    #[error("{path} is busy{}", holder.as_ref().map(|h| format!(" (held by {h})")).unwrap_or_default())]
    Busy {
        /// The contended path.
        path: LogicalPath,
        /// The holder, when known.
        holder: Option<Pseudonym>,
    },

    /// MAC failure or digest mismatch; the blob was quarantined.
    #[error("integrity failure on {path}: {reason}")]
    Integrity {
        /// The affected path.
        path: LogicalPath,
        /// What failed.
        reason: String,
    },

    /// Concurrent writers and the strategy is `Reject`.
    #[error("conflict on {path}")]
    Conflict {
        /// The conflicted path.
        path: LogicalPath,
    },

    /// A protocol blob on the relay failed to parse.
    #[error("malformed protocol blob for {path}: {source}")]
    Protocol {
        /// The affected path.
        path: LogicalPath,
        /// The parse failure.
        source: HeaderError,
    },

    /// Local filesystem failure; the path is skipped this scan.
    #[error("local I/O error ({context}): {source}")]
    LocalIo {
        /// What the engine was doing.
        context: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Payload framing failed on the push side.
    #[error(transparent)]
    Content(#[from] ContentError),

    /// Clean shutdown, not a user-facing error.
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether the scheduler should back off and retry the path.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Busy { .. } => true,
            EngineError::Relay(e) => e.is_retryable(),
            _ => false,
        }
    }

    fn local_io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| EngineError::LocalIo { context, source }
    }
}

/// Local state of a path, from the file and the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    /// No file and no local history.
    Absent,
    /// A file the index has never seen.
    New,
    /// File differs from the indexed state.
    Modified,
    /// File matches the indexed state.
    Unchanged,
    /// Indexed file is gone from disk; deletion to propagate.
    Deleted,
}

/// Remote state of a path, from the placeholder and payload presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// No placeholder.
    Absent,
    /// A live placeholder at a version we have not seen.
    PresentNew,
    /// A placeholder at a version we already know.
    PresentSame,
    /// The payload was consumed by a receiver.
    Consumed,
    /// A tombstone advertising deletion.
    Tombstone,
}

/// Inputs to the pure decision function.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput {
    /// Local state.
    pub local: LocalState,
    /// Remote state.
    pub remote: RemoteState,
    /// Access rights with gates still unresolved.
    pub rights: AccessRights,
    /// Whether this client wrote the consumed version.
    pub owns_consumed: bool,
    /// Whether the local content matches the last pulled hash.
    pub local_matches_last_pull: bool,
}

/// The transition chosen for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do.
    Skip,
    /// Upload local content as the next version.
    Push,
    /// Download and install the remote version.
    Pull,
    /// Advertise a local deletion.
    PushTombstone,
    /// Apply a remote deletion locally.
    ApplyRemoteDelete,
    /// Concurrent edits; resolve per strategy.
    Conflict,
    /// Read is gated; request a grant from the sender.
    RequestRead,
    /// Write is gated; request a grant from the sender.
    RequestWrite,
}

/// The per-path decision table, exhaustive over local × remote state.
pub fn decide(input: &DecisionInput) -> Decision {
    use Decision::*;
    use LocalState as L;
    use RemoteState as R;

    let base = match (input.local, input.remote) {
        (L::Absent, R::PresentNew) => Pull,
        (L::Absent, _) => Skip,

        (L::New, R::Absent) => Push,
        (L::New, R::Consumed) => Push,
        (L::New, R::PresentNew | R::PresentSame | R::Tombstone) => Conflict,

        (L::Modified, R::Absent | R::PresentSame | R::Consumed) => Push,
        (L::Modified, R::PresentNew | R::Tombstone) => Conflict,

        (L::Unchanged, R::PresentNew) => Pull,
        // Re-offering a consumed version is the owner's job; the digest
        // no-op check makes it free when nothing changed.
        (L::Unchanged, R::Consumed) if input.owns_consumed => Push,
        (L::Unchanged, R::Consumed) => Skip,
        (L::Unchanged, R::Tombstone) => {
            if input.local_matches_last_pull {
                ApplyRemoteDelete
            } else {
                Conflict
            }
        }
        (L::Unchanged, R::Absent | R::PresentSame) => Skip,

        (L::Deleted, R::Absent | R::PresentSame | R::Consumed) => PushTombstone,
        (L::Deleted, R::PresentNew) => Conflict,
        (L::Deleted, R::Tombstone) => Skip,
    };

    // Access rights veto or gate the chosen direction.
    match base {
        Pull => match input.rights.read {
            AccessFlag::Allowed => Pull,
            AccessFlag::Gated => RequestRead,
            AccessFlag::Denied => Skip,
        },
        Push | PushTombstone => match input.rights.write {
            AccessFlag::Allowed => base,
            AccessFlag::Gated => RequestWrite,
            AccessFlag::Denied => Skip,
        },
        other => other,
    }
}

/// What a sync step did; for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Path already in sync (includes the idempotent-push no-op).
    UpToDate,
    /// Nothing to do, or the path raced and will be revisited.
    Skipped,
    /// A new version was uploaded.
    Pushed(Version),
    /// A remote version was installed locally.
    Pulled(Version),
    /// A deletion was advertised.
    TombstonePushed(Version),
    /// A remote deletion was applied locally.
    RemoteDeleteApplied,
    /// A conflict left a sidecar next to the file.
    SidecarWritten(PathBuf),
    /// A gate was hit and a grant was requested.
    GrantRequested,
}

/// Everything the engine needs, threaded explicitly.
#[derive(Clone)]
pub struct SyncContext {
    /// The relay adapter.
    pub store: Arc<dyn RelayStore>,
    /// Relay name construction.
    pub naming: Naming,
    /// This client's pseudonym.
    pub pseudonym: Pseudonym,
    /// Local repository root.
    pub root: PathBuf,
    /// Payload encryption key, if a passphrase is configured.
    pub key: Option<ContentKey>,
    /// Compress payloads before encryption.
    pub compress: bool,
    /// Conflict policy.
    pub conflict: ConflictStrategy,
    /// Placeholder consumption mode.
    pub consume: ConsumeMode,
    /// Lock TTL and settling interval.
    pub lock_options: LockOptions,
    /// Deadline for each relay adapter call.
    pub deadline: Duration,
    /// Where quarantined blobs land.
    pub quarantine_dir: PathBuf,
    /// Rights for paths without an explicit entry.
    pub default_rights: AccessRights,
}

impl SyncContext {
    /// Build a context from a repository configuration and an opened
    /// relay adapter.
    pub fn from_config(
        config: &RepositoryConfig,
        store: Arc<dyn RelayStore>,
    ) -> Result<Self, EngineError> {
        let pseudonym = Pseudonym::new(&config.client.pseudonym)
            .map_err(|e| EngineError::Config(format!("client.pseudonym: {e}")))?;
        let key = match (&config.security.passphrase, &config.security.salt) {
            (Some(passphrase), Some(salt)) => {
                let salt = hex::decode(salt)
                    .map_err(|e| EngineError::Config(format!("security.salt: {e}")))?;
                let secret = RepoSecret::from_passphrase(passphrase, &salt)
                    .map_err(|e| EngineError::Config(format!("key derivation: {e}")))?;
                Some(ContentKey::derive(&secret))
            }
            (Some(_), None) => {
                return Err(EngineError::Config(
                    "security.salt is required with a passphrase".into(),
                ))
            }
            _ => None,
        };
        let default_rights = AccessRights::parse(&config.sync.access_default)
            .map_err(|e| EngineError::Config(format!("sync.access_default: {e}")))?;
        Ok(Self {
            store,
            naming: Naming::new(config.relay.max_name_len),
            pseudonym,
            root: config.local.root.clone(),
            key,
            compress: config.sync.compress,
            conflict: config.sync.conflict,
            consume: config.sync.consume,
            lock_options: LockOptions {
                ttl: Duration::from_secs(config.schedule.lock_ttl_secs),
                settle: Duration::from_millis(config.schedule.lock_settle_ms),
            },
            deadline: Duration::from_secs(config.schedule.deadline_secs),
            quarantine_dir: config.quarantine_dir(),
            default_rights,
        })
    }
}

/// The per-repository synchronization engine.
pub struct SyncEngine {
    ctx: SyncContext,
    index: Index,
    index_path: PathBuf,
}

impl SyncEngine {
    /// Create an engine over a loaded index.
    pub fn new(ctx: SyncContext, index: Index, index_path: PathBuf) -> Self {
        Self {
            ctx,
            index,
            index_path,
        }
    }

    /// The engine's context.
    pub fn ctx(&self) -> &SyncContext {
        &self.ctx
    }

    /// The current index (tests, status reporting).
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Persist the index.
    pub async fn save_index(&self) -> Result<(), EngineError> {
        self.index
            .save(&self.index_path)
            .await
            .map_err(EngineError::local_io("saving index"))
    }

    /// Record a completed full scan and persist the index.
    pub async fn mark_scan_complete(&mut self) -> Result<(), EngineError> {
        self.index.last_full_scan = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs());
        self.save_index().await
    }

    /// Synchronize one path: classify, decide, execute.
    pub async fn sync_path(&mut self, path: &LogicalPath) -> Result<SyncOutcome, EngineError> {
        let (local, local_hash, local_mtime) = self.local_state(path).await?;
        let placeholder = self.fetch_placeholder(path).await?;

        self.register_long_name(path);

        let entry = self.index.entry(path);
        let mut rights = entry.map(|e| e.rights).unwrap_or(self.ctx.default_rights);
        let remote = classify_remote(placeholder.as_ref(), entry);
        let owns_consumed = match (&placeholder, entry) {
            (Some(p), Some(e)) => p.is_consumed() && e.last_pushed == p.version,
            _ => false,
        };
        let local_matches_last_pull = match (local_hash, entry) {
            (Some(hash), Some(e)) => e.last_pulled_hash == Some(hash),
            _ => false,
        };

        // A fresh grant message resolves a gate for this scan.
        if rights.read == AccessFlag::Gated || rights.write == AccessFlag::Gated {
            if let Some(p) = &placeholder {
                if self.has_fresh_grant(path, p).await? {
                    if rights.read == AccessFlag::Gated {
                        rights.read = AccessFlag::Allowed;
                    }
                    if rights.write == AccessFlag::Gated {
                        rights.write = AccessFlag::Allowed;
                    }
                }
            }
        }

        let decision = decide(&DecisionInput {
            local,
            remote,
            rights,
            owns_consumed,
            local_matches_last_pull,
        });
        tracing::debug!(path = %path, ?local, ?remote, ?decision, "sync step");

        match decision {
            Decision::Skip => Ok(SyncOutcome::Skipped),
            Decision::Push => {
                self.push_path(path, local_hash.expect("push requires local content"), false)
                    .await
            }
            Decision::Pull => {
                let placeholder = placeholder.expect("pull requires a placeholder");
                self.pull_path(path, &placeholder).await
            }
            Decision::PushTombstone => self.push_tombstone(path).await,
            Decision::ApplyRemoteDelete => {
                let placeholder = placeholder.expect("delete requires a tombstone");
                self.apply_remote_delete(path, &placeholder).await
            }
            Decision::Conflict => {
                let placeholder = placeholder.expect("conflict requires a placeholder");
                self.resolve_conflict(path, local_hash, local_mtime, &placeholder)
                    .await
            }
            Decision::RequestRead | Decision::RequestWrite => {
                self.request_grant(path, placeholder.as_ref()).await
            }
        }
    }

    /// Classify the local side and return its hash and mtime when a file
    /// exists.
    async fn local_state(
        &mut self,
        path: &LogicalPath,
    ) -> Result<(LocalState, Option<Digest>, Option<i64>), EngineError> {
        let local = path.to_local(&self.ctx.root);
        let meta = match tokio::fs::metadata(&local).await {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(EngineError::LocalIo {
                    context: format!("stat {}", local.display()),
                    source: e,
                })
            }
        };
        let entry = self.index.entry(path).cloned();

        match (meta, entry) {
            (None, Some(entry)) if entry.hash.is_some() => {
                Ok((LocalState::Deleted, None, None))
            }
            (None, _) => Ok((LocalState::Absent, None, None)),
            (Some(meta), entry) => {
                let mtime_secs = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                let size = meta.len();
                match entry {
                    None => {
                        let hash = hash_file(&local)
                            .await
                            .map_err(EngineError::local_io(format!("hashing {path}")))?;
                        Ok((LocalState::New, Some(hash), Some(mtime_secs)))
                    }
                    Some(entry) if entry.hash.is_none() => {
                        // Path re-created after a propagated deletion.
                        let hash = hash_file(&local)
                            .await
                            .map_err(EngineError::local_io(format!("hashing {path}")))?;
                        Ok((LocalState::New, Some(hash), Some(mtime_secs)))
                    }
                    Some(entry) => {
                        // Fast path: unchanged mtime and size mean unchanged
                        // content; otherwise the hash settles it.
                        if entry.mtime_secs == Some(mtime_secs) && entry.size == Some(size) {
                            return Ok((LocalState::Unchanged, entry.hash, Some(mtime_secs)));
                        }
                        let hash = hash_file(&local)
                            .await
                            .map_err(EngineError::local_io(format!("hashing {path}")))?;
                        if Some(hash) == entry.hash {
                            let slot = self.index.entry_mut(path);
                            slot.mtime_secs = Some(mtime_secs);
                            slot.size = Some(size);
                            Ok((LocalState::Unchanged, Some(hash), Some(mtime_secs)))
                        } else {
                            Ok((LocalState::Modified, Some(hash), Some(mtime_secs)))
                        }
                    }
                }
            }
        }
    }

    async fn fetch_placeholder(
        &self,
        path: &LogicalPath,
    ) -> Result<Option<Placeholder>, EngineError> {
        let name = self.ctx.naming.placeholder(path);
        match with_deadline(self.ctx.deadline, self.ctx.store.get(&name)).await {
            Ok(bytes) => Placeholder::from_bytes(&bytes)
                .map(Some)
                .map_err(|source| EngineError::Protocol {
                    path: path.clone(),
                    source,
                }),
            Err(RelayError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn register_long_name(&mut self, path: &LogicalPath) {
        let base = self.ctx.naming.base(path);
        if Naming::is_hashed(&base) {
            self.index.record_long_name(base, path.clone());
        }
    }

    async fn acquire_lock(&self, path: &LogicalPath) -> Result<PathLock, EngineError> {
        let name = self.ctx.naming.lock(path);
        let budget = self.ctx.deadline * 3 + self.ctx.lock_options.settle;
        let result = tokio::time::timeout(
            budget,
            PathLock::acquire(
                self.ctx.store.as_ref(),
                name,
                &self.ctx.pseudonym,
                &self.ctx.lock_options,
            ),
        )
        .await
        .map_err(|_| EngineError::Relay(RelayError::Timeout))?;
        result.map_err(|e| match e {
            LockError::Busy { holder } => EngineError::Busy {
                path: path.clone(),
                holder,
            },
            LockError::Relay(e) => EngineError::Relay(e),
        })
    }

    /// Release a lock, preferring the operation's own error over a
    /// release failure.
    async fn finish_locked<T>(
        &self,
        lock: PathLock,
        result: Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let released = lock.release(self.ctx.store.as_ref()).await;
        let value = result?;
        released?;
        Ok(value)
    }

    /// Push the local content as the next version.
    ///
    /// `force` skips the idempotent no-op check and the stale-version
    /// race check; used for conflict winners overriding a version they
    /// have examined, and for re-pushes a peer explicitly asked for.
    pub(crate) async fn push_path(
        &mut self,
        path: &LogicalPath,
        hash: Digest,
        force: bool,
    ) -> Result<SyncOutcome, EngineError> {
        let lock = self.acquire_lock(path).await?;
        let result = self.push_locked(path, hash, force).await;
        self.finish_locked(lock, result).await
    }

    async fn push_locked(
        &mut self,
        path: &LogicalPath,
        hash: Digest,
        force: bool,
    ) -> Result<SyncOutcome, EngineError> {
        let store = self.ctx.store.clone();
        let placeholder_name = self.ctx.naming.placeholder(path);
        let payload_name = self.ctx.naming.payload(path);

        // Re-read under the lock; the placeholder may have moved since
        // the decision was made.
        let current = self.fetch_placeholder(path).await?;
        if let Some(current) = &current {
            if !force && current.digest == Some(hash) {
                // Idempotent push: identical content, no payload put.
                self.record_local(path, &hash).await?;
                return Ok(SyncOutcome::UpToDate);
            }
            let known = self
                .index
                .entry(path)
                .map(|e| e.last_seen())
                .unwrap_or(Version::zero());
            if !force && !current.is_consumed() && !current.is_tombstone() && current.version > known
            {
                // A new foreign version landed between decision and lock.
                tracing::debug!(path = %path, "push raced a newer remote version");
                return Ok(SyncOutcome::Skipped);
            }
        }

        let local = path.to_local(&self.ctx.root);
        let plaintext = tokio::fs::read(&local)
            .await
            .map_err(EngineError::local_io(format!("reading {path}")))?;
        let fresh_hash = digest(&plaintext);
        if fresh_hash != hash {
            // The file changed while we were deciding; next scan retries.
            return Ok(SyncOutcome::Skipped);
        }

        let framed = frame(&plaintext, self.ctx.key.as_ref(), self.ctx.compress)?;
        let version = {
            let entry = self.index.entry(path);
            let prev = entry.map(|e| e.last_pushed).unwrap_or(Version::zero());
            let remote = current.as_ref().map(|p| p.version).unwrap_or(Version::zero());
            prev.max(remote).next()
        };

        with_deadline(self.ctx.deadline, store.put(&payload_name, &framed)).await?;
        let placeholder = Placeholder::pushed(self.ctx.pseudonym.clone(), version, fresh_hash);
        with_deadline(
            self.ctx.deadline,
            store.put(&placeholder_name, &placeholder.to_bytes()),
        )
        .await?;

        let meta = tokio::fs::metadata(&local)
            .await
            .map_err(EngineError::local_io(format!("stat {path}")))?;
        let entry = self.index.entry_mut(path);
        entry.last_pushed = version;
        entry.hash = Some(fresh_hash);
        entry.size = Some(meta.len());
        entry.mtime_secs = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);
        self.save_index().await?;

        tracing::info!(path = %path, %version, "pushed");
        Ok(SyncOutcome::Pushed(version))
    }

    /// Refresh the index entry's local fields without touching versions.
    async fn record_local(&mut self, path: &LogicalPath, hash: &Digest) -> Result<(), EngineError> {
        let local = path.to_local(&self.ctx.root);
        let meta = tokio::fs::metadata(&local)
            .await
            .map_err(EngineError::local_io(format!("stat {path}")))?;
        let entry = self.index.entry_mut(path);
        entry.hash = Some(*hash);
        entry.size = Some(meta.len());
        entry.mtime_secs = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);
        self.save_index().await
    }

    /// Pull the remote version into place.
    async fn pull_path(
        &mut self,
        path: &LogicalPath,
        expected: &Placeholder,
    ) -> Result<SyncOutcome, EngineError> {
        let lock = self.acquire_lock(path).await?;
        let result = self.pull_locked(path, expected).await;
        self.finish_locked(lock, result).await
    }

    async fn pull_locked(
        &mut self,
        path: &LogicalPath,
        expected: &Placeholder,
    ) -> Result<SyncOutcome, EngineError> {
        let store = self.ctx.store.clone();
        let payload_name = self.ctx.naming.payload(path);
        let placeholder_name = self.ctx.naming.placeholder(path);

        // Re-read under the lock.
        let placeholder = match self.fetch_placeholder(path).await? {
            Some(p) if p.version == expected.version && !p.is_consumed() => p,
            _ => {
                tracing::debug!(path = %path, "pull raced; placeholder moved");
                return Ok(SyncOutcome::Skipped);
            }
        };

        let framed = match with_deadline(self.ctx.deadline, store.get(&payload_name)).await {
            Ok(bytes) => bytes,
            Err(RelayError::NotFound(_)) => {
                tracing::debug!(path = %path, "payload vanished before pull");
                return Ok(SyncOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        let plaintext = match unframe(&framed, self.ctx.key.as_ref()) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.quarantine(path, &framed).await?;
                return Err(EngineError::Integrity {
                    path: path.clone(),
                    reason: e.to_string(),
                });
            }
        };
        let plain_digest = digest(&plaintext);
        if placeholder.digest != Some(plain_digest) {
            self.quarantine(path, &framed).await?;
            return Err(EngineError::Integrity {
                path: path.clone(),
                reason: format!(
                    "digest mismatch: placeholder {:?}, payload {plain_digest:?}",
                    placeholder.digest
                ),
            });
        }

        self.install_local(path, &plaintext).await?;

        match self.ctx.consume {
            ConsumeMode::OneShot => {
                with_deadline(self.ctx.deadline, store.delete(&payload_name)).await?;
            }
            ConsumeMode::RetainHistory => {}
        }
        with_deadline(
            self.ctx.deadline,
            store.put(&placeholder_name, &placeholder.consumed().to_bytes()),
        )
        .await?;

        // A grant that enabled this pull is spent now.
        let gated = self
            .index
            .entry(path)
            .map(|e| e.rights)
            .unwrap_or(self.ctx.default_rights)
            .read
            == AccessFlag::Gated;
        if gated {
            let grant_name = self.ctx.naming.message(path, &self.ctx.pseudonym);
            with_deadline(self.ctx.deadline, store.delete(&grant_name)).await?;
        }

        let local = path.to_local(&self.ctx.root);
        let meta = tokio::fs::metadata(&local)
            .await
            .map_err(EngineError::local_io(format!("stat {path}")))?;
        let entry = self.index.entry_mut(path);
        entry.last_pulled = placeholder.version;
        entry.last_pulled_hash = Some(plain_digest);
        entry.hash = Some(plain_digest);
        entry.size = Some(meta.len());
        entry.mtime_secs = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);
        self.save_index().await?;

        tracing::info!(path = %path, version = %placeholder.version, "pulled");
        Ok(SyncOutcome::Pulled(placeholder.version))
    }

    /// Write plaintext to the working tree: temp file in the target
    /// directory, fsync, atomic rename.
    async fn install_local(
        &self,
        path: &LogicalPath,
        plaintext: &[u8],
    ) -> Result<(), EngineError> {
        let target = path.to_local(&self.ctx.root);
        let parent = target
            .parent()
            .ok_or_else(|| EngineError::Config(format!("{path} has no parent directory")))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(EngineError::local_io(format!("mkdir for {path}")))?;

        let tmp = parent.join(format!(".escale-tmp-{}", uuid::Uuid::new_v4().simple()));
        let result = async {
            let mut file = tokio::fs::File::create(&tmp)
                .await
                .map_err(EngineError::local_io(format!("creating temp for {path}")))?;
            file.write_all(plaintext)
                .await
                .map_err(EngineError::local_io(format!("writing temp for {path}")))?;
            file.sync_all()
                .await
                .map_err(EngineError::local_io(format!("fsync for {path}")))?;
            drop(file);
            tokio::fs::rename(&tmp, &target)
                .await
                .map_err(EngineError::local_io(format!("installing {path}")))
        }
        .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    /// Move a suspect relay blob into the local quarantine directory.
    async fn quarantine(&self, path: &LogicalPath, framed: &[u8]) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(&self.ctx.quarantine_dir)
            .await
            .map_err(EngineError::local_io("creating quarantine dir"))?;
        let name = format!(
            "{}-{}",
            path.as_str().replace('/', "_"),
            Utc::now().format("%Y%m%d%H%M%S")
        );
        let dest = self.ctx.quarantine_dir.join(name);
        tokio::fs::write(&dest, framed)
            .await
            .map_err(EngineError::local_io(format!("quarantining {path}")))?;
        tracing::warn!(path = %path, dest = %dest.display(), "payload quarantined");
        Ok(())
    }

    /// Advertise a local deletion with a tombstone placeholder.
    async fn push_tombstone(&mut self, path: &LogicalPath) -> Result<SyncOutcome, EngineError> {
        let lock = self.acquire_lock(path).await?;
        let result = self.push_tombstone_locked(path).await;
        self.finish_locked(lock, result).await
    }

    async fn push_tombstone_locked(
        &mut self,
        path: &LogicalPath,
    ) -> Result<SyncOutcome, EngineError> {
        let store = self.ctx.store.clone();
        let current = self.fetch_placeholder(path).await?;
        let known = self
            .index
            .entry(path)
            .map(|e| e.last_seen())
            .unwrap_or(Version::zero());
        if let Some(current) = &current {
            if !current.is_consumed() && !current.is_tombstone() && current.version > known {
                // Someone pushed a new version while we decided to delete.
                return Ok(SyncOutcome::Skipped);
            }
        }
        let version = {
            let remote = current.as_ref().map(|p| p.version).unwrap_or(Version::zero());
            known.max(remote).next()
        };

        let placeholder = Placeholder::tombstone(self.ctx.pseudonym.clone(), version);
        with_deadline(
            self.ctx.deadline,
            store.put(
                &self.ctx.naming.placeholder(path),
                &placeholder.to_bytes(),
            ),
        )
        .await?;
        with_deadline(self.ctx.deadline, store.delete(&self.ctx.naming.payload(path))).await?;

        let entry = self.index.entry_mut(path);
        entry.last_pushed = version;
        entry.hash = None;
        entry.size = None;
        entry.mtime_secs = None;
        self.save_index().await?;

        tracing::info!(path = %path, %version, "deletion advertised");
        Ok(SyncOutcome::TombstonePushed(version))
    }

    /// Apply a remote deletion locally. The local hash was already
    /// checked against the last pulled version by the decision table.
    async fn apply_remote_delete(
        &mut self,
        path: &LogicalPath,
        tombstone: &Placeholder,
    ) -> Result<SyncOutcome, EngineError> {
        let local = path.to_local(&self.ctx.root);
        match tokio::fs::remove_file(&local).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(EngineError::LocalIo {
                    context: format!("deleting {path}"),
                    source: e,
                })
            }
        }
        let entry = self.index.entry_mut(path);
        entry.hash = None;
        entry.size = None;
        entry.mtime_secs = None;
        entry.last_pulled = tombstone.version;
        entry.last_pulled_hash = None;
        self.save_index().await?;

        tracing::info!(path = %path, version = %tombstone.version, "remote deletion applied");
        Ok(SyncOutcome::RemoteDeleteApplied)
    }

    /// Resolve a concurrent-writer conflict per the configured strategy.
    async fn resolve_conflict(
        &mut self,
        path: &LogicalPath,
        local_hash: Option<Digest>,
        local_mtime: Option<i64>,
        placeholder: &Placeholder,
    ) -> Result<SyncOutcome, EngineError> {
        // Same bytes on both sides is not a conflict; adopt the remote
        // version number. This is also what makes index rebuilds converge.
        if local_hash.is_some() && placeholder.digest == local_hash {
            let entry = self.index.entry_mut(path);
            entry.last_pulled = placeholder.version;
            entry.last_pulled_hash = placeholder.digest;
            entry.hash = local_hash;
            self.save_index().await?;
            return Ok(SyncOutcome::UpToDate);
        }

        match self.ctx.conflict {
            ConflictStrategy::Reject => Err(EngineError::Conflict { path: path.clone() }),
            ConflictStrategy::PullFirst => {
                let sidecar = self.pull_to_sidecar(path, placeholder).await?;
                let entry = self.index.entry_mut(path);
                entry.last_pulled = placeholder.version;
                entry.last_pulled_hash = placeholder.digest;
                self.save_index().await?;
                Ok(SyncOutcome::SidecarWritten(sidecar))
            }
            ConflictStrategy::NewerWins => {
                let remote_secs = placeholder.timestamp.timestamp();
                let local_wins = local_mtime.map(|m| m > remote_secs).unwrap_or(false);
                if placeholder.is_tombstone() {
                    if local_wins {
                        // Our edit beats the deletion; re-publish.
                        let hash = local_hash.expect("local content exists when it wins");
                        self.push_path(path, hash, true).await
                    } else {
                        let sidecar = self.local_to_sidecar(path, placeholder).await?;
                        self.apply_remote_delete(path, placeholder).await?;
                        Ok(SyncOutcome::SidecarWritten(sidecar))
                    }
                } else if local_wins {
                    // Remote loses: preserve it as a sidecar, then push ours
                    // over the version we just examined.
                    let sidecar = self.pull_to_sidecar(path, placeholder).await?;
                    let hash = local_hash.expect("local content exists when it wins");
                    self.push_path(path, hash, true).await?;
                    Ok(SyncOutcome::SidecarWritten(sidecar))
                } else {
                    // Local loses: preserve it as a sidecar, then pull.
                    let sidecar = if local_hash.is_some() {
                        Some(self.local_to_sidecar(path, placeholder).await?)
                    } else {
                        None
                    };
                    self.pull_path(path, placeholder).await?;
                    match sidecar {
                        Some(sidecar) => Ok(SyncOutcome::SidecarWritten(sidecar)),
                        None => Ok(SyncOutcome::Pulled(placeholder.version)),
                    }
                }
            }
        }
    }

    fn sidecar_path(&self, path: &LogicalPath, placeholder: &Placeholder) -> PathBuf {
        let peer = placeholder
            .sender
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let name = format!(
            "{}.conflict-{}-{}",
            path.file_name(),
            Utc::now().format("%Y%m%d%H%M%S"),
            peer
        );
        path.to_local(&self.ctx.root)
            .with_file_name(name)
    }

    /// Download the remote payload into a sidecar, leaving the
    /// placeholder untouched.
    async fn pull_to_sidecar(
        &mut self,
        path: &LogicalPath,
        placeholder: &Placeholder,
    ) -> Result<PathBuf, EngineError> {
        let framed = with_deadline(
            self.ctx.deadline,
            self.ctx.store.get(&self.ctx.naming.payload(path)),
        )
        .await?;
        let plaintext = match unframe(&framed, self.ctx.key.as_ref()) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.quarantine(path, &framed).await?;
                return Err(EngineError::Integrity {
                    path: path.clone(),
                    reason: e.to_string(),
                });
            }
        };
        let sidecar = self.sidecar_path(path, placeholder);
        tokio::fs::write(&sidecar, &plaintext)
            .await
            .map_err(EngineError::local_io(format!("writing sidecar for {path}")))?;
        tracing::warn!(path = %path, sidecar = %sidecar.display(), "conflict sidecar written");
        Ok(sidecar)
    }

    /// Move the losing local copy aside as a sidecar.
    async fn local_to_sidecar(
        &self,
        path: &LogicalPath,
        placeholder: &Placeholder,
    ) -> Result<PathBuf, EngineError> {
        let sidecar = self.sidecar_path(path, placeholder);
        tokio::fs::rename(path.to_local(&self.ctx.root), &sidecar)
            .await
            .map_err(EngineError::local_io(format!("saving sidecar for {path}")))?;
        tracing::warn!(path = %path, sidecar = %sidecar.display(), "local copy preserved as sidecar");
        Ok(sidecar)
    }

    /// Post a grant request to the path's current sender.
    async fn request_grant(
        &mut self,
        path: &LogicalPath,
        placeholder: Option<&Placeholder>,
    ) -> Result<SyncOutcome, EngineError> {
        let Some(sender) = placeholder.and_then(|p| p.sender.clone()) else {
            tracing::debug!(path = %path, "gated but no sender to ask");
            return Ok(SyncOutcome::Skipped);
        };
        let message = RelayMessage::new(self.ctx.pseudonym.clone(), MessageKind::PullRequest);
        let name = self.ctx.naming.message(path, &sender);
        with_deadline(self.ctx.deadline, self.ctx.store.put(&name, &message.to_bytes())).await?;
        tracing::info!(path = %path, to = %sender, "grant requested");
        Ok(SyncOutcome::GrantRequested)
    }

    /// Whether a fresh grant message unlocks a gated operation on `path`.
    ///
    /// A grant counts when it is addressed to us and younger than the
    /// placeholder it would unlock.
    pub async fn has_fresh_grant(
        &self,
        path: &LogicalPath,
        placeholder: &Placeholder,
    ) -> Result<bool, EngineError> {
        let name = self.ctx.naming.message(path, &self.ctx.pseudonym);
        let bytes = match with_deadline(self.ctx.deadline, self.ctx.store.get(&name)).await {
            Ok(bytes) => bytes,
            Err(RelayError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let message = RelayMessage::from_bytes(&bytes).map_err(|source| EngineError::Protocol {
            path: path.clone(),
            source,
        })?;
        Ok(matches!(message.kind, MessageKind::AccessGrant)
            && message.timestamp > placeholder.timestamp)
    }

    /// Apply a message addressed to this client.
    pub async fn apply_message(
        &mut self,
        path: &LogicalPath,
        name: &RelayName,
        message: &RelayMessage,
    ) -> Result<(), EngineError> {
        match &message.kind {
            MessageKind::PullRequest => {
                let local = path.to_local(&self.ctx.root);
                if tokio::fs::try_exists(&local).await.unwrap_or(false) {
                    let hash = hash_file(&local)
                        .await
                        .map_err(EngineError::local_io(format!("hashing {path}")))?;
                    // Re-offer even when the digest matches the consumed
                    // placeholder; the requester cannot pull otherwise.
                    self.push_path(path, hash, true).await?;
                }
                with_deadline(self.ctx.deadline, self.ctx.store.delete(name)).await?;
            }
            MessageKind::AccessChange { rights } => {
                self.index.entry_mut(path).rights = *rights;
                self.save_index().await?;
                with_deadline(self.ctx.deadline, self.ctx.store.delete(name)).await?;
            }
            MessageKind::AccessGrant => {
                // Left in place; consumed by the gated pull that uses it.
            }
        }
        Ok(())
    }

    /// Delete consumed placeholders and tombstones older than the
    /// retention horizon, together with any leftover payload.
    pub async fn forget_expired(
        &mut self,
        path: &LogicalPath,
        retention: Duration,
    ) -> Result<bool, EngineError> {
        let Some(placeholder) = self.fetch_placeholder(path).await? else {
            return Ok(false);
        };
        if !placeholder.is_consumed() && !placeholder.is_tombstone() {
            return Ok(false);
        }
        let age = Utc::now().signed_duration_since(placeholder.timestamp);
        if age.to_std().map(|age| age < retention).unwrap_or(true) {
            return Ok(false);
        }

        let lock = self.acquire_lock(path).await?;
        let store = self.ctx.store.clone();
        let result = async {
            with_deadline(self.ctx.deadline, store.delete(&self.ctx.naming.payload(path)))
                .await?;
            with_deadline(
                self.ctx.deadline,
                store.delete(&self.ctx.naming.placeholder(path)),
            )
            .await?;
            Ok(true)
        }
        .await;
        let forgotten = self.finish_locked(lock, result).await?;
        if forgotten {
            tracing::debug!(path = %path, "placeholder forgotten past retention");
        }
        Ok(forgotten)
    }
}

/// Classify the remote side from the placeholder and the index entry.
fn classify_remote(placeholder: Option<&Placeholder>, entry: Option<&IndexEntry>) -> RemoteState {
    let Some(p) = placeholder else {
        return RemoteState::Absent;
    };
    let known = entry.map(|e| e.last_seen()).unwrap_or(Version::zero());
    if p.is_tombstone() {
        if p.version <= known {
            RemoteState::PresentSame
        } else {
            RemoteState::Tombstone
        }
    } else if p.is_consumed() {
        RemoteState::Consumed
    } else if p.version <= known {
        RemoteState::PresentSame
    } else {
        RemoteState::PresentNew
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(local: LocalState, remote: RemoteState) -> DecisionInput {
        DecisionInput {
            local,
            remote,
            rights: AccessRights::allow_all(),
            owns_consumed: false,
            local_matches_last_pull: false,
        }
    }

    #[test]
    fn decision_table_core_rows() {
        use Decision::*;
        use LocalState as L;
        use RemoteState as R;

        assert_eq!(decide(&input(L::Absent, R::Absent)), Skip);
        assert_eq!(decide(&input(L::Absent, R::PresentNew)), Pull);
        assert_eq!(decide(&input(L::Absent, R::Consumed)), Skip);
        assert_eq!(decide(&input(L::New, R::Absent)), Push);
        assert_eq!(decide(&input(L::New, R::PresentNew)), Conflict);
        assert_eq!(decide(&input(L::Modified, R::PresentSame)), Push);
        assert_eq!(decide(&input(L::Modified, R::PresentNew)), Conflict);
        assert_eq!(decide(&input(L::Unchanged, R::PresentNew)), Pull);
        assert_eq!(decide(&input(L::Unchanged, R::PresentSame)), Skip);
        assert_eq!(decide(&input(L::Deleted, R::Absent)), PushTombstone);
        assert_eq!(decide(&input(L::Deleted, R::Tombstone)), Skip);
    }

    #[test]
    fn consumed_row_depends_on_ownership() {
        let mut i = input(LocalState::Unchanged, RemoteState::Consumed);
        assert_eq!(decide(&i), Decision::Skip);
        i.owns_consumed = true;
        assert_eq!(decide(&i), Decision::Push);
    }

    #[test]
    fn tombstone_row_depends_on_last_pull_match() {
        let mut i = input(LocalState::Unchanged, RemoteState::Tombstone);
        assert_eq!(decide(&i), Decision::Conflict);
        i.local_matches_last_pull = true;
        assert_eq!(decide(&i), Decision::ApplyRemoteDelete);
    }

    #[test]
    fn denied_rights_veto_transfers() {
        let mut i = input(LocalState::Absent, RemoteState::PresentNew);
        i.rights = AccessRights::parse("r- w").unwrap();
        assert_eq!(decide(&i), Decision::Skip);

        let mut i = input(LocalState::New, RemoteState::Absent);
        i.rights = AccessRights::parse("r w-").unwrap();
        assert_eq!(decide(&i), Decision::Skip);
    }

    #[test]
    fn gated_rights_request_grants() {
        let mut i = input(LocalState::Absent, RemoteState::PresentNew);
        i.rights = AccessRights::parse("r? w").unwrap();
        assert_eq!(decide(&i), Decision::RequestRead);

        let mut i = input(LocalState::Modified, RemoteState::PresentSame);
        i.rights = AccessRights::parse("r w?").unwrap();
        assert_eq!(decide(&i), Decision::RequestWrite);
    }

    #[test]
    fn gates_do_not_touch_local_only_transitions() {
        let mut i = input(LocalState::Unchanged, RemoteState::Tombstone);
        i.local_matches_last_pull = true;
        i.rights = AccessRights::parse("r? w?").unwrap();
        assert_eq!(decide(&i), Decision::ApplyRemoteDelete);
    }

    #[test]
    fn decision_table_is_total() {
        use LocalState as L;
        use RemoteState as R;
        let locals = [L::Absent, L::New, L::Modified, L::Unchanged, L::Deleted];
        let remotes = [
            R::Absent,
            R::PresentNew,
            R::PresentSame,
            R::Consumed,
            R::Tombstone,
        ];
        for local in locals {
            for remote in remotes {
                // Every cell yields a decision without panicking.
                let _ = decide(&input(local, remote));
            }
        }
    }

    #[test]
    fn classify_remote_versions() {
        let alice = Pseudonym::new("alice").unwrap();
        let entry = IndexEntry {
            last_pulled: Version::new(3),
            ..Default::default()
        };

        let live = Placeholder::pushed(alice.clone(), Version::new(4), Digest::from_bytes([1; 32]));
        assert_eq!(
            classify_remote(Some(&live), Some(&entry)),
            RemoteState::PresentNew
        );

        let known = Placeholder::pushed(alice.clone(), Version::new(3), Digest::from_bytes([1; 32]));
        assert_eq!(
            classify_remote(Some(&known), Some(&entry)),
            RemoteState::PresentSame
        );

        let consumed = known.consumed();
        assert_eq!(
            classify_remote(Some(&consumed), Some(&entry)),
            RemoteState::Consumed
        );

        let tombstone = Placeholder::tombstone(alice, Version::new(5));
        assert_eq!(
            classify_remote(Some(&tombstone), Some(&entry)),
            RemoteState::Tombstone
        );

        assert_eq!(classify_remote(None, Some(&entry)), RemoteState::Absent);
    }

    #[test]
    fn applied_tombstone_is_present_same() {
        let alice = Pseudonym::new("alice").unwrap();
        let entry = IndexEntry {
            last_pulled: Version::new(5),
            ..Default::default()
        };
        let tombstone = Placeholder::tombstone(alice, Version::new(5));
        assert_eq!(
            classify_remote(Some(&tombstone), Some(&entry)),
            RemoteState::PresentSame
        );
    }
}
