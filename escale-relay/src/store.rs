//! The relay adapter contract.
//!
//! Every backend (local directory, FTP, WebDAV, object store) is driven
//! through [`RelayStore`]. The engine never sees backend specifics, only
//! this trait and its error kinds.

use std::path::Path;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use thiserror::Error;

use crate::naming::RelayName;

/// Relay adapter errors.
///
/// The split between transient and permanent drives the scheduler's retry
/// policy: transient errors back off and retry, permanent errors pause
/// the repository worker.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// The adapter call exceeded its deadline.
    #[error("relay operation timed out")]
    Timeout,

    /// A retryable failure (connection reset, 5xx, interrupted I/O).
    #[error("transient relay error: {0}")]
    Transient(String),

    /// A non-retryable failure (auth, protocol violation, bad name).
    #[error("permanent relay error: {0}")]
    Permanent(String),

    /// A blob that was required does not exist.
    #[error("blob not found on relay: {0}")]
    NotFound(String),
}

impl RelayError {
    /// Whether the scheduler should retry after back-off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Timeout | RelayError::Transient(_))
    }
}

/// One entry in a relay directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    /// The blob name, relative to the repository's relay root.
    pub name: RelayName,
    /// Blob size in bytes.
    pub size: u64,
    /// Last modification time, if the backend reports one.
    pub mtime: Option<SystemTime>,
}

/// Uniform blocking-style operations over an arbitrary blob store.
///
/// Contract every implementation must provide or emulate:
/// - `put` is observable atomically: `list`/`get` never see a partial
///   blob under the target name (backends without atomic put write a
///   `.tmp.<nonce>` name and rename).
/// - after `put` returns, a later `list` of the containing prefix
///   eventually returns the name (bounded delay, no silent truncation).
/// - `delete` of a missing name is not an error.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// List blobs whose name starts with `prefix` (empty = whole root).
    async fn list(&self, prefix: &str) -> Result<Vec<RelayEntry>, RelayError>;

    /// Fetch a blob's full content.
    async fn get(&self, name: &RelayName) -> Result<Vec<u8>, RelayError>;

    /// Store a blob, replacing any previous content.
    async fn put(&self, name: &RelayName, bytes: &[u8]) -> Result<(), RelayError>;

    /// Delete a blob. Deleting a missing name succeeds.
    async fn delete(&self, name: &RelayName) -> Result<(), RelayError>;

    /// Whether a blob exists.
    async fn exists(&self, name: &RelayName) -> Result<bool, RelayError>;

    /// Blob size in bytes, or `None` if missing.
    async fn size(&self, name: &RelayName) -> Result<Option<u64>, RelayError>;

    /// Blob modification time; `None` if missing or not reported.
    async fn mtime(&self, name: &RelayName) -> Result<Option<SystemTime>, RelayError>;

    /// Fetch a blob into a local file.
    async fn get_to(&self, name: &RelayName, dest: &Path) -> Result<(), RelayError> {
        let bytes = self.get(name).await?;
        tokio::fs::write(dest, bytes)
            .await
            .map_err(|e| RelayError::Permanent(format!("writing {}: {e}", dest.display())))
    }

    /// Store a blob from a local file.
    async fn put_from(&self, name: &RelayName, src: &Path) -> Result<(), RelayError> {
        let bytes = tokio::fs::read(src)
            .await
            .map_err(|e| RelayError::Permanent(format!("reading {}: {e}", src.display())))?;
        self.put(name, &bytes).await
    }

    /// Refresh a blob's mtime without changing content.
    ///
    /// Backends with a native touch override this; the default re-puts
    /// the fetched content.
    async fn touch(&self, name: &RelayName) -> Result<(), RelayError> {
        let bytes = self.get(name).await?;
        self.put(name, &bytes).await
    }
}

/// Run an adapter call under a deadline.
///
/// Exceeding the deadline yields [`RelayError::Timeout`], never a silent
/// hang. The engine wraps every adapter call with this.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, RelayError>
where
    F: std::future::Future<Output = Result<T, RelayError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout),
    }
}
