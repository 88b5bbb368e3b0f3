//! Local tree snapshots.
//!
//! Walks the repository root and produces the candidate set of local
//! files with their mtime and size. Hidden files and directories (names
//! starting with `.`) are never synchronized; files whose name collides
//! with a reserved relay suffix are skipped with a warning.

use std::path::Path;

use escale_types::{Digest, LogicalPath};

/// One local file seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// The file's logical path.
    pub path: LogicalPath,
    /// mtime in unix seconds.
    pub mtime_secs: i64,
    /// Size in bytes.
    pub size: u64,
}

/// Snapshot all synchronizable files under `root`.
///
/// Runs on the blocking pool; the walk is pure filesystem work.
pub async fn local_snapshot(root: &Path) -> Result<Vec<LocalFile>, std::io::Error> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || walk(&root))
        .await
        .map_err(|e| std::io::Error::other(format!("scan task failed: {e}")))?
}

fn walk(root: &Path) -> Result<Vec<LocalFile>, std::io::Error> {
    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            // The root itself has no file name to filter on.
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) => {
                continue; // deleted mid-walk
            }
            Err(e) => return Err(std::io::Error::other(e)),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(std::io::Error::other)?;
        let joined = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let path = match LogicalPath::new(&joined) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("skipping unsyncable local file {joined:?}: {e}");
                continue;
            }
        };
        let meta = entry.metadata().map_err(std::io::Error::other)?;
        let mtime_secs = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        files.push(LocalFile {
            path,
            mtime_secs,
            size: meta.len(),
        });
    }
    Ok(files)
}

/// Hash a local file's plaintext content.
pub async fn hash_file(path: &Path) -> Result<Digest, std::io::Error> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut hasher = blake3::Hasher::new();
        let mut file = std::fs::File::open(&path)?;
        std::io::copy(&mut file, &mut hasher)?;
        Ok(Digest::from_bytes(*hasher.finalize().as_bytes()))
    })
    .await
    .map_err(|e| std::io::Error::other(format!("hash task failed: {e}")))?
}
