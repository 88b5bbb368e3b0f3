//! Local-directory relay adapter.
//!
//! Backs the adapter contract with a plain directory, which covers
//! locally mounted remote filesystems (sshfs, davfs) and serves as the
//! reference implementation for the atomic-put emulation: every `put`
//! writes a `.tmp.<nonce>` sibling and renames it into place, so the
//! target name never exposes a partial blob.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::naming::RelayName;
use crate::store::{RelayEntry, RelayError, RelayStore};

/// Relay adapter over a local directory.
#[derive(Debug, Clone)]
pub struct DirRelay {
    root: PathBuf,
}

impl DirRelay {
    /// Open a directory as a relay root, creating it if missing.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, RelayError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| map_io(&root.display().to_string(), e))?;
        Ok(Self { root })
    }

    /// The relay root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &RelayName) -> Result<PathBuf, RelayError> {
        let mut out = self.root.clone();
        for segment in name.as_str().split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(RelayError::Permanent(format!(
                    "invalid relay name: {name}"
                )));
            }
            out.push(segment);
        }
        Ok(out)
    }
}

fn map_io(name: &str, e: std::io::Error) -> RelayError {
    match e.kind() {
        ErrorKind::NotFound => RelayError::NotFound(name.to_string()),
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            RelayError::Transient(format!("{name}: {e}"))
        }
        _ => RelayError::Permanent(format!("{name}: {e}")),
    }
}

#[async_trait]
impl RelayStore for DirRelay {
    async fn list(&self, prefix: &str) -> Result<Vec<RelayEntry>, RelayError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            for entry in walkdir::WalkDir::new(&root).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    // A blob deleted mid-walk is not an error.
                    Err(e) if e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) => {
                        continue
                    }
                    Err(e) => return Err(RelayError::Transient(e.to_string())),
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(|e| RelayError::Permanent(e.to_string()))?;
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !name.starts_with(&prefix) {
                    continue;
                }
                let meta = entry
                    .metadata()
                    .map_err(|e| RelayError::Transient(e.to_string()))?;
                entries.push(RelayEntry {
                    name: RelayName::from_raw(name),
                    size: meta.len(),
                    mtime: meta.modified().ok(),
                });
            }
            Ok(entries)
        })
        .await
        .map_err(|e| RelayError::Permanent(format!("list task failed: {e}")))?
    }

    async fn get(&self, name: &RelayName) -> Result<Vec<u8>, RelayError> {
        let path = self.resolve(name)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| map_io(name.as_str(), e))
    }

    async fn put(&self, name: &RelayName, bytes: &[u8]) -> Result<(), RelayError> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(name.as_str(), e))?;
        }
        let tmp = path.with_file_name(format!(
            "{}.tmp.{}",
            path.file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            uuid::Uuid::new_v4().simple()
        ));
        let result = async {
            tokio::fs::write(&tmp, bytes)
                .await
                .map_err(|e| map_io(name.as_str(), e))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| map_io(name.as_str(), e))
        }
        .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    async fn delete(&self, name: &RelayName) -> Result<(), RelayError> {
        let path = self.resolve(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(name.as_str(), e)),
        }
    }

    async fn exists(&self, name: &RelayName) -> Result<bool, RelayError> {
        let path = self.resolve(name)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn size(&self, name: &RelayName) -> Result<Option<u64>, RelayError> {
        let path = self.resolve(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(name.as_str(), e)),
        }
    }

    async fn mtime(&self, name: &RelayName) -> Result<Option<SystemTime>, RelayError> {
        let path = self.resolve(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.modified().ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(name.as_str(), e)),
        }
    }

    async fn touch(&self, name: &RelayName) -> Result<(), RelayError> {
        let path = self.resolve(name)?;
        let display = name.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| map_io(&display, e))?;
            file.set_modified(SystemTime::now())
                .map_err(|e| map_io(&display, e))
        })
        .await
        .map_err(|e| RelayError::Permanent(format!("touch task failed: {e}")))?
    }

    async fn get_to(&self, name: &RelayName, dest: &Path) -> Result<(), RelayError> {
        let path = self.resolve(name)?;
        tokio::fs::copy(&path, dest)
            .await
            .map(|_| ())
            .map_err(|e| map_io(name.as_str(), e))
    }

    async fn put_from(&self, name: &RelayName, src: &Path) -> Result<(), RelayError> {
        let bytes = tokio::fs::read(src)
            .await
            .map_err(|e| map_io(name.as_str(), e))?;
        self.put(name, &bytes).await
    }
}
