//! Maintenance operations: migrate, backup, restore, access editing.
//!
//! All of these work on whole relay repositories. `Fast` mode assumes no
//! client is active and copies blindly; `Safe` mode acquires each path's
//! lock first and skips paths it cannot lock. Locks and in-flight upload
//! blobs are transient and never copied.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use escale_relay::{
    Category, LockError, LockOptions, MessageKind, Naming, PathLock, RelayError, RelayMessage,
    RelayName, RelayStore,
};
use escale_types::{AccessRights, LogicalPath, Pseudonym};

use crate::engine::EngineError;
use crate::index::Index;

/// Whether an operation may assume no client is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyMode {
    /// No lock dance; assumes exclusive access to the relay.
    Fast,
    /// Acquire each path's lock before touching its blobs.
    Safe,
}

/// Counters from a maintenance operation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintainReport {
    /// Blobs copied or archived.
    pub copied: usize,
    /// Blobs or paths skipped (transient blobs, busy locks).
    pub skipped: usize,
}

/// Group a relay listing by escaped base name, dropping transient blobs.
///
/// Identity markers have no path lock, so they travel in the `""` group.
fn group_blobs(
    listing: Vec<escale_relay::RelayEntry>,
    report: &mut MaintainReport,
) -> BTreeMap<String, Vec<RelayName>> {
    let mut groups: BTreeMap<String, Vec<RelayName>> = BTreeMap::new();
    for entry in listing {
        let (base, category) = Naming::parse(&entry.name);
        match category {
            Category::Lock | Category::Temp => report.skipped += 1,
            Category::Identity { .. } => groups.entry(String::new()).or_default().push(entry.name),
            _ => groups.entry(base).or_default().push(entry.name),
        }
    }
    groups
}

async fn lock_group(
    store: &dyn RelayStore,
    base: &str,
    mode: SafetyMode,
    identity: &Pseudonym,
    options: &LockOptions,
) -> Result<Option<PathLock>, EngineError> {
    if mode == SafetyMode::Fast || base.is_empty() {
        return Ok(None);
    }
    let name = RelayName::from_raw(format!("{base}{}", escale_relay::LOCK_SUFFIX));
    match PathLock::acquire(store, name, identity, options).await {
        Ok(lock) => Ok(Some(lock)),
        Err(LockError::Busy { holder }) => {
            tracing::warn!(base, ?holder, "path busy; skipped");
            Ok(None)
        }
        Err(LockError::Relay(e)) => Err(e.into()),
    }
}

/// Copy every blob from one relay to another, preserving names.
///
/// Locks and in-flight uploads are skipped as transient. In `Safe` mode
/// a busy path is skipped whole and reported, never half-copied.
pub async fn migrate(
    src: &dyn RelayStore,
    dst: &dyn RelayStore,
    mode: SafetyMode,
    identity: &Pseudonym,
    options: &LockOptions,
) -> Result<MaintainReport, EngineError> {
    let mut report = MaintainReport::default();
    let groups = group_blobs(src.list("").await?, &mut report);

    for (base, names) in groups {
        let lock = lock_group(src, &base, mode, identity, options).await?;
        if mode == SafetyMode::Safe && !base.is_empty() && lock.is_none() {
            report.skipped += names.len();
            continue;
        }
        let result = copy_group(src, dst, &names, &mut report).await;
        if let Some(lock) = lock {
            lock.release(src).await?;
        }
        result?;
    }
    tracing::info!(copied = report.copied, skipped = report.skipped, "migration complete");
    Ok(report)
}

async fn copy_group(
    src: &dyn RelayStore,
    dst: &dyn RelayStore,
    names: &[RelayName],
    report: &mut MaintainReport,
) -> Result<(), EngineError> {
    for name in names {
        match src.get(name).await {
            Ok(bytes) => {
                dst.put(name, &bytes).await?;
                report.copied += 1;
            }
            // Consumed between listing and copy.
            Err(RelayError::NotFound(_)) => report.skipped += 1,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Archive the relay's blob set into a gzip tarball.
pub async fn backup(
    store: &dyn RelayStore,
    dest: &Path,
    mode: SafetyMode,
    identity: &Pseudonym,
    options: &LockOptions,
) -> Result<MaintainReport, EngineError> {
    let mut report = MaintainReport::default();
    let groups = group_blobs(store.list("").await?, &mut report);

    let mut blobs: Vec<(String, Vec<u8>)> = Vec::new();
    for (base, names) in groups {
        let lock = lock_group(store, &base, mode, identity, options).await?;
        if mode == SafetyMode::Safe && !base.is_empty() && lock.is_none() {
            report.skipped += names.len();
            continue;
        }
        let mut result = Ok(());
        for name in &names {
            match store.get(name).await {
                Ok(bytes) => {
                    blobs.push((name.as_str().to_string(), bytes));
                    report.copied += 1;
                }
                Err(RelayError::NotFound(_)) => report.skipped += 1,
                Err(e) => {
                    result = Err(EngineError::from(e));
                    break;
                }
            }
        }
        if let Some(lock) = lock {
            lock.release(store).await?;
        }
        result?;
    }

    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
        let file = std::fs::File::create(&dest)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, bytes) in &blobs {
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, bytes.as_slice())?;
        }
        builder.into_inner()?.finish()?.sync_all()?;
        Ok(())
    })
    .await
    .map_err(|e| EngineError::Config(format!("backup task failed: {e}")))?
    .map_err(|e| EngineError::LocalIo {
        context: "writing backup archive".into(),
        source: e,
    })?;

    tracing::info!(copied = report.copied, skipped = report.skipped, "backup complete");
    Ok(report)
}

/// Unpack a gzip tarball produced by [`backup`] onto a relay.
pub async fn restore(
    store: &dyn RelayStore,
    archive: &Path,
    mode: SafetyMode,
    identity: &Pseudonym,
    options: &LockOptions,
) -> Result<MaintainReport, EngineError> {
    let archive = archive.to_path_buf();
    let blobs = tokio::task::spawn_blocking(
        move || -> Result<Vec<(String, Vec<u8>)>, std::io::Error> {
            let file = std::fs::File::open(&archive)?;
            let mut reader = tar::Archive::new(GzDecoder::new(file));
            let mut blobs = Vec::new();
            for entry in reader.entries()? {
                let mut entry = entry?;
                let name = entry.path()?.to_string_lossy().into_owned();
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut bytes)?;
                blobs.push((name, bytes));
            }
            Ok(blobs)
        },
    )
    .await
    .map_err(|e| EngineError::Config(format!("restore task failed: {e}")))?
    .map_err(|e| EngineError::LocalIo {
        context: "reading backup archive".into(),
        source: e,
    })?;

    let mut report = MaintainReport::default();
    let mut groups: BTreeMap<String, Vec<(String, Vec<u8>)>> = BTreeMap::new();
    for (name, bytes) in blobs {
        let (base, category) = Naming::parse(&RelayName::from_raw(name.clone()));
        match category {
            Category::Lock | Category::Temp => report.skipped += 1,
            Category::Identity { .. } => {
                groups.entry(String::new()).or_default().push((name, bytes))
            }
            _ => groups.entry(base).or_default().push((name, bytes)),
        }
    }

    for (base, blobs) in groups {
        let lock = lock_group(store, &base, mode, identity, options).await?;
        if mode == SafetyMode::Safe && !base.is_empty() && lock.is_none() {
            report.skipped += blobs.len();
            continue;
        }
        let mut result = Ok(());
        for (name, bytes) in &blobs {
            if let Err(e) = store.put(&RelayName::from_raw(name.clone()), bytes).await {
                result = Err(EngineError::from(e));
                break;
            }
            report.copied += 1;
        }
        if let Some(lock) = lock {
            lock.release(store).await?;
        }
        result?;
    }

    tracing::info!(copied = report.copied, skipped = report.skipped, "restore complete");
    Ok(report)
}

/// Set a path's access rights and advertise the change to every peer
/// with an identity marker on the relay.
///
/// Returns how many peers were notified.
pub async fn set_access(
    store: &dyn RelayStore,
    naming: &Naming,
    index: &mut Index,
    index_path: &Path,
    pseudonym: &Pseudonym,
    path: &LogicalPath,
    rights: AccessRights,
) -> Result<usize, EngineError> {
    index.entry_mut(path).rights = rights;
    index.save(index_path).await.map_err(|e| EngineError::LocalIo {
        context: "saving index".into(),
        source: e,
    })?;

    let message = RelayMessage::new(pseudonym.clone(), MessageKind::AccessChange { rights });
    let mut notified = 0;
    for entry in store.list(escale_relay::IDENTITY_PREFIX).await? {
        let (_, category) = Naming::parse(&entry.name);
        let Category::Identity { pseudonym: peer } = category else {
            continue;
        };
        if peer == pseudonym.as_str() {
            continue;
        }
        let Ok(peer) = Pseudonym::new(&peer) else {
            continue;
        };
        store
            .put(&naming.message(path, &peer), &message.to_bytes())
            .await?;
        notified += 1;
    }
    tracing::info!(path = %path, %rights, notified, "access rights updated");
    Ok(notified)
}

/// Grant a gated operation on `path` to `peer`.
pub async fn grant_access(
    store: &dyn RelayStore,
    naming: &Naming,
    pseudonym: &Pseudonym,
    path: &LogicalPath,
    peer: &Pseudonym,
) -> Result<(), EngineError> {
    let message = RelayMessage::new(pseudonym.clone(), MessageKind::AccessGrant);
    store
        .put(&naming.message(path, peer), &message.to_bytes())
        .await?;
    tracing::info!(path = %path, %peer, "access granted");
    Ok(())
}
