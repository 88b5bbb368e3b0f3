//! End-to-end scenarios with two clients sharing one relay.
//!
//! Each test builds two engines over the same in-memory relay, each with
//! its own working tree and index, and drives scans by hand.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use escale_content::{ContentKey, RepoSecret};
use escale_core::{
    ConflictStrategy, ConsumeMode, Index, RepositoryWorker, SyncContext, SyncEngine, WorkerOptions,
};
use escale_relay::{
    LockOptions, MemoryRelay, Naming, Placeholder, RelayName, RelayStore,
};
use escale_types::{AccessRights, LogicalPath, Pseudonym};

struct Client {
    worker: RepositoryWorker,
    root: tempfile::TempDir,
}

fn context(relay: &MemoryRelay, root: &Path, pseudonym: &str) -> SyncContext {
    SyncContext {
        store: Arc::new(relay.clone()),
        naming: Naming::default(),
        pseudonym: Pseudonym::new(pseudonym).unwrap(),
        root: root.to_path_buf(),
        key: None,
        compress: false,
        conflict: ConflictStrategy::NewerWins,
        consume: ConsumeMode::OneShot,
        lock_options: LockOptions {
            ttl: Duration::from_secs(60),
            settle: Duration::from_millis(10),
        },
        deadline: Duration::from_secs(5),
        quarantine_dir: root.join(".escale/quarantine"),
        default_rights: AccessRights::allow_all(),
    }
}

fn client_with(relay: &MemoryRelay, pseudonym: &str, tweak: impl FnOnce(&mut SyncContext, &mut Index)) -> Client {
    let root = tempfile::tempdir().unwrap();
    let mut ctx = context(relay, root.path(), pseudonym);
    let mut index = Index::default();
    tweak(&mut ctx, &mut index);
    let index_path = root.path().join(".escale/index.json");
    let engine = SyncEngine::new(ctx, index, index_path);
    let options = WorkerOptions {
        scan_interval: Duration::from_secs(3600),
        jitter: Duration::ZERO,
        retention: None,
    };
    Client {
        worker: RepositoryWorker::new(engine, options, CancellationToken::new()),
        root,
    }
}

fn client(relay: &MemoryRelay, pseudonym: &str) -> Client {
    client_with(relay, pseudonym, |_, _| {})
}

impl Client {
    fn write(&self, path: &str, contents: &[u8]) {
        let full = self.root.path().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, contents).unwrap();
    }

    fn read(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.root.path().join(path)).ok()
    }

    fn delete(&self, path: &str) {
        std::fs::remove_file(self.root.path().join(path)).unwrap();
    }

    fn set_mtime(&self, path: &str, mtime: SystemTime) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.root.path().join(path))
            .unwrap();
        file.set_modified(mtime).unwrap();
    }

    /// Names of conflict sidecars in the working tree.
    fn sidecars(&self) -> Vec<String> {
        walkdir::WalkDir::new(self.root.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".conflict-"))
            .collect()
    }
}

async fn placeholder_on(relay: &MemoryRelay, path: &str) -> Option<Placeholder> {
    let name = Naming::default().placeholder(&LogicalPath::new(path).unwrap());
    match relay.get(&name).await {
        Ok(bytes) => Some(Placeholder::from_bytes(&bytes).unwrap()),
        Err(_) => None,
    }
}

// Scenario 1: fresh push then pull.
#[tokio::test]
async fn fresh_push_then_pull() {
    let relay = MemoryRelay::new();
    let mut a = client(&relay, "alice");
    let mut b = client(&relay, "bob");

    a.write("docs/a.txt", b"hello");
    let report = a.worker.scan_once().await;
    assert_eq!(report.transferred, 1);

    let placeholder = placeholder_on(&relay, "docs/a.txt").await.unwrap();
    assert_eq!(placeholder.version.value(), 1);
    assert_eq!(
        placeholder.digest.unwrap().as_bytes(),
        blake3::hash(b"hello").as_bytes()
    );

    let report = b.worker.scan_once().await;
    assert_eq!(report.transferred, 1);
    assert_eq!(b.read("docs/a.txt").unwrap(), b"hello");

    // One-shot mode: the payload is gone, the placeholder survives in
    // its consumed form at the same version.
    let payload = Naming::default().payload(&LogicalPath::new("docs/a.txt").unwrap());
    assert!(!relay.exists(&payload).await.unwrap());
    let placeholder = placeholder_on(&relay, "docs/a.txt").await.unwrap();
    assert!(placeholder.is_consumed());
    assert_eq!(placeholder.version.value(), 1);
}

// P4: pushing content whose digest already matches is a no-op.
#[tokio::test]
async fn idempotent_push_skips_payload_put() {
    let relay = MemoryRelay::new();
    let mut a = client(&relay, "alice");
    a.write("a.txt", b"stable content");

    a.worker.scan_once().await;
    let payload = RelayName::from_raw("a.txt");
    assert_eq!(relay.put_count(&payload), 1);

    // Nothing changed locally; further scans never re-put the payload.
    a.worker.scan_once().await;
    a.worker.scan_once().await;
    assert_eq!(relay.put_count(&payload), 1);

    let placeholder = placeholder_on(&relay, "a.txt").await.unwrap();
    assert_eq!(placeholder.version.value(), 1);
}

// P3: versions observed at the relay are strictly increasing.
#[tokio::test]
async fn versions_are_monotonic_across_edits() {
    let relay = MemoryRelay::new();
    let mut a = client(&relay, "alice");
    let mut b = client(&relay, "bob");

    let mut seen = Vec::new();
    for round in 0usize..3 {
        // Sizes differ each round, so the mtime+size fast path re-hashes
        // even when two rounds land in the same second.
        let contents = format!("revision {}", "x".repeat(round + 1));
        a.write("notes.md", contents.as_bytes());
        a.worker.scan_once().await;
        seen.push(placeholder_on(&relay, "notes.md").await.unwrap().version);
        b.worker.scan_once().await;
        assert_eq!(b.read("notes.md").unwrap(), contents.as_bytes());
    }
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "versions {seen:?}");
}

// Scenario 2 / P6: concurrent edit under newer-wins, detected by the
// loser. Alice's edit carries the later mtime, so Bob's copy becomes a
// sidecar named after her.
#[tokio::test]
async fn concurrent_edit_newer_wins_remote_wins() {
    let relay = MemoryRelay::new();
    let mut a = client(&relay, "alice");
    let mut b = client(&relay, "bob");

    a.write("notes.md", b"base");
    a.worker.scan_once().await;
    b.worker.scan_once().await;

    // Both edit. Alice publishes hers; Bob's divergent copy is older.
    a.write("notes.md", b"alice's edit");
    a.worker.scan_once().await;
    b.write("notes.md", b"bob's divergent edit");
    b.set_mtime("notes.md", SystemTime::now() - Duration::from_secs(120));

    b.worker.scan_once().await;

    // Canonical content on both sides is Alice's; Bob keeps his losing
    // copy as a sidecar carrying Alice's pseudonym.
    assert_eq!(a.read("notes.md").unwrap(), b"alice's edit");
    assert_eq!(b.read("notes.md").unwrap(), b"alice's edit");
    let sidecars = b.sidecars();
    assert_eq!(sidecars.len(), 1, "{sidecars:?}");
    assert!(sidecars[0].starts_with("notes.md.conflict-"));
    assert!(sidecars[0].ends_with("-alice"));
    assert_eq!(b.read(&sidecars[0]).unwrap(), b"bob's divergent edit");
}

// P6: the same race with the mtimes reversed. The detecting side wins,
// preserves the remote loser as a sidecar, and re-publishes.
#[tokio::test]
async fn concurrent_edit_newer_wins_local_wins() {
    let relay = MemoryRelay::new();
    let mut a = client(&relay, "alice");
    let mut b = client(&relay, "bob");

    a.write("notes.md", b"base");
    a.worker.scan_once().await;
    b.worker.scan_once().await;

    b.write("notes.md", b"bob's edit");
    b.worker.scan_once().await;

    a.write("notes.md", b"alice's edit");
    a.set_mtime("notes.md", SystemTime::now() + Duration::from_secs(120));
    a.worker.scan_once().await;

    // Alice kept her content and preserved Bob's as a sidecar.
    assert_eq!(a.read("notes.md").unwrap(), b"alice's edit");
    let sidecars = a.sidecars();
    assert_eq!(sidecars.len(), 1, "{sidecars:?}");
    assert!(sidecars[0].ends_with("-bob"));
    assert_eq!(a.read(&sidecars[0]).unwrap(), b"bob's edit");

    // Bob converges to Alice's content on his next scan.
    b.worker.scan_once().await;
    assert_eq!(b.read("notes.md").unwrap(), b"alice's edit");
}

// P6: under reject, both copies persist and the conflict is surfaced.
#[tokio::test]
async fn concurrent_edit_reject_strategy() {
    let relay = MemoryRelay::new();
    let mut a = client_with(&relay, "alice", |ctx, _| ctx.conflict = ConflictStrategy::Reject);
    let mut b = client_with(&relay, "bob", |ctx, _| ctx.conflict = ConflictStrategy::Reject);

    a.write("notes.md", b"base");
    a.worker.scan_once().await;
    b.worker.scan_once().await;

    b.write("notes.md", b"bob's edit");
    b.worker.scan_once().await;

    a.write("notes.md", b"alice's edit");
    let report = a.worker.scan_once().await;

    assert_eq!(report.failed, 1);
    assert_eq!(a.read("notes.md").unwrap(), b"alice's edit");
    assert!(a.sidecars().is_empty());
    // The remote version is untouched for the next scan.
    let placeholder = placeholder_on(&relay, "notes.md").await.unwrap();
    assert!(!placeholder.is_consumed());
}

// Pull-first: the remote lands in a sidecar, the local file stays.
#[tokio::test]
async fn concurrent_edit_pull_first() {
    let relay = MemoryRelay::new();
    let mut a = client_with(&relay, "alice", |ctx, _| {
        ctx.conflict = ConflictStrategy::PullFirst
    });
    let mut b = client(&relay, "bob");

    a.write("notes.md", b"base");
    a.worker.scan_once().await;
    b.worker.scan_once().await;

    b.write("notes.md", b"bob's edit");
    b.worker.scan_once().await;

    a.write("notes.md", b"alice's edit");
    a.worker.scan_once().await;

    assert_eq!(a.read("notes.md").unwrap(), b"alice's edit");
    let sidecars = a.sidecars();
    assert_eq!(sidecars.len(), 1);
    let sidecar_content = a.read(&sidecars[0]).unwrap();
    assert_eq!(sidecar_content, b"bob's edit");

    // The sidecar is recorded as pulled; the next scan does not repeat it.
    a.worker.scan_once().await;
    assert_eq!(a.sidecars().len(), 1);
}

// Scenario 3: integrity tamper quarantines and leaves the local side alone.
#[tokio::test]
async fn tampered_payload_is_quarantined() {
    let relay = MemoryRelay::new();
    let key = ContentKey::derive(&RepoSecret::from_raw([7; 32]));
    let mut a = client_with(&relay, "alice", |ctx, _| ctx.key = Some(key.clone()));
    let mut b = client_with(&relay, "bob", |ctx, _| ctx.key = Some(key.clone()));

    a.write("report.pdf", b"authentic bytes");
    a.worker.scan_once().await;

    // An external actor flips one ciphertext byte on the relay.
    relay.flip_byte(&RelayName::from_raw("report.pdf"), 60);

    let report = b.worker.scan_once().await;
    assert_eq!(report.failed, 1);
    assert!(b.read("report.pdf").is_none(), "local file must stay untouched");

    // The placeholder is untouched for a later re-pull.
    let placeholder = placeholder_on(&relay, "report.pdf").await.unwrap();
    assert!(!placeholder.is_consumed());

    // The offending blob is quarantined client-side.
    let quarantine = b.root.path().join(".escale/quarantine");
    let quarantined: Vec<_> = std::fs::read_dir(&quarantine).unwrap().collect();
    assert_eq!(quarantined.len(), 1);
}

// Scenario 4 / P5: deletion propagates through a tombstone.
#[tokio::test]
async fn deletion_propagates() {
    let relay = MemoryRelay::new();
    let mut a = client(&relay, "alice");
    let mut b = client(&relay, "bob");

    a.write("old.log", b"obsolete");
    a.worker.scan_once().await;
    b.worker.scan_once().await;
    assert!(b.read("old.log").is_some());

    a.delete("old.log");
    let report = a.worker.scan_once().await;
    assert_eq!(report.transferred, 1);

    let placeholder = placeholder_on(&relay, "old.log").await.unwrap();
    assert!(placeholder.is_tombstone());
    assert_eq!(placeholder.version.value(), 2);

    let report = b.worker.scan_once().await;
    assert_eq!(report.transferred, 1);
    assert!(b.read("old.log").is_none());

    // Further scans on either side are quiet.
    assert_eq!(a.worker.scan_once().await.transferred, 0);
    assert_eq!(b.worker.scan_once().await.transferred, 0);
}

// P5 negative: a locally edited copy is not deleted by a tombstone.
#[tokio::test]
async fn deletion_spares_modified_copy() {
    let relay = MemoryRelay::new();
    let mut a = client(&relay, "alice");
    let mut b = client(&relay, "bob");

    a.write("old.log", b"obsolete");
    a.worker.scan_once().await;
    b.worker.scan_once().await;

    // Bob edits; Alice deletes. Bob's edit has the later mtime, so under
    // newer-wins his content survives and is re-published.
    b.write("old.log", b"bob still cares");
    b.set_mtime("old.log", SystemTime::now() + Duration::from_secs(120));
    a.delete("old.log");
    a.worker.scan_once().await;

    b.worker.scan_once().await;
    assert_eq!(b.read("old.log").unwrap(), b"bob still cares");
    let placeholder = placeholder_on(&relay, "old.log").await.unwrap();
    assert!(!placeholder.is_tombstone());
}

// Scenario 5: a gated read needs an explicit grant.
#[tokio::test]
async fn gated_read_requires_grant() {
    let relay = MemoryRelay::new();
    let path = LogicalPath::new("secret.txt").unwrap();
    let mut a = client(&relay, "alice");
    let mut b = client_with(&relay, "bob", |_, index| {
        index.entry_mut(&path).rights = AccessRights::parse("r? w").unwrap();
    });

    a.write("secret.txt", b"classified");
    a.worker.scan_once().await;

    // Bob's scan hits the gate: no pull, a request message for Alice.
    b.worker.scan_once().await;
    assert!(b.read("secret.txt").is_none());
    let naming = Naming::default();
    let request = naming.message(&path, &Pseudonym::new("alice").unwrap());
    assert!(relay.exists(&request).await.unwrap());

    // Alice grants; Bob's next scan pulls and spends the grant.
    escale_core::grant_access(
        &relay,
        &naming,
        &Pseudonym::new("alice").unwrap(),
        &path,
        &Pseudonym::new("bob").unwrap(),
    )
    .await
    .unwrap();

    b.worker.scan_once().await;
    assert_eq!(b.read("secret.txt").unwrap(), b"classified");
    let grant = naming.message(&path, &Pseudonym::new("bob").unwrap());
    assert!(!relay.exists(&grant).await.unwrap());
}

// P8: deleting the index and rescanning converges without new transfers.
#[tokio::test]
async fn index_rebuild_converges() {
    let relay = MemoryRelay::new();
    let mut a = client(&relay, "alice");
    let mut b = client(&relay, "bob");

    a.write("docs/a.txt", b"hello");
    a.write("docs/b.txt", b"world");
    a.worker.scan_once().await;
    b.worker.scan_once().await;

    let blobs_before = relay.blob_names();
    let payload_puts = relay.put_count(&RelayName::from_raw("docs/a.txt"));

    // Bob loses his index and rebuilds from scratch.
    let mut b2 = client(&relay, "bob-rebuilt");
    for name in ["docs/a.txt", "docs/b.txt"] {
        b2.write(name, &b.read(name).unwrap());
    }
    let report = b2.worker.scan_once().await;
    assert_eq!(report.failed, 0);

    // Same remote state, same local content, no redundant payload puts.
    assert_eq!(relay.blob_names(), blobs_before);
    assert_eq!(
        relay.put_count(&RelayName::from_raw("docs/a.txt")),
        payload_puts
    );
    assert_eq!(b2.read("docs/a.txt").unwrap(), b"hello");

    // And the rebuilt client keeps converging on subsequent scans.
    assert_eq!(b2.worker.scan_once().await.transferred, 0);
}

// P1: with a valid foreign lock in place, the contender backs off.
#[tokio::test]
async fn lock_contention_defers_the_loser() {
    let relay = MemoryRelay::new();
    let mut a = client(&relay, "alice");

    a.write("hot.txt", b"contended");
    let lock = escale_relay::PathLock::acquire(
        &relay,
        RelayName::from_raw("hot.txt.lock"),
        &Pseudonym::new("bob").unwrap(),
        &LockOptions {
            ttl: Duration::from_secs(60),
            settle: Duration::from_millis(10),
        },
    )
    .await
    .unwrap();

    let report = a.worker.scan_once().await;
    assert_eq!(report.deferred, 1);
    assert!(placeholder_on(&relay, "hot.txt").await.is_none());

    lock.release(&relay).await.unwrap();
}

// Retention: consumed placeholders past the horizon are forgotten.
#[tokio::test]
async fn retention_forgets_old_placeholders() {
    let relay = MemoryRelay::new();
    let mut a = client(&relay, "alice");
    let mut b = client(&relay, "bob");

    a.write("ephemeral.txt", b"short-lived");
    a.worker.scan_once().await;
    b.worker.scan_once().await;
    b.delete("ephemeral.txt");

    // Age the consumed placeholder past the horizon by rewriting it with
    // an old timestamp.
    let name = Naming::default().placeholder(&LogicalPath::new("ephemeral.txt").unwrap());
    let mut placeholder = Placeholder::from_bytes(&relay.get(&name).await.unwrap()).unwrap();
    placeholder.timestamp = chrono::Utc::now() - chrono::Duration::days(90);
    relay.put(&name, &placeholder.to_bytes()).await.unwrap();

    let root = tempfile::tempdir().unwrap();
    let engine = SyncEngine::new(
        context(&relay, root.path(), "carol"),
        Index::default(),
        root.path().join(".escale/index.json"),
    );
    let mut sweeper = RepositoryWorker::new(
        engine,
        WorkerOptions {
            scan_interval: Duration::from_secs(3600),
            jitter: Duration::ZERO,
            retention: Some(Duration::from_secs(30 * 24 * 3600)),
        },
        CancellationToken::new(),
    );
    sweeper.scan_once().await;

    assert!(!relay.exists(&name).await.unwrap());
}

// Transient relay errors are retried on a later scan, not fatal.
#[tokio::test]
async fn transient_error_is_deferred_then_recovers() {
    let relay = MemoryRelay::new();
    let mut a = client(&relay, "alice");
    a.write("flaky.txt", b"eventually");

    // The listing call fails once; the scan reports the failure and the
    // next scan succeeds.
    relay.inject_error(escale_relay::RelayError::Transient("connection reset".into()));
    let report = a.worker.scan_once().await;
    assert_eq!(report.transferred, 0);

    let report = a.worker.scan_once().await;
    assert_eq!(report.transferred, 1);
    assert!(placeholder_on(&relay, "flaky.txt").await.is_some());
}

// Errors on one path never abort the scan for the others.
#[tokio::test]
async fn one_bad_path_does_not_abort_the_scan() {
    let relay = MemoryRelay::new();
    let key = ContentKey::derive(&RepoSecret::from_raw([9; 32]));
    let mut a = client_with(&relay, "alice", |ctx, _| ctx.key = Some(key.clone()));
    let mut b = client_with(&relay, "bob", |ctx, _| ctx.key = Some(key.clone()));

    a.write("good-1.txt", b"fine");
    a.write("bad.txt", b"doomed");
    a.write("good-2.txt", b"also fine");
    a.worker.scan_once().await;

    relay.flip_byte(&RelayName::from_raw("bad.txt"), 50);

    let report = b.worker.scan_once().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.transferred, 2);
    assert_eq!(b.read("good-1.txt").unwrap(), b"fine");
    assert_eq!(b.read("good-2.txt").unwrap(), b"also fine");
    assert!(b.read("bad.txt").is_none());
}
