//! The per-repository worker loop.
//!
//! One cooperative single-threaded loop per repository: wake on an
//! interval with jitter, snapshot the relay and the local tree, merge
//! and shuffle the candidate set, and run each path through the engine.
//! Suspension points are exactly the adapter calls and local file I/O;
//! the cancellation token is checked between paths, so shutdown takes at
//! most one adapter call's worth of latency.
//!
//! Failure policy per path: `Busy` and transient relay errors defer the
//! path with exponential back-off; integrity failures are quarantined
//! and surfaced; everything else is logged and the scan moves on.
//! Nothing a single path does can abort the scan.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use escale_relay::{with_deadline, Category, Naming, RelayMessage, RelayName};
use escale_types::LogicalPath;

use crate::backoff::Backoff;
use crate::config::RepositoryConfig;
use crate::engine::{EngineError, SyncEngine, SyncOutcome};
use crate::scan::local_snapshot;

/// Scheduler pacing options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Base interval between scans.
    pub scan_interval: Duration,
    /// Maximum random jitter added to each interval.
    pub jitter: Duration,
    /// Placeholder retention horizon; `None` disables forgetting.
    pub retention: Option<Duration>,
}

impl WorkerOptions {
    /// Derive pacing from a repository configuration.
    pub fn from_config(config: &RepositoryConfig) -> Self {
        Self {
            scan_interval: Duration::from_secs(config.schedule.scan_interval_secs),
            jitter: Duration::from_secs(config.schedule.jitter_secs),
            retention: config.retention(),
        }
    }
}

/// Counters from one scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Paths that pushed, pulled or otherwise changed state.
    pub transferred: usize,
    /// Paths already in sync or with nothing to do.
    pub unchanged: usize,
    /// Paths deferred with back-off (busy, transient errors).
    pub deferred: usize,
    /// Paths that failed and were surfaced.
    pub failed: usize,
}

/// The worker driving one repository.
pub struct RepositoryWorker {
    engine: SyncEngine,
    options: WorkerOptions,
    cancel: CancellationToken,
    /// Per-path back-off state; paths wait out their delay across scans.
    backoffs: HashMap<LogicalPath, (Backoff, Instant)>,
    /// Instance nonce distinguishing this process in the identity marker.
    instance: String,
}

impl RepositoryWorker {
    /// Create a worker over an engine.
    pub fn new(engine: SyncEngine, options: WorkerOptions, cancel: CancellationToken) -> Self {
        Self {
            engine,
            options,
            cancel,
            backoffs: HashMap::new(),
            instance: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// The engine (tests, status reporting).
    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Spawn the worker loop as a task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until cancelled.
    pub async fn run(mut self) {
        if let Err(e) = self.probe_identity().await {
            tracing::error!("identity probe failed: {e}");
            return;
        }
        tracing::info!(pseudonym = %self.engine.ctx().pseudonym, "repository worker started");

        loop {
            // Keep the identity marker fresh so duplicate-pseudonym
            // probes by other processes keep seeing a live claim.
            {
                let ctx = self.engine.ctx();
                let marker = Naming::identity(&ctx.pseudonym);
                if let Err(e) = with_deadline(ctx.deadline, ctx.store.touch(&marker)).await {
                    tracing::debug!("identity marker refresh failed: {e}");
                }
            }

            let report = self.scan_once().await;
            tracing::debug!(?report, "scan complete");

            let jitter_ms = if self.options.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..self.options.jitter.as_millis() as u64)
            };
            let delay = self.options.scan_interval + Duration::from_millis(jitter_ms);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!("repository worker stopped");
    }

    /// Run one scan: messages first, then the shuffled candidate set,
    /// then retention housekeeping.
    pub async fn scan_once(&mut self) -> ScanReport {
        let mut report = ScanReport::default();

        let (mut paths, messages, placeheld) = match self.snapshot().await {
            Ok(sets) => sets,
            Err(e) => {
                tracing::warn!("snapshot failed: {e}");
                report.failed += 1;
                return report;
            }
        };

        for (path, name, message) in messages {
            if self.cancel.is_cancelled() {
                return report;
            }
            if let Err(e) = self.engine.apply_message(&path, &name, &message).await {
                tracing::warn!(path = %path, "message handling failed: {e}");
            }
        }

        // Shuffle so contending clients do not starve the same paths in
        // the same order every scan.
        paths.shuffle(&mut rand::thread_rng());

        for path in &paths {
            if self.cancel.is_cancelled() {
                return report;
            }
            if let Some((_, not_before)) = self.backoffs.get(path) {
                if Instant::now() < *not_before {
                    report.deferred += 1;
                    continue;
                }
            }
            match self.engine.sync_path(path).await {
                Ok(SyncOutcome::Skipped | SyncOutcome::UpToDate) => {
                    self.backoffs.remove(path);
                    report.unchanged += 1;
                }
                Ok(outcome) => {
                    self.backoffs.remove(path);
                    tracing::debug!(path = %path, ?outcome, "transferred");
                    report.transferred += 1;
                }
                Err(e) if e.is_retryable() => {
                    let (backoff, not_before) = self
                        .backoffs
                        .entry(path.clone())
                        .or_insert_with(|| (Backoff::new(), Instant::now()));
                    let delay = backoff.next_delay();
                    *not_before = Instant::now() + delay;
                    tracing::debug!(path = %path, ?delay, "deferred: {e}");
                    report.deferred += 1;
                }
                Err(e @ EngineError::Cancelled) => {
                    tracing::debug!("scan cancelled: {e}");
                    return report;
                }
                Err(e) => {
                    tracing::warn!(path = %path, "sync failed: {e}");
                    report.failed += 1;
                }
            }
        }

        if let Some(retention) = self.options.retention {
            for path in &placeheld {
                if self.cancel.is_cancelled() {
                    return report;
                }
                match self.engine.forget_expired(path, retention).await {
                    Ok(_) => {}
                    Err(e) if e.is_retryable() => {}
                    Err(e) => tracing::debug!(path = %path, "retention sweep failed: {e}"),
                }
            }
        }

        if !self.cancel.is_cancelled() {
            if let Err(e) = self.engine.mark_scan_complete().await {
                tracing::warn!("could not persist scan state: {e}");
            }
        }
        report
    }

    /// Merge the relay listing and the local tree into candidate paths,
    /// messages addressed to this client, and placeheld paths for the
    /// retention sweep.
    #[allow(clippy::type_complexity)]
    async fn snapshot(
        &mut self,
    ) -> Result<
        (
            Vec<LogicalPath>,
            Vec<(LogicalPath, RelayName, RelayMessage)>,
            Vec<LogicalPath>,
        ),
        EngineError,
    > {
        let ctx = self.engine.ctx().clone();
        let listing = with_deadline(ctx.deadline, ctx.store.list("")).await?;

        let mut paths = BTreeSet::new();
        let mut messages = Vec::new();
        let mut placeheld = Vec::new();

        for entry in listing {
            let (base, category) = Naming::parse(&entry.name);
            let logical = Naming::logical_from_base(&base)
                .or_else(|| self.engine.index().resolve_long_name(&base).cloned());
            let Some(path) = logical else {
                if !matches!(category, Category::Identity { .. } | Category::Temp) {
                    tracing::debug!(name = %entry.name, "unresolvable relay name");
                }
                continue;
            };
            match category {
                Category::Payload | Category::Placeholder => {
                    if matches!(category, Category::Placeholder) {
                        placeheld.push(path.clone());
                    }
                    paths.insert(path);
                }
                Category::Message { recipient } if recipient == ctx.pseudonym.as_str() => {
                    let bytes =
                        match with_deadline(ctx.deadline, ctx.store.get(&entry.name)).await {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                tracing::debug!(name = %entry.name, "message fetch failed: {e}");
                                continue;
                            }
                        };
                    match RelayMessage::from_bytes(&bytes) {
                        Ok(message) => messages.push((path, entry.name, message)),
                        Err(e) => {
                            tracing::warn!(name = %entry.name, "malformed message: {e}")
                        }
                    }
                }
                Category::Message { .. } | Category::Lock | Category::Temp => {}
                Category::Identity { .. } => {}
            }
        }

        let local = local_snapshot(&ctx.root)
            .await
            .map_err(|e| EngineError::LocalIo {
                context: "local snapshot".into(),
                source: e,
            })?;
        for file in local {
            paths.insert(file.path);
        }
        // Index entries catch local deletions: the file is gone from the
        // walk but the entry still references it.
        for path in self.engine.index().entries.keys() {
            paths.insert(path.clone());
        }

        Ok((paths.into_iter().collect(), messages, placeheld))
    }

    /// Refuse to start when another live client uses our pseudonym, then
    /// write our identity marker.
    async fn probe_identity(&self) -> Result<(), EngineError> {
        let ctx = self.engine.ctx();
        let marker = Naming::identity(&ctx.pseudonym);

        match with_deadline(ctx.deadline, ctx.store.get(&marker)).await {
            Ok(bytes) => {
                let foreign = std::str::from_utf8(&bytes)
                    .map(|body| !body.contains(&self.instance))
                    .unwrap_or(true);
                let age = match with_deadline(ctx.deadline, ctx.store.mtime(&marker)).await? {
                    Some(mtime) => mtime.elapsed().unwrap_or_default(),
                    None => Duration::MAX,
                };
                if foreign && age < ctx.lock_options.ttl * 2 {
                    return Err(EngineError::Config(format!(
                        "pseudonym {:?} is already in use on this relay",
                        ctx.pseudonym.as_str()
                    )));
                }
            }
            Err(escale_relay::RelayError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let body = format!(
            "pseudonym={}\ninstance={}\nstarted={}\n",
            ctx.pseudonym,
            self.instance,
            chrono::Utc::now().to_rfc3339()
        );
        with_deadline(ctx.deadline, ctx.store.put(&marker, body.as_bytes())).await?;
        Ok(())
    }
}
