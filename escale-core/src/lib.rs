//! # escale-core
//!
//! The synchronization core of Escale: the per-path decision engine, the
//! durable local index, the per-repository scheduler, and the
//! maintenance operations (migrate / backup / restore / access).
//!
//! # Architecture
//!
//! ```text
//! RepositoryWorker (scheduler)
//!        │  snapshot relay + local tree, shuffle, pace, back off
//!        ▼
//!   SyncEngine (per-path decisions)
//!        │  decide() is a pure function over (local, remote, rights)
//!        ▼
//!   escale-relay (locks, placeholders, messages over the adapter)
//!   escale-content (framing)
//! ```
//!
//! One path's failure never aborts a scan; one repository's failure
//! never aborts the process.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod backoff;
mod config;
mod engine;
mod index;
mod maintain;
mod scan;
mod worker;

pub use backoff::Backoff;
pub use config::{ConfigError, RepositoryConfig};
pub use engine::{
    decide, ConflictStrategy, ConsumeMode, Decision, DecisionInput, EngineError, LocalState,
    RemoteState, SyncContext, SyncEngine, SyncOutcome,
};
pub use index::{Index, IndexEntry};
pub use maintain::{backup, grant_access, migrate, restore, set_access, MaintainReport, SafetyMode};
pub use scan::{hash_file, local_snapshot, LocalFile};
pub use worker::{RepositoryWorker, ScanReport, WorkerOptions};
