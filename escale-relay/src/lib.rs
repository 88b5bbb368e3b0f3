//! # escale-relay
//!
//! The relay side of Escale: a uniform adapter contract over arbitrary
//! blob stores, the naming scheme that maps logical paths to relay blob
//! names, and the on-relay placeholder/lock/message protocol that
//! mediates ownership of each path.
//!
//! The relay is a dumb store - list/get/put/delete and nothing else. All
//! coordination between clients is encoded as auxiliary blobs next to the
//! payload:
//!
//! ```text
//! <escaped-path>                    payload blob (framed)
//! <escaped-path>.placeholder        latest sender, version, digest
//! <escaped-path>.lock               best-effort mutex
//! <escaped-path>.message.<to>       addressed request
//! <escaped-path>.tmp.<nonce>        in-flight upload (transient)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod dir;
mod header;
mod lock;
mod memory;
mod message;
mod naming;
mod placeholder;
mod store;

pub use dir::DirRelay;
pub use header::HeaderError;
pub use lock::{LockError, LockInfo, LockOptions, PathLock};
pub use memory::MemoryRelay;
pub use message::{MessageKind, RelayMessage};
pub use naming::{
    Category, Naming, RelayName, DEFAULT_MAX_NAME_LEN, IDENTITY_PREFIX, LOCK_SUFFIX,
    MESSAGE_INFIX, PLACEHOLDER_SUFFIX, TMP_INFIX,
};
pub use placeholder::Placeholder;
pub use store::{with_deadline, RelayEntry, RelayError, RelayStore};
