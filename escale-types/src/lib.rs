//! # escale-types
//!
//! Foundational types for the Escale relay synchronization protocol.
//!
//! This crate provides the types shared across all Escale crates:
//! - [`LogicalPath`] - canonical identity of a synchronized file
//! - [`Pseudonym`], [`Version`], [`Digest`] - identity, ordering and
//!   integrity types
//! - [`AccessRights`] - per-path read/write permissions

#![warn(missing_docs)]
#![warn(clippy::all)]

mod access;
mod ids;
mod path;

pub use access::{AccessFlag, AccessParseError, AccessRights};
pub use ids::{Digest, DigestParseError, Pseudonym, PseudonymError, Version};
pub use path::{LogicalPath, PathError};
