//! # escale-content
//!
//! Encryption and integrity framing of Escale payload blobs.
//!
//! Every payload stored on the relay is framed as
//! `magic ∥ version ∥ flags ∥ nonce ∥ plaintext-length ∥ body`, where the
//! body is optionally gzip-compressed and, when a passphrase is
//! configured, encrypted with XChaCha20-Poly1305. The content digest
//! recorded in placeholders is always the BLAKE3 hash of the plaintext,
//! so clients with different compression settings compare equal.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod frame;
mod keys;

pub use error::ContentError;
pub use frame::{digest, frame, unframe, FORMAT_VERSION, MAGIC, MAX_PLAINTEXT_SIZE, NONCE_SIZE};
pub use keys::{ContentKey, RepoSecret, KEY_SIZE, SALT_SIZE};
