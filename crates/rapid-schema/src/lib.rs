//! Data model and wire codec for the Rapid package protocol.
//!
//! Pure: no I/O beyond in-memory gzip. Everything that touches the network
//! or the filesystem lives in `rapid-core`.

pub mod codec;
pub mod error;
pub mod hash;
pub mod specifier;
pub mod types;

// Re-exports
pub use error::CorruptionError;
pub use hash::{ETag, Md5Digest};
pub use specifier::PackageSpec;
pub use types::*;
