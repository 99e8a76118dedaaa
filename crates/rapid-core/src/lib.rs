//! Synchronization engine for Rapid package repositories.
//!
//! [`sync::Syncer`] is the entry point; the other modules are the pieces it
//! drives and are public for tools that need only one of them.

pub mod cache;
pub mod error;
pub mod io;
pub mod paths;
pub mod resolver;
pub mod store;
pub mod sync;
pub mod transfer;

pub use error::{ErrorKind, ResolutionError, SyncError};
pub use paths::*;
pub use sync::{PackageReport, PackageState, SyncConfig, SyncOutcome, Syncer};
pub use transfer::TransferMode;

/// User Agent string for core operations
pub const USER_AGENT: &str = concat!("rapid-core/", env!("CARGO_PKG_VERSION"));
