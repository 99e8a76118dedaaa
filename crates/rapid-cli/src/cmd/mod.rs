//! Subcommand implementations.

pub mod download;
pub mod dump;
pub mod list;
pub mod validate;
