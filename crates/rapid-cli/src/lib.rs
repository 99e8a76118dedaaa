//! rapid - Rapid package downloader
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
//!
//! Fetches content-addressed game packages from Rapid mirrors into a local
//! pool and keeps that pool verifiable.
//!
//! # Overview
//!
//! A mirror publishes a root index (`repos.gz`) listing repositories. Each
//! repository lists its packages (`versions.gz`), each package is a gzip
//! index of files (`packages/<md5>.sdp`), and each file is a gzip blob
//! addressed by the MD5 of its content (`pool/xx/rest.gz`).
//!
//! # Directory Layout
//!
//! ```text
//! <writepath>/
//! ├── rapid/      # Cached root and repository indices
//! ├── packages/   # Committed package indices (<md5>.sdp)
//! └── pool/       # Blobs by content digest
//! ```

pub mod cmd;

pub use rapid_core::USER_AGENT;
pub use rapid_core::paths::*;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rapid_core::{SyncConfig, TransferMode};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "rapid")]
#[command(author, version, about = "rapid - download packages from Rapid repositories")]
pub struct Cli {
    /// Destination root for the pool, package indices and caches [default: ~/.spring]
    #[arg(long, global = true, env = "RAPID_WRITEPATH")]
    pub writepath: Option<PathBuf>,

    /// URL of the root repository index
    #[arg(long, global = true, env = "PRD_RAPID_REPO_MASTER", default_value = DEFAULT_REPO_MASTER)]
    pub repo_master: String,

    /// Increase log output (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn,rapid_core=info,rapid_cli=info",
            1 => "info,rapid_core=debug,rapid_cli=debug",
            _ => "trace",
        }
    }

    /// The destination root, falling back to the user's home.
    pub fn writepath(&self) -> Result<PathBuf> {
        match &self.writepath {
            Some(path) => Ok(path.clone()),
            None => try_default_writepath()
                .context("Could not determine home directory; pass --writepath"),
        }
    }

    /// Base sync configuration from global options.
    pub fn sync_config(&self) -> Result<SyncConfig> {
        let mut config = SyncConfig::new(self.writepath()?);
        config.root_url.clone_from(&self.repo_master);
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Download packages and their dependencies
    Download {
        /// Packages to fetch (`repo:tag`, `rapid://repo:tag`, or a display name)
        #[arg(required = true)]
        specs: Vec<String>,

        /// Fetch blobs in one streamer request per package instead of one GET per blob
        #[arg(
            long,
            env = "PRD_RAPID_USE_STREAMER",
            default_value_t = true,
            action = clap::ArgAction::Set,
            value_parser = parse_switch
        )]
        streamer: bool,

        /// Do not follow package dependencies
        #[arg(long)]
        no_depends: bool,

        /// Concurrent transfers
        #[arg(short, long, default_value_t = 8)]
        jobs: usize,
    },

    /// List every package of every repository
    List {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Verify every blob in the pool
    Validate {
        /// Remove blobs that fail verification
        #[arg(long)]
        delete: bool,
    },

    /// Print the entries of a package index file
    DumpSdp {
        /// Path to a .sdp file
        file: PathBuf,
    },

    /// Check that every blob of a package index is present and valid; removes broken blobs
    ValidateSdp {
        /// Path to a .sdp file
        file: PathBuf,
    },
}

impl Commands {
    /// Apply download options to `config`.
    pub fn apply(&self, config: &mut SyncConfig) {
        if let Self::Download {
            streamer,
            no_depends,
            jobs,
            ..
        } = self
        {
            config.mode = if *streamer {
                TransferMode::Streamer
            } else {
                TransferMode::Direct
            };
            config.fetch_depends = !*no_depends;
            config.transfer_jobs = (*jobs).max(1);
        }
    }
}

/// Accepts the spellings users put in `PRD_RAPID_USE_STREAMER`.
///
/// ```
/// use rapid_cli::parse_switch;
///
/// assert_eq!(parse_switch("FALSE"), Ok(false));
/// assert_eq!(parse_switch("1"), Ok(true));
/// assert!(parse_switch("maybe").is_err());
/// ```
pub fn parse_switch(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("expected true or false, got '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_options_map_onto_config() {
        let cli = Cli::parse_from([
            "rapid",
            "--writepath",
            "/tmp/w",
            "--repo-master",
            "http://mirror/repos.gz",
            "download",
            "ba:stable",
            "--streamer",
            "false",
            "--no-depends",
            "-j",
            "3",
        ]);
        let mut config = cli.sync_config().unwrap();
        cli.command.apply(&mut config);

        assert_eq!(config.writepath, PathBuf::from("/tmp/w"));
        assert_eq!(config.root_url, "http://mirror/repos.gz");
        assert_eq!(config.mode, TransferMode::Direct);
        assert!(!config.fetch_depends);
        assert_eq!(config.transfer_jobs, 3);
    }

    #[test]
    fn streamer_is_default() {
        let cli = Cli::parse_from(["rapid", "--writepath", "/tmp/w", "download", "x"]);
        let mut config = cli.sync_config().unwrap();
        cli.command.apply(&mut config);
        assert_eq!(config.mode, TransferMode::Streamer);
        assert!(config.fetch_depends);
    }

    #[test]
    fn download_requires_a_package() {
        assert!(Cli::try_parse_from(["rapid", "download"]).is_err());
    }

    #[test]
    fn verbosity_raises_filter() {
        let quiet = Cli::parse_from(["rapid", "list"]);
        let loud = Cli::parse_from(["rapid", "-vv", "list"]);
        assert!(quiet.log_filter().starts_with("warn"));
        assert_eq!(loud.log_filter(), "trace");
    }
}
