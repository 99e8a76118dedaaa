//! Error types shared by every stage of a sync.

use std::io;
use std::path::{Path, PathBuf};

use rapid_schema::CorruptionError;
use thiserror::Error;

/// Coarse classification of a [`SyncError`], used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// HTTP status or transport failure.
    Network,
    /// Malformed data or a digest mismatch.
    Corruption,
    /// A specifier or dependency could not be resolved.
    Resolution,
    /// Local filesystem failure.
    Io,
}

/// Why a package specifier could not be resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("unknown repository '{0}'")]
    UnknownRepository(String),

    #[error("no package matches '{0}'")]
    UnknownPackage(String),

    #[error("'{spec}' is ambiguous: {}", candidates.join(", "))]
    Ambiguous { spec: String, candidates: Vec<String> },

    #[error("package '{package}' depends on '{dependency}', which cannot be resolved")]
    MissingDependency { package: String, dependency: String },
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} asked to retry after {seconds}s")]
    RetryAfterTooLong { url: String, seconds: u64 },

    #[error("{resource} is corrupt: {source}")]
    Corruption {
        resource: String,
        #[source]
        source: CorruptionError,
    },

    #[error("integrity check failed for {resource}: expected {expected}, got {actual}")]
    Integrity {
        resource: String,
        expected: String,
        actual: String,
    },

    #[error("protocol error from {resource}: {reason}")]
    Protocol { resource: String, reason: String },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("background task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn corruption(resource: impl Into<String>, source: CorruptionError) -> Self {
        Self::Corruption {
            resource: resource.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http { .. } | Self::Transport { .. } | Self::RetryAfterTooLong { .. } => {
                ErrorKind::Network
            }
            Self::Corruption { .. } | Self::Integrity { .. } | Self::Protocol { .. } => {
                ErrorKind::Corruption
            }
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::Io { .. } | Self::Task(_) => ErrorKind::Io,
        }
    }

    /// Whether retrying the same request might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => is_transient_status(*status),
            Self::Transport { source, .. } => {
                source.is_connect() || source.is_timeout() || source.is_body()
            }
            _ => false,
        }
    }

    /// The URL, path or specifier that failed.
    pub fn resource(&self) -> String {
        match self {
            Self::Http { url, .. }
            | Self::Transport { url, .. }
            | Self::RetryAfterTooLong { url, .. } => url.clone(),
            Self::Corruption { resource, .. }
            | Self::Integrity { resource, .. }
            | Self::Protocol { resource, .. } => resource.clone(),
            Self::Resolution(err) => match err {
                ResolutionError::UnknownRepository(s) | ResolutionError::UnknownPackage(s) => {
                    s.clone()
                }
                ResolutionError::Ambiguous { spec, .. } => spec.clone(),
                ResolutionError::MissingDependency { dependency, .. } => dependency.clone(),
            },
            Self::Io { path, .. } => path.display().to_string(),
            Self::Task(msg) => msg.clone(),
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

/// Statuses worth retrying: any 5xx, plus 429 rate limiting.
pub fn is_transient_status(status: u16) -> bool {
    (500..600).contains(&status) || status == 429
}
