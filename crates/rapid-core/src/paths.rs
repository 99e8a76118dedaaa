use dirs::home_dir;
use rapid_schema::Md5Digest;
use std::path::{Path, PathBuf};

/// Default root index location.
pub const DEFAULT_REPO_MASTER: &str = "https://repos.springrts.com/repos.gz";

/// Suffix of a package index whose blobs are still being fetched.
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";

/// Returns the default destination (`~/.spring`), or None if the user's home cannot be resolved.
pub fn try_default_writepath() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".spring"))
}

/// On-disk layout under a destination root.
///
/// ```text
/// <root>/rapid/<url-path>            cached root and repository indices
/// <root>/packages/<hex>.sdp          committed package index
/// <root>/packages/<hex>.sdp.incomplete
/// <root>/pool/<xx>/<rest>.gz         blobs
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pool_dir(&self) -> PathBuf {
        self.root.join("pool")
    }

    /// Pool path: pool/90/0150983cd24fb0d6963f7d28e17f72.gz
    pub fn blob_path(&self, digest: &Md5Digest) -> PathBuf {
        let (dir, rest) = digest.pool_split();
        self.pool_dir().join(dir).join(format!("{rest}.gz"))
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// Final package index path: packages/<hex>.sdp
    pub fn package_path(&self, digest: &Md5Digest) -> PathBuf {
        self.packages_dir().join(format!("{digest}.sdp"))
    }

    /// Incomplete marker path: packages/<hex>.sdp.incomplete
    pub fn incomplete_path(&self, digest: &Md5Digest) -> PathBuf {
        self.packages_dir()
            .join(format!("{digest}.sdp{INCOMPLETE_SUFFIX}"))
    }

    /// Local copy of a remote index file: rapid/<url-path>
    pub fn cache_path(&self, url: &str) -> PathBuf {
        self.root.join("rapid").join(url_to_path(url))
    }
}

/// Map a URL to a relative filesystem path.
///
/// The scheme is dropped, `:` becomes `-` and every non-empty segment other
/// than `.` or `..` becomes a path component.
pub fn url_to_path(url: &str) -> PathBuf {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let without_query = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    without_query
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .map(|seg| seg.replace(':', "-"))
        .collect()
}
