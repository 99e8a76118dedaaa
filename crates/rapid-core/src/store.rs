//! Content-addressed blob pool.
//!
//! Blobs are stored gzip-compressed exactly as the server sent them, under
//! the MD5 of their decompressed bytes. Every write goes through a temp file
//! in the destination directory followed by a rename, so readers only ever
//! see complete files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rapid_schema::{BlobEntry, Md5Digest, PackageIndex};
use rapid_schema::codec::gunzip;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::paths::Layout;

/// What a successful [`ContentStore::commit`] verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Decompressed size in bytes.
    pub size: u64,
    /// CRC-32 of the decompressed bytes.
    pub crc32: u32,
    /// False if a valid copy was already present and nothing was written.
    pub written: bool,
}

/// Result of a full pool scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolReport {
    /// Pool files whose name is a digest.
    pub checked: usize,
    /// Files that failed verification.
    pub broken: Vec<PathBuf>,
    /// How many of `broken` were removed.
    pub deleted: usize,
}

impl PoolReport {
    /// True if nothing failed verification.
    pub fn is_clean(&self) -> bool {
        self.broken.is_empty()
    }
}

/// The `pool/` tree under a [`Layout`].
#[derive(Debug, Clone)]
pub struct ContentStore {
    layout: Layout,
}

impl ContentStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Pool path of `digest`: `pool/xx/rest.gz`.
    pub fn path_for(&self, digest: &Md5Digest) -> PathBuf {
        self.layout.blob_path(digest)
    }

    /// True if the blob exists and decompresses to bytes hashing to `digest`.
    ///
    /// The file is re-read and re-hashed on every call.
    pub fn has_valid(&self, digest: &Md5Digest) -> bool {
        verify_blob(&self.path_for(digest), digest)
    }

    /// Verify `compressed` against `digest` and store it.
    ///
    /// Nothing is written if verification fails or a valid copy already exists.
    pub fn commit(
        &self,
        digest: &Md5Digest,
        compressed: &[u8],
    ) -> Result<CommitReceipt, SyncError> {
        let path = self.path_for(digest);
        let resource = path.display().to_string();

        let content = gunzip(compressed).map_err(|e| SyncError::corruption(&resource, e))?;
        let actual = Md5Digest::compute(&content);
        if actual != *digest {
            return Err(SyncError::Integrity {
                resource,
                expected: digest.to_hex(),
                actual: actual.to_hex(),
            });
        }

        let receipt = CommitReceipt {
            size: content.len() as u64,
            crc32: crc32fast::hash(&content),
            written: false,
        };

        if verify_blob(&path, digest) {
            debug!(%digest, "blob already present");
            return Ok(receipt);
        }

        write_atomic(&path, compressed)?;
        Ok(CommitReceipt {
            written: true,
            ..receipt
        })
    }

    /// Re-verify every blob under `pool/`.
    ///
    /// Files whose names are not a pool address (temp files, strays) are skipped.
    pub fn validate_pool(&self, delete_broken: bool) -> Result<PoolReport, SyncError> {
        let pool = self.layout.pool_dir();
        let mut report = PoolReport::default();
        if !pool.exists() {
            return Ok(report);
        }

        for entry in WalkDir::new(&pool).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| {
                let path = e.path().map_or_else(|| pool.clone(), Path::to_path_buf);
                SyncError::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(digest) = digest_from_pool_path(entry.path()) else {
                continue;
            };

            report.checked += 1;
            if verify_blob(entry.path(), &digest) {
                continue;
            }

            warn!(path = %entry.path().display(), "broken blob");
            if delete_broken {
                fs::remove_file(entry.path()).map_err(|e| SyncError::io(entry.path(), e))?;
                report.deleted += 1;
            }
            report.broken.push(entry.path().to_path_buf());
        }

        Ok(report)
    }

    /// Entries of `index` whose blob is missing or corrupt, optionally
    /// removing the corrupt files.
    pub fn check_package(
        &self,
        index: &PackageIndex,
        delete_broken: bool,
    ) -> Result<Vec<BlobEntry>, SyncError> {
        let mut broken = Vec::new();
        for entry in index.entries() {
            if self.has_valid(&entry.content_md5) {
                continue;
            }
            if delete_broken {
                remove_if_exists(&self.path_for(&entry.content_md5))?;
            }
            broken.push(entry.clone());
        }
        Ok(broken)
    }
}

fn verify_blob(path: &Path, digest: &Md5Digest) -> bool {
    let Ok(compressed) = fs::read(path) else {
        return false;
    };
    gunzip(&compressed).is_ok_and(|content| Md5Digest::compute(&content) == *digest)
}

/// Recover the digest from `pool/xx/<30 hex>.gz`.
fn digest_from_pool_path(path: &Path) -> Option<Md5Digest> {
    let dir = path.parent()?.file_name()?.to_str()?;
    let rest = path.file_name()?.to_str()?.strip_suffix(".gz")?;
    if dir.len() != 2 || rest.len() != 30 {
        return None;
    }
    Md5Digest::from_hex(&format!("{dir}{rest}")).ok()
}

/// Durably replace `path` with `bytes`: temp sibling, write, fsync, rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SyncError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| SyncError::io(parent, e))?;
    tmp.write_all(bytes).map_err(|e| SyncError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| SyncError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| SyncError::io(path, e.error))?;
    Ok(())
}

/// Atomically move `from` to `to`, replacing any existing file.
pub fn promote(from: &Path, to: &Path) -> Result<(), SyncError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
    }
    fs::rename(from, to).map_err(|e| SyncError::io(from, e))
}

/// Remove a file if present.
pub fn remove_if_exists(path: &Path) -> Result<(), SyncError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::io(path, e)),
    }
}
