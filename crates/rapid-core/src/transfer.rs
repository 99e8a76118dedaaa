//! Blob transfer: direct per-blob GETs or one streamer POST per package.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use rapid_schema::codec::{decode_length_prefixed_stream, encode_bitmask, gzip};
use rapid_schema::{BlobEntry, Md5Digest, PackageIndex};
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tracing::debug;

use crate::cache::join_url;
use crate::error::SyncError;
use crate::io::http::Fetcher;
use crate::store::{CommitReceipt, ContentStore};

/// How missing blobs are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// One GET per blob from `pool/`.
    Direct,
    /// One POST to `streamer.cgi` per package.
    #[default]
    Streamer,
}

/// Work done by one [`TransferEngine::fetch_missing`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Blobs downloaded and committed.
    pub blobs: usize,
    /// Decompressed bytes committed.
    pub bytes: u64,
}

impl TransferStats {
    fn add(&mut self, receipt: &CommitReceipt) {
        self.blobs += 1;
        self.bytes += receipt.size;
    }
}

type InFlight = Arc<Mutex<HashMap<Md5Digest, Arc<tokio::sync::Mutex<()>>>>>;

/// Fetches the blobs a package index needs and commits them to the store.
///
/// Cloning is cheap; clones share the transfer semaphore and the in-flight table.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    store: ContentStore,
    fetcher: Fetcher,
    mode: TransferMode,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
}

impl TransferEngine {
    /// `concurrency` bounds requests in flight across all packages.
    pub fn new(store: ContentStore, fetcher: Fetcher, mode: TransferMode, concurrency: usize) -> Self {
        Self {
            store,
            fetcher,
            mode,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            in_flight: Arc::default(),
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Positions in `index` whose blob is not valid in the store.
    ///
    /// Only the first position of each digest is reported. Blocking.
    pub fn missing_positions(&self, index: &PackageIndex) -> Vec<usize> {
        let mut seen = HashSet::new();
        index
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, entry)| seen.insert(entry.content_md5))
            .filter(|(_, entry)| !self.store.has_valid(&entry.content_md5))
            .map(|(pos, _)| pos)
            .collect()
    }

    /// Re-check every blob of `index`. Blocking.
    pub fn verify_all(&self, index: &PackageIndex) -> Result<(), SyncError> {
        match self.missing_positions(index).first().and_then(|&pos| index.get(pos)) {
            None => Ok(()),
            Some(entry) => Err(SyncError::Integrity {
                resource: self.store.path_for(&entry.content_md5).display().to_string(),
                expected: entry.content_md5.to_hex(),
                actual: "missing or corrupt blob".into(),
            }),
        }
    }

    /// Download and commit every blob of `index` not already in the store.
    pub async fn fetch_missing(
        &self,
        base_url: &str,
        package: &Md5Digest,
        index: &Arc<PackageIndex>,
    ) -> Result<TransferStats, SyncError> {
        let missing = {
            let engine = self.clone();
            let index = Arc::clone(index);
            tokio::task::spawn_blocking(move || engine.missing_positions(&index)).await?
        };
        debug!(%package, total = index.len(), missing = missing.len(), mode = ?self.mode, "blob scan");
        if missing.is_empty() {
            return Ok(TransferStats::default());
        }

        match self.mode {
            TransferMode::Direct => self.fetch_direct(base_url, index, missing).await,
            TransferMode::Streamer => self.fetch_streamed(base_url, package, index, missing).await,
        }
    }

    async fn fetch_direct(
        &self,
        base_url: &str,
        index: &Arc<PackageIndex>,
        positions: Vec<usize>,
    ) -> Result<TransferStats, SyncError> {
        let mut handles = Vec::with_capacity(positions.len());
        for pos in positions {
            let engine = self.clone();
            let index = Arc::clone(index);
            let base = base_url.to_string();
            handles.push(tokio::spawn(async move { engine.fetch_blob(&base, &index, pos).await }));
        }

        // Drain every task so no commit is still running when we return.
        let mut stats = TransferStats::default();
        let mut first_error = None;
        for handle in handles {
            match handle.await? {
                Ok(Some(receipt)) => stats.add(&receipt),
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(stats), Err)
    }

    async fn fetch_blob(
        &self,
        base_url: &str,
        index: &PackageIndex,
        pos: usize,
    ) -> Result<Option<CommitReceipt>, SyncError> {
        let Some(entry) = index.get(pos).cloned() else {
            return Ok(None);
        };
        let digest = entry.content_md5;

        let _guard = self.lock_digest(digest).await;
        let store = self.store.clone();
        if tokio::task::spawn_blocking(move || store.has_valid(&digest)).await? {
            debug!(%digest, "blob committed by another task");
            return Ok(None);
        }

        let (dir, rest) = digest.pool_split();
        let url = join_url(base_url, &format!("pool/{dir}/{rest}.gz"));
        let body = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| SyncError::Task(e.to_string()))?;
            self.fetcher.get(&url).await?
        };

        let store = self.store.clone();
        let receipt =
            tokio::task::spawn_blocking(move || commit_checked(&store, &entry, &body)).await??;
        debug!(%digest, size = receipt.size, "blob committed");
        Ok(Some(receipt))
    }

    async fn fetch_streamed(
        &self,
        base_url: &str,
        package: &Md5Digest,
        index: &Arc<PackageIndex>,
        positions: Vec<usize>,
    ) -> Result<TransferStats, SyncError> {
        let url = join_url(base_url, &format!("streamer.cgi?{package}"));
        let request = gzip(&encode_bitmask(positions.iter().copied(), index.len()))
            .map_err(|e| SyncError::io(Path::new(&url), e))?;

        let body = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| SyncError::Task(e.to_string()))?;
            debug!(%package, requested = positions.len(), "streamer request");
            self.fetcher.post(&url, request).await?
        };

        let store = self.store.clone();
        let index = Arc::clone(index);
        tokio::task::spawn_blocking(move || commit_stream(&store, &url, &index, &positions, &body))
            .await?
    }

    async fn lock_digest(&self, digest: Md5Digest) -> DigestLock {
        let slot = {
            let mut table = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(digest).or_default())
        };
        DigestLock {
            digest,
            table: Arc::clone(&self.in_flight),
            guard: Some(slot.lock_owned().await),
        }
    }
}

/// Exclusive claim on one digest. The table slot is dropped with the last claimant.
struct DigestLock {
    digest: Md5Digest,
    table: InFlight,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DigestLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters clone the slot under the table lock, so a count of one means nobody is queued.
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table
            .get(&self.digest)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            table.remove(&self.digest);
        }
    }
}

fn commit_stream(
    store: &ContentStore,
    url: &str,
    index: &PackageIndex,
    positions: &[usize],
    body: &Bytes,
) -> Result<TransferStats, SyncError> {
    let records =
        decode_length_prefixed_stream(body).map_err(|e| SyncError::corruption(url, e))?;
    if records.len() != positions.len() {
        return Err(SyncError::Protocol {
            resource: url.to_string(),
            reason: format!("requested {} blobs, received {}", positions.len(), records.len()),
        });
    }

    let mut stats = TransferStats::default();
    for (&pos, record) in positions.iter().zip(records) {
        let Some(entry) = index.get(pos) else {
            continue;
        };
        let receipt = commit_checked(store, entry, record)?;
        stats.add(&receipt);
    }
    Ok(stats)
}

/// Commit a blob and cross-check its size and CRC-32 against the index entry.
fn commit_checked(
    store: &ContentStore,
    entry: &BlobEntry,
    compressed: &[u8],
) -> Result<CommitReceipt, SyncError> {
    let receipt = store.commit(&entry.content_md5, compressed)?;
    if receipt.size != u64::from(entry.size) || receipt.crc32 != entry.crc32 {
        return Err(SyncError::Integrity {
            resource: entry.filename.clone(),
            expected: format!("size {} crc32 {:08x}", entry.size, entry.crc32),
            actual: format!("size {} crc32 {:08x}", receipt.size, receipt.crc32),
        });
    }
    Ok(receipt)
}
