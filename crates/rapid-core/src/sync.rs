//! Drives one invocation: resolve, materialize, commit.
//!
//! Package indices are written to their incomplete marker while blobs are
//! fetched and only promoted once every package of the closure has been
//! verified. If anything fails, no index of the closure is promoted.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use futures::stream;
use rapid_schema::{Md5Digest, PackageSpec};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::MetadataCache;
use crate::error::SyncError;
use crate::io::http::{Fetcher, RetryPolicy};
use crate::paths::{DEFAULT_REPO_MASTER, Layout};
use crate::resolver::{RemoteCatalog, ResolvedPackage, Resolver};
use crate::store::{ContentStore, promote};
use crate::transfer::{TransferEngine, TransferMode, TransferStats};

/// Everything a [`Syncer`] needs to know about its environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// URL of the root index (`repos.gz`).
    pub root_url: String,
    /// Destination root for caches, package indices and the pool.
    pub writepath: PathBuf,
    pub mode: TransferMode,
    /// Concurrent blob or streamer requests across all packages.
    pub transfer_jobs: usize,
    /// Packages materialized concurrently.
    pub package_jobs: usize,
    pub retry: RetryPolicy,
    /// Follow `depends` when resolving.
    pub fetch_depends: bool,
}

impl SyncConfig {
    /// Defaults against the public mirror, writing under `writepath`.
    pub fn new(writepath: impl Into<PathBuf>) -> Self {
        Self {
            root_url: DEFAULT_REPO_MASTER.to_string(),
            writepath: writepath.into(),
            mode: TransferMode::default(),
            transfer_jobs: 8,
            package_jobs: 4,
            retry: RetryPolicy::default(),
            fetch_depends: true,
        }
    }
}

/// Progress of one package through an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageState {
    Resolving,
    FetchingIndex,
    FetchingBlobs,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Resolving => "resolving",
            Self::FetchingIndex => "fetching-index",
            Self::FetchingBlobs => "fetching-blobs",
            Self::Committing => "committing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.pad(s)
    }
}

/// Per-package result of an invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PackageReport {
    pub tag: String,
    pub repository: String,
    pub digest: Md5Digest,
    /// Last state reached.
    pub state: PackageState,
    pub blobs_fetched: usize,
    /// Decompressed bytes committed to the pool.
    pub bytes_fetched: u64,
    /// Why the package ended `Failed`.
    pub error: Option<String>,
}

impl PackageReport {
    fn new(package: &ResolvedPackage) -> Self {
        Self {
            tag: package.descriptor.tag.clone(),
            repository: package.repository.clone(),
            digest: package.digest(),
            state: PackageState::Resolving,
            blobs_fetched: 0,
            bytes_fetched: 0,
            error: None,
        }
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.state = PackageState::Failed;
        self.error = Some(reason.into());
    }
}

/// Result of a whole invocation.
#[derive(Debug)]
pub struct SyncOutcome {
    /// One report per package of the closure, in resolution order.
    pub packages: Vec<PackageReport>,
    pub first_failure: Option<SyncError>,
}

impl SyncOutcome {
    /// True if nothing failed and every package is `Done`.
    pub fn is_success(&self) -> bool {
        self.first_failure.is_none() && self.packages.iter().all(|p| p.state == PackageState::Done)
    }

    /// Total blobs downloaded across all packages.
    pub fn blobs_fetched(&self) -> usize {
        self.packages.iter().map(|p| p.blobs_fetched).sum()
    }
}

enum Materialized {
    /// Blobs verified; the marker must be promoted.
    Ready,
    /// Already final and complete.
    Unchanged,
    /// Not started because another package failed first.
    Skipped,
    Failed(SyncError),
}

/// Runs invocations against one destination root.
///
/// The transfer engine and metadata cache are shared by every `sync` call.
#[derive(Debug, Clone)]
pub struct Syncer {
    config: SyncConfig,
    layout: Layout,
    cache: MetadataCache,
    engine: TransferEngine,
}

impl Syncer {
    /// Build the HTTP client and the components for `config`.
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let fetcher = Fetcher::new(config.retry.clone())?;
        let layout = Layout::new(&config.writepath);
        let cache = MetadataCache::new(layout.clone(), fetcher.clone());
        let engine = TransferEngine::new(
            ContentStore::new(layout.clone()),
            fetcher,
            config.mode,
            config.transfer_jobs,
        );
        Ok(Self {
            config,
            layout,
            cache,
            engine,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Synchronize `specs` and their dependencies.
    ///
    /// # Errors
    ///
    /// Fails before any transfer if the root index cannot be loaded or a
    /// specifier cannot be resolved. Failures after that point are reported
    /// in the returned [`SyncOutcome`].
    pub async fn sync(&self, specs: &[PackageSpec]) -> Result<SyncOutcome, SyncError> {
        let catalog = RemoteCatalog::load(self.cache.clone(), &self.config.root_url).await?;
        let resolved = Resolver::new(&catalog)
            .with_fetch_depends(self.config.fetch_depends)
            .resolve(specs)
            .await?;
        info!(packages = resolved.len(), "resolved");
        Ok(self.sync_resolved(resolved).await)
    }

    /// Materialize and commit an already resolved closure.
    pub async fn sync_resolved(&self, packages: Vec<ResolvedPackage>) -> SyncOutcome {
        let aborted = AtomicBool::new(false);

        let results: Vec<(PackageReport, Materialized)> = stream::iter(packages)
            .map(|package| {
                let aborted = &aborted;
                async move {
                    let mut report = PackageReport::new(&package);
                    if aborted.load(Ordering::SeqCst) {
                        report.fail("not started: another package failed");
                        return (report, Materialized::Skipped);
                    }
                    let result = self.materialize(&package, &mut report).await;
                    if matches!(result, Materialized::Failed(_)) {
                        aborted.store(true, Ordering::SeqCst);
                    }
                    (report, result)
                }
            })
            .buffered(self.config.package_jobs.max(1))
            .collect()
            .await;

        self.commit(results).await
    }

    async fn materialize(&self, package: &ResolvedPackage, report: &mut PackageReport) -> Materialized {
        match self.try_materialize(package, report).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tag = %report.tag, state = %report.state, error = %e, "package failed");
                report.fail(e.to_string());
                Materialized::Failed(e)
            }
        }
    }

    async fn try_materialize(
        &self,
        package: &ResolvedPackage,
        report: &mut PackageReport,
    ) -> Result<Materialized, SyncError> {
        let digest = package.digest();

        report.state = PackageState::FetchingIndex;
        debug!(tag = %report.tag, state = %report.state);
        let fetched = self.cache.fetch_package(&package.base_url, &digest).await?;
        let index = Arc::new(fetched.index);

        if fetched.from_final {
            let engine = self.engine.clone();
            let check = Arc::clone(&index);
            let missing = tokio::task::spawn_blocking(move || engine.missing_positions(&check)).await?;
            if missing.is_empty() {
                report.state = PackageState::Done;
                debug!(tag = %report.tag, "already complete");
                return Ok(Materialized::Unchanged);
            }
            warn!(tag = %report.tag, missing = missing.len(), "committed package lost blobs, demoting");
            let (from, to) = (self.layout.package_path(&digest), self.layout.incomplete_path(&digest));
            tokio::task::spawn_blocking(move || promote(&from, &to)).await??;
        }

        report.state = PackageState::FetchingBlobs;
        debug!(tag = %report.tag, state = %report.state);
        let stats: TransferStats = self
            .engine
            .fetch_missing(&package.base_url, &digest, &index)
            .await?;
        report.blobs_fetched = stats.blobs;
        report.bytes_fetched = stats.bytes;

        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.verify_all(&index)).await??;

        report.state = PackageState::Committing;
        debug!(tag = %report.tag, state = %report.state);
        Ok(Materialized::Ready)
    }

    async fn commit(&self, results: Vec<(PackageReport, Materialized)>) -> SyncOutcome {
        let mut committable = results
            .iter()
            .all(|(_, r)| matches!(r, Materialized::Ready | Materialized::Unchanged));
        let mut first_failure = None;
        let mut packages = Vec::with_capacity(results.len());
        // Positions in `packages` promoted by this call.
        let mut promoted = Vec::new();

        for (mut report, result) in results {
            match result {
                Materialized::Unchanged | Materialized::Skipped => {}
                Materialized::Failed(e) => {
                    first_failure.get_or_insert(e);
                }
                Materialized::Ready if !committable => {
                    report.fail("not committed: the package closure is incomplete");
                }
                Materialized::Ready => {
                    let from = self.layout.incomplete_path(&report.digest);
                    let to = self.layout.package_path(&report.digest);
                    match rename(from, to).await {
                        Ok(()) => {
                            report.state = PackageState::Done;
                            promoted.push(packages.len());
                            info!(
                                tag = %report.tag,
                                digest = %report.digest,
                                blobs = report.blobs_fetched,
                                "package complete"
                            );
                        }
                        Err(e) => {
                            report.fail(e.to_string());
                            first_failure.get_or_insert(e);
                            committable = false;
                            self.demote(&mut packages, &promoted).await;
                            promoted.clear();
                        }
                    }
                }
            }
            packages.push(report);
        }

        SyncOutcome {
            packages,
            first_failure,
        }
    }

    /// Move already promoted indices back to their markers.
    async fn demote(&self, packages: &mut [PackageReport], promoted: &[usize]) {
        for &pos in promoted {
            let report = &mut packages[pos];
            let from = self.layout.package_path(&report.digest);
            let to = self.layout.incomplete_path(&report.digest);
            match rename(from, to).await {
                Ok(()) => report.fail("rolled back: another package of the closure failed to commit"),
                Err(e) => warn!(tag = %report.tag, error = %e, "could not roll back committed package"),
            }
        }
    }
}

async fn rename(from: PathBuf, to: PathBuf) -> Result<(), SyncError> {
    tokio::task::spawn_blocking(move || promote(&from, &to)).await?
}
