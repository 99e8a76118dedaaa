use async_trait::async_trait;
use futures::future::try_join_all;
use rapid_schema::{Md5Digest, PackageDescriptor, PackageSpec, RepositoryIndex, RootIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cache::MetadataCache;
use crate::error::{ResolutionError, SyncError};

/// Source of repository indices for the resolver.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// Every repository name, sorted.
    fn repository_names(&self) -> Vec<String>;

    /// Base URL of a repository, or None if it is unknown.
    fn base_url(&self, repository: &str) -> Option<String>;

    /// Load a repository index.
    async fn repository(&self, name: &str) -> Result<Arc<RepositoryIndex>, SyncError>;

    /// Load every repository index concurrently, in name order.
    async fn all_repositories(&self) -> Result<Vec<(String, Arc<RepositoryIndex>)>, SyncError> {
        let names = self.repository_names();
        try_join_all(names.into_iter().map(|name| async move {
            let index = self.repository(&name).await?;
            Ok::<_, SyncError>((name, index))
        }))
        .await
    }
}

/// Repositories from a root index, each fetched through the metadata cache
/// on first use and at most once.
#[derive(Debug)]
pub struct RemoteCatalog {
    cache: MetadataCache,
    root: RootIndex,
    loaded: HashMap<String, OnceCell<Arc<RepositoryIndex>>>,
}

impl RemoteCatalog {
    pub fn new(cache: MetadataCache, root: RootIndex) -> Self {
        let loaded = root.names().map(|n| (n.to_string(), OnceCell::new())).collect();
        Self {
            cache,
            root,
            loaded,
        }
    }

    /// Fetch the root index from `root_url` and wrap it.
    pub async fn load(cache: MetadataCache, root_url: &str) -> Result<Self, SyncError> {
        let root = cache.fetch_root(root_url).await?;
        debug!(repositories = root.len(), "root index loaded");
        Ok(Self::new(cache, root))
    }

    pub fn root(&self) -> &RootIndex {
        &self.root
    }
}

#[async_trait]
impl RepositoryProvider for RemoteCatalog {
    fn repository_names(&self) -> Vec<String> {
        self.root.names().map(str::to_string).collect()
    }

    fn base_url(&self, repository: &str) -> Option<String> {
        self.root.base_url(repository).map(str::to_string)
    }

    async fn repository(&self, name: &str) -> Result<Arc<RepositoryIndex>, SyncError> {
        let (Some(cell), Some(base)) = (self.loaded.get(name), self.root.base_url(name)) else {
            return Err(ResolutionError::UnknownRepository(name.to_string()).into());
        };
        let index = cell
            .get_or_try_init(|| async {
                let index = self.cache.fetch_repository(base).await?;
                debug!(repository = name, packages = index.len(), "repository index loaded");
                Ok::<_, SyncError>(Arc::new(index))
            })
            .await?;
        Ok(Arc::clone(index))
    }
}

/// A package selected for synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub repository: String,
    pub base_url: String,
    pub descriptor: PackageDescriptor,
}

impl ResolvedPackage {
    /// Identity digest of the package index.
    pub fn digest(&self) -> Md5Digest {
        self.descriptor.digest
    }
}

/// Expands specifiers into their transitive dependency closure.
#[derive(Debug)]
pub struct Resolver<'a, P: RepositoryProvider> {
    provider: &'a P,
    fetch_depends: bool,
}

impl<'a, P: RepositoryProvider> Resolver<'a, P> {
    pub fn new(provider: &'a P) -> Self {
        Self {
            provider,
            fetch_depends: true,
        }
    }

    /// Skip `depends` and resolve only the named packages.
    pub fn with_fetch_depends(mut self, fetch_depends: bool) -> Self {
        self.fetch_depends = fetch_depends;
        self
    }

    /// Resolve `specs` breadth first.
    ///
    /// Requested packages come first, then their dependencies level by
    /// level. Each digest appears once; cycles and diamonds collapse.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolutionError`] for an unknown package, repository or
    /// dependency, or any error from loading a repository index.
    pub async fn resolve(&self, specs: &[PackageSpec]) -> Result<Vec<ResolvedPackage>, SyncError> {
        let mut queue: VecDeque<(PackageSpec, Option<String>)> =
            specs.iter().cloned().map(|s| (s, None)).collect();
        let mut visited: HashSet<Md5Digest> = HashSet::new();
        let mut resolved = Vec::new();

        while let Some((spec, parent)) = queue.pop_front() {
            let package = match (self.lookup(&spec).await, parent) {
                (Ok(package), _) => package,
                (
                    Err(SyncError::Resolution(
                        ResolutionError::UnknownPackage(_) | ResolutionError::UnknownRepository(_),
                    )),
                    Some(parent),
                ) => {
                    return Err(ResolutionError::MissingDependency {
                        package: parent,
                        dependency: spec.to_string(),
                    }
                    .into());
                }
                (Err(e), _) => return Err(e),
            };

            if !visited.insert(package.digest()) {
                continue;
            }
            debug!(tag = %package.descriptor.tag, digest = %package.digest(), "resolved");

            if self.fetch_depends {
                for dep in &package.descriptor.depends {
                    queue.push_back((PackageSpec::parse(dep), Some(package.descriptor.tag.clone())));
                }
            }
            resolved.push(package);
        }

        Ok(resolved)
    }

    async fn lookup(&self, spec: &PackageSpec) -> Result<ResolvedPackage, SyncError> {
        match spec {
            PackageSpec::Tagged { repository, .. } => {
                let Some(base_url) = self.provider.base_url(repository) else {
                    // Display names may contain a colon.
                    return self
                        .lookup_by_name(&spec.to_string())
                        .await
                        .map_err(|e| match e {
                            SyncError::Resolution(ResolutionError::UnknownPackage(_)) => {
                                ResolutionError::UnknownRepository(repository.clone()).into()
                            }
                            other => other,
                        });
                };
                let index = self.provider.repository(repository).await?;
                spec.tag_keys()
                    .iter()
                    .find_map(|key| index.get(key))
                    .map(|descriptor| ResolvedPackage {
                        repository: repository.clone(),
                        base_url,
                        descriptor: descriptor.clone(),
                    })
                    .ok_or_else(|| ResolutionError::UnknownPackage(spec.to_string()).into())
            }
            PackageSpec::Name(name) => self.lookup_by_name(name).await,
        }
    }

    async fn lookup_by_name(&self, name: &str) -> Result<ResolvedPackage, SyncError> {
        let repositories = self.provider.all_repositories().await?;
        let matches: Vec<(&str, &PackageDescriptor)> = repositories
            .iter()
            .flat_map(|(repo, index)| index.find_by_name(name).map(move |d| (repo.as_str(), d)))
            .collect();

        let Some(&(repository, descriptor)) = matches.first() else {
            return Err(ResolutionError::UnknownPackage(name.to_string()).into());
        };
        if matches.iter().any(|(_, d)| d.digest != descriptor.digest) {
            return Err(ResolutionError::Ambiguous {
                spec: name.to_string(),
                candidates: matches.iter().map(|(_, d)| d.tag.clone()).collect(),
            }
            .into());
        }

        let base_url = self
            .provider
            .base_url(repository)
            .ok_or_else(|| ResolutionError::UnknownRepository(repository.to_string()))?;
        Ok(ResolvedPackage {
            repository: repository.to_string(),
            base_url,
            descriptor: descriptor.clone(),
        })
    }
}
