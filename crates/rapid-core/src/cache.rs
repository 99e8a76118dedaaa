//! Local copies of root, repository and package indices.
//!
//! Text indices are revalidated with a conditional GET on every call; a local
//! copy that no longer decodes is never offered as an `If-None-Match`
//! candidate. Package indices are content addressed and reused without any
//! network access once a local copy re-digests to its address.

use std::path::{Path, PathBuf};

use rapid_schema::codec::{decode_package, decode_repository, decode_root, gunzip};
use rapid_schema::{CorruptionError, ETag, Md5Digest, PackageIndex, RepositoryIndex, RootIndex};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::io::http::{Fetched, Fetcher};
use crate::paths::Layout;
use crate::store::write_atomic;

/// A package index and where it was found.
#[derive(Debug, Clone)]
pub struct PackageFetch {
    pub index: PackageIndex,
    /// True if the index was already at its final path.
    pub from_final: bool,
}

/// Local copies of the root, repository and package indices, kept fresh over HTTP.
#[derive(Debug, Clone)]
pub struct MetadataCache {
    layout: Layout,
    fetcher: Fetcher,
}

/// `base` and `path` joined with exactly one slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

impl MetadataCache {
    pub fn new(layout: Layout, fetcher: Fetcher) -> Self {
        Self { layout, fetcher }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Fetch `repos.gz` from `url`.
    pub async fn fetch_root(&self, url: &str) -> Result<RootIndex, SyncError> {
        self.fetch_text_index(url, decode_root).await
    }

    /// Fetch `{base_url}/versions.gz`.
    pub async fn fetch_repository(&self, base_url: &str) -> Result<RepositoryIndex, SyncError> {
        self.fetch_text_index(&join_url(base_url, "versions.gz"), decode_repository)
            .await
    }

    async fn fetch_text_index<T>(
        &self,
        url: &str,
        decode: fn(&[u8]) -> Result<T, CorruptionError>,
    ) -> Result<T, SyncError> {
        let local_path = self.layout.cache_path(url);
        let local = match tokio::fs::read(&local_path).await {
            Ok(bytes) => match gunzip(&bytes).and_then(|raw| decode(&raw)) {
                Ok(index) => Some((index, ETag::of(&bytes))),
                Err(e) => {
                    warn!(path = %local_path.display(), error = %e, "discarding corrupt cached index");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(SyncError::io(&local_path, e)),
        };

        let etag = local.as_ref().map(|(_, tag)| tag);
        match self.fetcher.get_conditional(url, etag).await? {
            Fetched::NotModified => match local {
                Some((index, _)) => {
                    debug!(url, "index not modified");
                    Ok(index)
                }
                None => Err(SyncError::Protocol {
                    resource: url.to_string(),
                    reason: "304 Not Modified without a cached copy".into(),
                }),
            },
            Fetched::Modified { body } => {
                let index = gunzip(&body)
                    .and_then(|raw| decode(&raw))
                    .map_err(|e| SyncError::corruption(url, e))?;
                write_blocking(local_path, body.to_vec()).await?;
                debug!(url, "index updated");
                Ok(index)
            }
        }
    }

    /// Load a package index, from disk if a valid copy exists, else from
    /// `{base_url}/packages/{hex}.sdp` into the incomplete marker.
    pub async fn fetch_package(
        &self,
        base_url: &str,
        digest: &Md5Digest,
    ) -> Result<PackageFetch, SyncError> {
        let candidates = [
            (self.layout.package_path(digest), true),
            (self.layout.incomplete_path(digest), false),
        ];
        for (path, from_final) in candidates {
            if let Some(index) = load_if_valid(&path, digest).await {
                debug!(%digest, path = %path.display(), "package index cached");
                return Ok(PackageFetch { index, from_final });
            }
        }

        let url = join_url(base_url, &format!("packages/{digest}.sdp"));
        let body = self.fetcher.get(&url).await?;
        let index = gunzip(&body)
            .and_then(|raw| decode_package(&raw))
            .map_err(|e| SyncError::corruption(&url, e))?;
        let actual = index.digest();
        if actual != *digest {
            return Err(SyncError::Integrity {
                resource: url,
                expected: digest.to_hex(),
                actual: actual.to_hex(),
            });
        }

        write_blocking(self.layout.incomplete_path(digest), body.to_vec()).await?;
        Ok(PackageFetch {
            index,
            from_final: false,
        })
    }
}

/// Read and decode a gzip package index file.
pub fn read_package_file(path: &Path) -> Result<PackageIndex, SyncError> {
    let bytes = std::fs::read(path).map_err(|e| SyncError::io(path, e))?;
    gunzip(&bytes)
        .and_then(|raw| decode_package(&raw))
        .map_err(|e| SyncError::corruption(path.display().to_string(), e))
}

async fn load_if_valid(path: &Path, digest: &Md5Digest) -> Option<PackageIndex> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let index = gunzip(&bytes).and_then(|raw| decode_package(&raw));
    match index {
        Ok(index) if index.digest() == *digest => Some(index),
        Ok(_) | Err(_) => {
            warn!(path = %path.display(), "ignoring invalid cached package index");
            None
        }
    }
}

async fn write_blocking(path: PathBuf, bytes: Vec<u8>) -> Result<(), SyncError> {
    tokio::task::spawn_blocking(move || write_atomic(&path, &bytes)).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::http::RetryPolicy;
    use mockito::Matcher;
    use rapid_schema::codec::{encode_package, encode_repository, gzip};
    use rapid_schema::{BlobEntry, PackageDescriptor};
    use tempfile::tempdir;

    fn cache(root: &Path) -> MetadataCache {
        let fetcher = Fetcher::new(RetryPolicy::immediate(1)).unwrap();
        MetadataCache::new(Layout::new(root), fetcher)
    }

    fn repository() -> RepositoryIndex {
        let mut repo = RepositoryIndex::new();
        repo.insert(PackageDescriptor {
            tag: "r:1".into(),
            digest: Md5Digest::compute(b"pkg"),
            depends: vec![],
            display_name: "Game 1".into(),
        })
        .unwrap();
        repo
    }

    fn package() -> PackageIndex {
        PackageIndex::new(vec![BlobEntry {
            filename: "modinfo.lua".into(),
            content_md5: Md5Digest::compute(b"return {}"),
            crc32: crc32fast::hash(b"return {}"),
            size: 9,
        }])
        .unwrap()
    }

    #[tokio::test]
    async fn repository_is_cached_and_revalidated() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        let mut server = mockito::Server::new_async().await;
        let body = gzip(&encode_repository(&repository())).unwrap();

        let first = server
            .mock("GET", "/r/versions.gz")
            .match_header("if-none-match", Matcher::Missing)
            .with_status(200)
            .with_body(body.clone())
            .expect(1)
            .create_async()
            .await;
        let revalidate = server
            .mock("GET", "/r/versions.gz")
            .match_header("if-none-match", ETag::of(&body).as_str())
            .with_status(304)
            .expect(1)
            .create_async()
            .await;

        let base = format!("{}/r", server.url());
        assert_eq!(cache.fetch_repository(&base).await.unwrap(), repository());
        assert_eq!(cache.fetch_repository(&base).await.unwrap(), repository());

        first.assert_async().await;
        revalidate.assert_async().await;
    }

    #[tokio::test]
    async fn corrupt_local_copy_is_not_offered() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        let mut server = mockito::Server::new_async().await;
        let base = format!("{}/r", server.url());
        let body = gzip(&encode_repository(&repository())).unwrap();

        let local = cache.layout().cache_path(&join_url(&base, "versions.gz"));
        std::fs::create_dir_all(local.parent().unwrap()).unwrap();
        std::fs::write(&local, b"garbage").unwrap();

        let unconditional = server
            .mock("GET", "/r/versions.gz")
            .match_header("if-none-match", Matcher::Missing)
            .with_status(200)
            .with_body(body.clone())
            .expect(1)
            .create_async()
            .await;

        assert_eq!(cache.fetch_repository(&base).await.unwrap(), repository());
        assert_eq!(std::fs::read(&local).unwrap(), body);
        unconditional.assert_async().await;
    }

    #[tokio::test]
    async fn corrupt_response_is_fatal() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos.gz")
            .with_status(200)
            .with_body(gzip(b"only-a-name\n").unwrap())
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/repos.gz", server.url());
        let err = cache.fetch_root(&url).await.unwrap_err();
        assert!(matches!(err, SyncError::Corruption { .. }));
        assert!(!cache.layout().cache_path(&url).exists());
    }

    #[tokio::test]
    async fn package_index_goes_to_marker_and_is_reused() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        let mut server = mockito::Server::new_async().await;
        let index = package();
        let digest = index.digest();

        let remote = server
            .mock("GET", format!("/r/packages/{digest}.sdp").as_str())
            .with_status(200)
            .with_body(gzip(&encode_package(&index)).unwrap())
            .expect(1)
            .create_async()
            .await;

        let base = format!("{}/r", server.url());
        let fetched = cache.fetch_package(&base, &digest).await.unwrap();
        assert_eq!(fetched.index, index);
        assert!(!fetched.from_final);
        assert!(cache.layout().incomplete_path(&digest).exists());
        assert!(!cache.layout().package_path(&digest).exists());

        let again = cache.fetch_package(&base, &digest).await.unwrap();
        assert_eq!(again.index, index);
        remote.assert_async().await;

        crate::store::promote(
            &cache.layout().incomplete_path(&digest),
            &cache.layout().package_path(&digest),
        )
        .unwrap();
        assert!(cache.fetch_package(&base, &digest).await.unwrap().from_final);
    }

    #[tokio::test]
    async fn package_digest_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        let mut server = mockito::Server::new_async().await;
        let wanted = Md5Digest::compute(b"some other package");

        server
            .mock("GET", format!("/r/packages/{wanted}.sdp").as_str())
            .with_status(200)
            .with_body(gzip(&encode_package(&package())).unwrap())
            .create_async()
            .await;

        let err = cache
            .fetch_package(&format!("{}/r", server.url()), &wanted)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Integrity { .. }));
        assert!(!cache.layout().incomplete_path(&wanted).exists());
    }

    #[test]
    fn read_package_file_decodes_gzip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.sdp");
        std::fs::write(&path, gzip(&encode_package(&package())).unwrap()).unwrap();
        assert_eq!(read_package_file(&path).unwrap(), package());

        std::fs::write(&path, b"junk").unwrap();
        assert!(matches!(
            read_package_file(&path),
            Err(SyncError::Corruption { .. })
        ));
    }
}
