//! Shared fixtures: a mockito server laid out like a Rapid mirror.

#![allow(dead_code)]

use mockito::{Matcher, Mock, ServerGuard};
use rapid_core::io::http::RetryPolicy;
use rapid_core::{Layout, SyncConfig, TransferMode};
use rapid_schema::codec::{
    encode_bitmask, encode_length_prefixed_stream, encode_package, encode_repository, encode_root,
    gzip,
};
use rapid_schema::{BlobEntry, Md5Digest, PackageDescriptor, PackageIndex, RepositoryIndex, RootIndex};
use tempfile::TempDir;

/// A package as the fixture publishes it.
#[derive(Debug, Clone)]
pub struct TestPackage {
    pub tag: String,
    pub name: String,
    pub depends: Vec<String>,
    pub files: Vec<(String, Vec<u8>)>,
}

impl TestPackage {
    pub fn new(tag: &str, files: &[(&str, &str)]) -> Self {
        Self {
            tag: tag.to_string(),
            name: format!("{tag} display"),
            depends: Vec::new(),
            files: files
                .iter()
                .map(|(n, c)| ((*n).to_string(), c.as_bytes().to_vec()))
                .collect(),
        }
    }

    pub fn depends_on(mut self, spec: &str) -> Self {
        self.depends.push(spec.to_string());
        self
    }

    pub fn index(&self) -> PackageIndex {
        PackageIndex::new(
            self.files
                .iter()
                .map(|(name, content)| BlobEntry {
                    filename: name.clone(),
                    content_md5: Md5Digest::compute(content),
                    crc32: crc32fast::hash(content),
                    size: content.len() as u32,
                })
                .collect(),
        )
        .unwrap()
    }

    pub fn digest(&self) -> Md5Digest {
        self.index().digest()
    }

    pub fn descriptor(&self) -> PackageDescriptor {
        PackageDescriptor {
            tag: self.tag.clone(),
            digest: self.digest(),
            depends: self.depends.clone(),
            display_name: self.name.clone(),
        }
    }

    /// File contents in index order.
    pub fn sorted_contents(&self) -> Vec<Vec<u8>> {
        let mut files = self.files.clone();
        files.sort_by(|a, b| a.0.cmp(&b.0));
        files.into_iter().map(|(_, c)| c).collect()
    }
}

/// Matches the streamer endpoint whether or not the query is part of the path.
pub fn streamer_path(repo: &str, digest: &Md5Digest) -> Matcher {
    Matcher::Regex(format!(r"^/{repo}/streamer\.cgi(\?{digest})?$"))
}

pub struct Fixture {
    pub server: ServerGuard,
    pub dir: TempDir,
}

impl Fixture {
    pub async fn new() -> Self {
        Self {
            server: mockito::Server::new_async().await,
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn base(&self, repo: &str) -> String {
        format!("{}/{repo}", self.server.url())
    }

    pub fn root_url(&self) -> String {
        format!("{}/repos.gz", self.server.url())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.dir.path())
    }

    pub fn config(&self, mode: TransferMode) -> SyncConfig {
        let mut config = SyncConfig::new(self.dir.path());
        config.root_url = self.root_url();
        config.mode = mode;
        config.retry = RetryPolicy::immediate(5);
        config
    }

    pub async fn serve_root(&mut self, repos: &[&str]) -> Mock {
        let mut root = RootIndex::new();
        for repo in repos {
            root.insert(*repo, self.base(repo));
        }
        self.server
            .mock("GET", "/repos.gz")
            .with_body(gzip(&encode_root(&root)).unwrap())
            .create_async()
            .await
    }

    pub fn repository_body(packages: &[&TestPackage]) -> Vec<u8> {
        let mut index = RepositoryIndex::new();
        for package in packages {
            index.insert(package.descriptor()).unwrap();
        }
        gzip(&encode_repository(&index)).unwrap()
    }

    pub async fn serve_repository(&mut self, repo: &str, packages: &[&TestPackage]) -> Mock {
        self.server
            .mock("GET", format!("/{repo}/versions.gz").as_str())
            .with_body(Self::repository_body(packages))
            .create_async()
            .await
    }

    pub async fn serve_package_index(&mut self, repo: &str, package: &TestPackage) -> Mock {
        self.server
            .mock("GET", format!("/{repo}/packages/{}.sdp", package.digest()).as_str())
            .with_body(gzip(&encode_package(&package.index())).unwrap())
            .create_async()
            .await
    }

    pub fn blob_path(repo: &str, content: &[u8]) -> String {
        let (dir, rest) = Md5Digest::compute(content).pool_split();
        format!("/{repo}/pool/{dir}/{rest}.gz")
    }

    pub async fn serve_blob(&mut self, repo: &str, content: &[u8]) -> Mock {
        self.server
            .mock("GET", Self::blob_path(repo, content).as_str())
            .with_body(gzip(content).unwrap())
            .create_async()
            .await
    }

    pub async fn serve_blobs(&mut self, repo: &str, package: &TestPackage) -> Vec<Mock> {
        let mut mocks = Vec::new();
        for (_, content) in &package.files {
            mocks.push(self.serve_blob(repo, content).await);
        }
        mocks
    }

    /// Answer a streamer request for every position of `package`.
    pub async fn serve_streamer(&mut self, repo: &str, package: &TestPackage) -> Mock {
        let contents = package.sorted_contents();
        let records: Vec<Vec<u8>> = contents.iter().map(|c| gzip(c).unwrap()).collect();
        let mask = encode_bitmask(0..contents.len(), contents.len());
        self.server
            .mock("POST", streamer_path(repo, &package.digest()))
            .match_body(gzip(&mask).unwrap())
            .with_body(encode_length_prefixed_stream(records.iter().map(Vec::as_slice)))
            .create_async()
            .await
    }

    /// Publish a whole package: index, repository entry, blobs.
    pub async fn publish(&mut self, repo: &str, packages: &[&TestPackage]) {
        self.serve_repository(repo, packages).await;
        for package in packages {
            self.serve_package_index(repo, package).await;
            self.serve_blobs(repo, package).await;
        }
    }
}
