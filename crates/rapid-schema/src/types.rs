//! Index and package data model.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::CorruptionError;
use crate::hash::Md5Digest;

/// A repository listed in the root index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    /// Short name (e.g. `byar`), unique within the root index.
    pub name: String,
    /// Base URL that `versions.gz`, `packages/` and `pool/` hang off.
    pub base_url: String,
}

/// The root index (`repos.gz`): every known repository, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RootIndex {
    repositories: BTreeMap<String, String>,
}

impl RootIndex {
    /// Create an empty root index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a repository, returning the previous base URL.
    pub fn insert(&mut self, name: impl Into<String>, base_url: impl Into<String>) -> Option<String> {
        self.repositories.insert(name.into(), base_url.into())
    }

    /// Base URL of the named repository.
    pub fn base_url(&self, name: &str) -> Option<&str> {
        self.repositories.get(name).map(String::as_str)
    }

    /// Whether a repository with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.repositories.contains_key(name)
    }

    /// Repository names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.repositories.keys().map(String::as_str)
    }

    /// Repositories in sorted order.
    pub fn repositories(&self) -> impl Iterator<Item = Repository> + '_ {
        self.repositories.iter().map(|(name, url)| Repository {
            name: name.clone(),
            base_url: url.clone(),
        })
    }

    /// Number of repositories.
    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    /// Returns `true` if no repositories are listed.
    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

/// One package revision published in a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageDescriptor {
    /// Tag, unique within the repository (e.g. `byar:test`).
    pub tag: String,
    /// Identity digest of the package index.
    pub digest: Md5Digest,
    /// Specifiers of packages this one needs.
    pub depends: Vec<String>,
    /// Human readable name, usable as a bare specifier.
    pub display_name: String,
}

/// A repository's `versions.gz`: every package revision keyed by tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepositoryIndex {
    packages: BTreeMap<String, PackageDescriptor>,
}

impl RepositoryIndex {
    /// Create an empty repository index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`CorruptionError::Duplicate`] if the tag is already present.
    pub fn insert(&mut self, descriptor: PackageDescriptor) -> Result<(), CorruptionError> {
        if self.packages.contains_key(&descriptor.tag) {
            return Err(CorruptionError::Duplicate(descriptor.tag));
        }
        self.packages.insert(descriptor.tag.clone(), descriptor);
        Ok(())
    }

    /// Look up a descriptor by exact tag.
    pub fn get(&self, tag: &str) -> Option<&PackageDescriptor> {
        self.packages.get(tag)
    }

    /// Descriptors whose display name equals `name`.
    pub fn find_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PackageDescriptor> {
        self.packages.values().filter(move |d| d.display_name == name)
    }

    /// Descriptors in tag order.
    pub fn packages(&self) -> impl Iterator<Item = &PackageDescriptor> {
        self.packages.values()
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Returns `true` if the repository publishes nothing.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// A file record inside a package index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobEntry {
    /// Path of the file inside the package (1 to 255 bytes).
    pub filename: String,
    /// MD5 of the decompressed content; the pool address.
    pub content_md5: Md5Digest,
    /// CRC-32 of the decompressed content.
    pub crc32: u32,
    /// Decompressed size in bytes.
    pub size: u32,
}

/// A package index (`.sdp`): the sorted file list of one package revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageIndex {
    entries: Vec<BlobEntry>,
}

impl PackageIndex {
    /// Build an index from entries in any order.
    ///
    /// # Errors
    ///
    /// Returns [`CorruptionError::Duplicate`] for a repeated filename,
    /// [`CorruptionError::EmptyFilename`] or [`CorruptionError::FilenameTooLong`]
    /// for names that do not fit the wire format.
    pub fn new(mut entries: Vec<BlobEntry>) -> Result<Self, CorruptionError> {
        entries.sort_by(|a, b| a.filename.as_bytes().cmp(b.filename.as_bytes()));
        for (i, entry) in entries.iter().enumerate() {
            if entry.filename.is_empty() {
                return Err(CorruptionError::EmptyFilename(i));
            }
            if entry.filename.len() > usize::from(u8::MAX) {
                return Err(CorruptionError::FilenameTooLong(entry.filename.clone()));
            }
            if i > 0 && entries[i - 1].filename == entry.filename {
                return Err(CorruptionError::Duplicate(entry.filename.clone()));
            }
        }
        Ok(Self { entries })
    }

    /// Entries already validated by the decoder.
    pub(crate) fn from_sorted(entries: Vec<BlobEntry>) -> Self {
        Self { entries }
    }

    /// Entries in filename order.
    pub fn entries(&self) -> &[BlobEntry] {
        &self.entries
    }

    /// Entry at a position of the sorted list.
    pub fn get(&self, position: usize) -> Option<&BlobEntry> {
        self.entries.get(position)
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` for a package without files.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identity digest: MD5 over `md5(filename) || content_md5` for every
    /// entry in order. Repository indices refer to packages by this value.
    pub fn digest(&self) -> Md5Digest {
        use md5::{Digest, Md5};

        let mut hasher = Md5::new();
        for entry in &self.entries {
            hasher.update(Md5::digest(entry.filename.as_bytes()));
            hasher.update(entry.content_md5.as_bytes());
        }
        Md5Digest::from_bytes(hasher.finalize().into())
    }
}
