//! Content digests and cache validators.

use md5::Md5;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::CorruptionError;

/// A 16-byte MD5 digest.
///
/// Rapid addresses pool blobs by the MD5 of their decompressed bytes and
/// identifies packages by an MD5 over their file list, so this is the one
/// identity type shared by every index format.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Md5Digest([u8; 16]);

impl Md5Digest {
    /// Size of the raw digest in bytes.
    pub const LEN: usize = 16;

    /// Wrap raw digest bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Compute the MD5 of `data`.
    pub fn compute(data: &[u8]) -> Self {
        Self(Md5::digest(data).into())
    }

    /// Parse a 32 character hex string.
    ///
    /// Uppercase input is accepted; [`Md5Digest::to_hex`] always emits lowercase.
    ///
    /// # Errors
    ///
    /// Returns [`CorruptionError::InvalidDigest`] if `s` is not exactly 32 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, CorruptionError> {
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out)
            .map_err(|_| CorruptionError::InvalidDigest(s.to_string()))?;
        Ok(Self(out))
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex form (32 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Split the hex form into the two-character fan-out directory and the
    /// remaining 30 characters, as used by pool paths.
    pub fn pool_split(&self) -> (String, String) {
        let mut hex = self.to_hex();
        let rest = hex.split_off(2);
        (hex, rest)
    }
}

impl std::fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for Md5Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Md5Digest({})", self.to_hex())
    }
}

impl std::str::FromStr for Md5Digest {
    type Err = CorruptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Md5Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Md5Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Entity tag used for conditional GETs on cached index files.
///
/// This is the quoted SHA-256 of the exact bytes held on disk, compressed
/// form included. It is unrelated to the MD5 content address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ETag(String);

impl ETag {
    /// Compute the tag for a cached file's bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(format!("\"{}\"", hex::encode(Sha256::digest(data))))
    }

    /// Header value, including the surrounding quotes.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ETag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
