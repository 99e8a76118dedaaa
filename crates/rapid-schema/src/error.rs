//! Decode failures shared by every wire format.

use thiserror::Error;

/// Structural failures found while decoding Rapid wire data.
///
/// Every decoder in [`crate::codec`] reports malformed input through this
/// type instead of panicking.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorruptionError {
    /// Text index is not valid UTF-8.
    #[error("index is not valid UTF-8")]
    NotUtf8,

    /// A text index line does not have the expected shape.
    #[error("line {line}: {reason}")]
    MalformedLine {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// The same key appears twice in an index.
    #[error("duplicate entry '{0}'")]
    Duplicate(String),

    /// A hex digest field is malformed.
    #[error("invalid digest '{0}'")]
    InvalidDigest(String),

    /// A binary record or frame runs past the end of the buffer.
    #[error("truncated record at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        /// Offset where the record starts.
        offset: usize,
        /// Bytes the record claims.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// A package record has a zero-length filename.
    #[error("empty filename at offset {0}")]
    EmptyFilename(usize),

    /// A package record filename is not valid UTF-8.
    #[error("filename at offset {0} is not valid UTF-8")]
    FilenameNotUtf8(usize),

    /// A filename does not fit the one-byte length prefix.
    #[error("filename '{0}' exceeds 255 bytes")]
    FilenameTooLong(String),

    /// Package records are not strictly ascending by filename.
    #[error("filenames out of order: '{previous}' must sort before '{current}'")]
    Unordered {
        /// Filename of the earlier record.
        previous: String,
        /// Filename of the offending record.
        current: String,
    },

    /// Gzip framing or deflate data is broken.
    #[error("gzip stream is corrupt: {0}")]
    Gzip(String),
}
