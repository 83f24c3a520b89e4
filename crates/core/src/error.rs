//! Error model for the rx core.
//!
//! Every fallible core operation returns [`RxError`]. Subprocess- and
//! OS-specific failures are folded into exactly one of these kinds before they
//! cross the crate boundary; the HTTP and CLI layers only ever see this enum.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, RxError>;

#[derive(Debug, Error)]
pub enum RxError {
    /// A user-supplied path resolved outside every configured search root.
    /// Fatal for the operation; nothing is created.
    #[error("access denied: '{path}' is outside all search roots")]
    PathOutsideSandbox { path: String },

    /// Binary file, compound archive, or directory where a file was expected.
    /// Reported per-file; other files proceed.
    #[error("not a processable file: {path}: {reason}")]
    NotAProcessableFile { path: PathBuf, reason: String },

    /// A decompressor for the detected format is unavailable.
    #[error("no decompressor available for {format} input: {path}")]
    CompressionUnsupported { format: String, path: PathBuf },

    /// A `.zst` file carries the seek-table footer magic but its entries fail
    /// the offset-sum invariant. Callers fall back to streaming decompression.
    #[error("seek table corrupt in {path}: {detail}")]
    SeekTableCorrupt { path: PathBuf, detail: String },

    /// A regex-engine subprocess crashed or emitted malformed events.
    /// The chunk is skipped; other chunks of the same file continue.
    #[error("chunk {index} of {path} failed: {cause}")]
    ChunkFailure { path: PathBuf, index: usize, cause: String },

    /// Every chunk of a file failed.
    #[error("all chunks failed for {path}")]
    FileSkipped { path: PathBuf },

    /// Read or write failure on a cache file. Treated as a miss on read;
    /// scans continue without caching on write.
    #[error("cache I/O failure: {0}")]
    CacheIo(String),

    /// The regex engine rejected a pattern for the whole job.
    #[error("invalid regex pattern: {0}")]
    RegexInvalid(String),

    /// The cancel token tripped. Partial results are returned, nothing is
    /// written to any cache.
    #[error("operation canceled")]
    Canceled,

    /// Operation-fatal I/O on a source file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RxError {
    /// True when the error is local to one file and the overall operation
    /// should continue with the remaining files.
    pub fn is_file_local(&self) -> bool {
        matches!(
            self,
            RxError::NotAProcessableFile { .. }
                | RxError::CompressionUnsupported { .. }
                | RxError::FileSkipped { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_local_classification() {
        let skip = RxError::FileSkipped { path: PathBuf::from("/a") };
        assert!(skip.is_file_local());
        assert!(!RxError::Canceled.is_file_local());
        assert!(!RxError::RegexInvalid("(".into()).is_file_local());
    }

    #[test]
    fn messages_name_the_offending_path() {
        let err = RxError::PathOutsideSandbox { path: "/etc/passwd".into() };
        assert!(err.to_string().contains("/etc/passwd"));
    }
}
