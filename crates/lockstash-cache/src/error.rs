use crate::lock::LockMode;
use std::path::PathBuf;

/// Broad classes of [`CacheError`].
///
/// Configuration, lock/IO and corruption errors abort the current request and are never retried
/// by the cache itself. Decompression errors mean "this request could not be satisfied".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    LockIo,
    Corruption,
    Decompression,
}

/// Errors produced by cache management, locking and decompression.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("the cache directory was not specified, must be non-empty")]
    MissingCacheDir,

    #[error("the cache directory {path} does not exist or is not a directory")]
    CacheDirNotFound { path: PathBuf },

    #[error("the cache file prefix was not specified, must not be empty")]
    MissingPrefix,

    #[error("the cache file prefix {prefix:?} must not contain path separators")]
    InvalidPrefix { prefix: String },

    #[error("the cache size was not specified, must be greater than zero")]
    ZeroMaxSize,

    #[error("the cache size of {bytes} bytes is larger than the max cache size of {max} bytes")]
    MaxSizeTooLarge { bytes: u64, max: u64 },

    #[error("invalid value {value:?} for {key}")]
    InvalidSetting { key: &'static str, value: String },

    #[error("cannot derive a cache file name from an empty source path")]
    EmptySourcePath,

    #[error("source path {path} is not valid UTF-8")]
    NonUtf8Path { path: PathBuf },

    #[error("failed to {op} {path}: {source}")]
    Lock {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("zero-byte file found in cache: {path}")]
    ZeroByteEntry { path: PathBuf },

    #[error("cache info {path} records {recorded} bytes but the cache directory holds {computed} bytes")]
    SizeMismatch {
        path: PathBuf,
        recorded: u64,
        computed: u64,
    },

    #[error("cache info file {path} is truncated")]
    TruncatedLedger { path: PathBuf },

    #[error("cache entry {path} disappeared after another process created it")]
    EntryVanished { path: PathBuf },

    #[error("{path} holds a {actual} lock where a {expected} lock is required")]
    WrongLockMode {
        path: PathBuf,
        expected: LockMode,
        actual: LockMode,
    },

    #[error("failed to decompress {source_path}: {source}")]
    Decompress {
        source_path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decompressing {source_path} produced an empty file")]
    EmptyDecompression { source_path: PathBuf },
}

impl CacheError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CacheError::MissingCacheDir
            | CacheError::CacheDirNotFound { .. }
            | CacheError::MissingPrefix
            | CacheError::InvalidPrefix { .. }
            | CacheError::ZeroMaxSize
            | CacheError::MaxSizeTooLarge { .. }
            | CacheError::InvalidSetting { .. }
            | CacheError::EmptySourcePath
            | CacheError::NonUtf8Path { .. } => ErrorClass::Configuration,
            CacheError::Lock { .. } => ErrorClass::LockIo,
            CacheError::ZeroByteEntry { .. }
            | CacheError::SizeMismatch { .. }
            | CacheError::TruncatedLedger { .. }
            | CacheError::EntryVanished { .. }
            | CacheError::WrongLockMode { .. } => ErrorClass::Corruption,
            CacheError::Decompress { .. } | CacheError::EmptyDecompression { .. } => {
                ErrorClass::Decompression
            }
        }
    }

    pub(crate) fn lock(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Lock {
            op,
            path: path.into(),
            source,
        }
    }
}
