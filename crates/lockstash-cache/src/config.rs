use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// Largest accepted cache size limit.
pub const MAX_CACHE_SIZE_IN_BYTES: u64 = 1 << 44;

/// [`MAX_CACHE_SIZE_IN_BYTES`] in megabytes.
pub const MAX_CACHE_SIZE_IN_MEGABYTES: u64 = MAX_CACHE_SIZE_IN_BYTES / BYTES_PER_MEGABYTE;

pub const ENV_CACHE_DIR: &str = "LOCKSTASH_CACHE_DIR";
pub const ENV_CACHE_PREFIX: &str = "LOCKSTASH_CACHE_PREFIX";
pub const ENV_CACHE_MAX_SIZE_MB: &str = "LOCKSTASH_CACHE_MAX_SIZE_MB";

/// Location and size limit of a cache directory.
///
/// Missing fields deserialize to empty values so partial sources (a config file, the environment,
/// command-line flags) can be layered before [`CacheConfig::validate`] runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Directory holding the cache entries and the cache info file. Must already exist.
    pub dir: PathBuf,
    /// Name prefix shared by every entry of this cache.
    pub prefix: String,
    /// Size limit in megabytes. Purging brings the cache down to 80% of it.
    pub max_size_mb: u64,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, max_size_mb: u64) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            max_size_mb,
        }
    }

    /// Read `LOCKSTASH_CACHE_DIR`, `LOCKSTASH_CACHE_PREFIX` and `LOCKSTASH_CACHE_MAX_SIZE_MB`.
    ///
    /// Unset variables leave the field empty. A size that is not a number is an error.
    pub fn from_env() -> Result<Self, CacheError> {
        let mut config = Self::default();
        config.merge_env()?;
        Ok(config)
    }

    /// Overwrite fields with any `LOCKSTASH_CACHE_*` variables that are set.
    pub fn merge_env(&mut self) -> Result<(), CacheError> {
        if let Some(dir) = std::env::var_os(ENV_CACHE_DIR) {
            self.dir = PathBuf::from(dir);
        }
        if let Ok(prefix) = std::env::var(ENV_CACHE_PREFIX) {
            self.prefix = prefix;
        }
        if let Ok(raw) = std::env::var(ENV_CACHE_MAX_SIZE_MB) {
            self.max_size_mb = raw
                .trim()
                .parse()
                .map_err(|_| CacheError::InvalidSetting {
                    key: ENV_CACHE_MAX_SIZE_MB,
                    value: raw.clone(),
                })?;
        }
        Ok(())
    }

    /// Check every field without creating anything on disk.
    pub fn validate(&self) -> Result<(), CacheError> {
        validate_location(&self.dir, &self.prefix)?;
        validate_max_size(self.max_size_bytes())
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(BYTES_PER_MEGABYTE)
    }
}

pub(crate) fn validate_location(dir: &Path, prefix: &str) -> Result<(), CacheError> {
    if dir.as_os_str().is_empty() {
        return Err(CacheError::MissingCacheDir);
    }
    if !dir.is_dir() {
        return Err(CacheError::CacheDirNotFound {
            path: dir.to_path_buf(),
        });
    }
    if prefix.is_empty() {
        return Err(CacheError::MissingPrefix);
    }
    if prefix.contains(['/', '\\']) {
        return Err(CacheError::InvalidPrefix {
            prefix: prefix.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn validate_max_size(max_size_bytes: u64) -> Result<(), CacheError> {
    if max_size_bytes == 0 {
        return Err(CacheError::ZeroMaxSize);
    }
    if max_size_bytes > MAX_CACHE_SIZE_IN_BYTES {
        return Err(CacheError::MaxSizeTooLarge {
            bytes: max_size_bytes,
            max: MAX_CACHE_SIZE_IN_BYTES,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn accepts_a_complete_configuration() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::new(tmp.path(), "rc", 20);
        config.validate().unwrap();
        assert_eq!(config.max_size_bytes(), 20 * 1024 * 1024);
    }

    #[test]
    fn rejects_each_missing_or_invalid_field() {
        let tmp = TempDir::new().unwrap();

        let cases = [
            (CacheConfig::new("", "rc", 1), "MissingCacheDir"),
            (
                CacheConfig::new(tmp.path().join("nope"), "rc", 1),
                "CacheDirNotFound",
            ),
            (CacheConfig::new(tmp.path(), "", 1), "MissingPrefix"),
            (CacheConfig::new(tmp.path(), "a/b", 1), "InvalidPrefix"),
            (CacheConfig::new(tmp.path(), "rc", 0), "ZeroMaxSize"),
            (
                CacheConfig::new(tmp.path(), "rc", MAX_CACHE_SIZE_IN_MEGABYTES + 1),
                "MaxSizeTooLarge",
            ),
            (
                CacheConfig::new(tmp.path(), "rc", u64::MAX),
                "MaxSizeTooLarge",
            ),
        ];

        for (config, expected) in cases {
            let err = config.validate().unwrap_err();
            assert!(
                format!("{err:?}").starts_with(expected),
                "expected {expected}, got {err:?}"
            );
            assert_eq!(err.class(), crate::ErrorClass::Configuration);
        }
    }

    #[test]
    fn largest_valid_size_is_the_byte_bound() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::new(tmp.path(), "rc", MAX_CACHE_SIZE_IN_MEGABYTES);
        config.validate().unwrap();
        assert_eq!(config.max_size_bytes(), MAX_CACHE_SIZE_IN_BYTES);
    }
}
