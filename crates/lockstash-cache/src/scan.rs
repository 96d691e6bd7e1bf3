//! Directory scan and LRU purge.
//!
//! The scan is the ground truth the ledger is checked against. It only counts *published* entries:
//! a file some other handle holds exclusively is still being written (or probed by another purge)
//! and is skipped. Callers run every scan under the cache info lock.

use crate::error::CacheError;
use crate::lock::{self, LockMode, LockedFile};
use crate::path::CACHE_NAME_SEPARATOR;
use crate::util;
use filetime::FileTime;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A published cache entry as seen by one scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheEntryRecord {
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(
        rename = "last_access_millis",
        serialize_with = "util::serialize_file_time_millis"
    )]
    pub last_access: FileTime,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct CacheScan {
    /// Size of every published entry, including the kept one.
    pub total_bytes: u64,
    /// Deletion candidates, oldest access first. Never contains the kept entry.
    pub entries: Vec<CacheEntryRecord>,
    /// Zero-byte entries removed while scanning with [`EmptyEntries::Remove`].
    pub removed_empty: Vec<PathBuf>,
}

/// What a scan does with a published zero-byte entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EmptyEntries {
    /// Fail with [`CacheError::ZeroByteEntry`].
    Reject,
    /// Delete it. Only used when rebuilding the ledger.
    Remove,
}

/// Outcome of trying to evict a single entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EvictOutcome {
    Removed { bytes: u64 },
    /// Another handle holds a lock on the entry.
    Busy,
    Absent,
}

/// Result summary from a purge pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub before_bytes: u64,
    pub after_bytes: u64,
    pub target_bytes: u64,
    pub removed: Vec<CacheEntryRecord>,
    /// Entries that were locked by someone else and left alone.
    pub skipped_busy: Vec<PathBuf>,
}

pub(crate) fn is_entry_name(file_name: &std::ffi::OsStr, prefix: &str) -> bool {
    let bytes = file_name.as_encoded_bytes();
    bytes.len() > prefix.len()
        && bytes.starts_with(prefix.as_bytes())
        && bytes[prefix.len()] == CACHE_NAME_SEPARATOR as u8
}

/// List the published entries of `cache_dir` whose names start with `{prefix}#`.
///
/// `keep` is counted without being probed (the caller holds its lock) and is left out of the
/// candidate list.
pub(crate) fn scan(
    cache_dir: &Path,
    prefix: &str,
    keep: Option<&Path>,
    empty: EmptyEntries,
) -> Result<CacheScan, CacheError> {
    let mut scan = CacheScan::default();

    let read_dir =
        std::fs::read_dir(cache_dir).map_err(|err| CacheError::lock("list", cache_dir, err))?;
    for entry in read_dir {
        let entry = entry.map_err(|err| CacheError::lock("list", cache_dir, err))?;
        if !is_entry_name(&entry.file_name(), prefix) {
            continue;
        }
        let path = entry.path();

        if keep == Some(path.as_path()) {
            let meta = std::fs::metadata(&path).map_err(|err| CacheError::lock("stat", &path, err))?;
            scan.total_bytes = scan.total_bytes.saturating_add(meta.len());
            continue;
        }

        let Some(file) = lock::open_existing(&path)? else {
            continue;
        };
        let Some(record) = probe_published(&file, &path)? else {
            tracing::trace!(target: "lockstash.cache", path = %path.display(), "skipping in-flight entry");
            continue;
        };

        if record.size_bytes == 0 {
            match empty {
                EmptyEntries::Reject => return Err(CacheError::ZeroByteEntry { path }),
                EmptyEntries::Remove => {
                    if let Some(held) = LockedFile::lock_exclusive(&path, false)? {
                        tracing::warn!(
                            target: "lockstash.cache",
                            path = %path.display(),
                            "removing zero-byte cache entry"
                        );
                        std::fs::remove_file(&path)
                            .map_err(|err| CacheError::lock("remove", &path, err))?;
                        held.unlock()?;
                        scan.removed_empty.push(path);
                    }
                    continue;
                }
            }
        }

        scan.total_bytes = scan.total_bytes.saturating_add(record.size_bytes);
        scan.entries.push(record);
    }

    scan.entries
        .sort_by(|a, b| a.last_access.cmp(&b.last_access).then_with(|| a.path.cmp(&b.path)));
    Ok(scan)
}

/// Briefly share-lock `file` and stat it. `None` if another handle holds it exclusively.
fn probe_published(file: &File, path: &Path) -> Result<Option<CacheEntryRecord>, CacheError> {
    if !lock::try_lock(file, path, LockMode::Shared)? {
        return Ok(None);
    }
    let meta = file.metadata();
    fs2::FileExt::unlock(file).map_err(|err| CacheError::lock("unlock", path, err))?;
    let meta = meta.map_err(|err| CacheError::lock("stat", path, err))?;

    Ok(Some(CacheEntryRecord {
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        last_access: FileTime::from_last_access_time(&meta),
    }))
}

/// Delete `path` if a non-blocking exclusive lock can be taken on it.
///
/// The file is unlinked while the lock is held so a reader blocked on it observes the removal.
pub(crate) fn evict_entry(path: &Path) -> Result<EvictOutcome, CacheError> {
    if !path.exists() {
        return Ok(EvictOutcome::Absent);
    }
    let Some(held) = LockedFile::lock_exclusive(path, false)? else {
        return Ok(if path.exists() {
            EvictOutcome::Busy
        } else {
            EvictOutcome::Absent
        });
    };

    let bytes = match held.file().map(File::metadata) {
        Some(Ok(meta)) => meta.len(),
        Some(Err(err)) => return Err(CacheError::lock("stat", path, err)),
        None => 0,
    };
    std::fs::remove_file(path).map_err(|err| CacheError::lock("remove", path, err))?;
    held.unlock()?;

    tracing::debug!(target: "lockstash.cache", path = %path.display(), bytes, "evicted cache entry");
    Ok(EvictOutcome::Removed { bytes })
}

/// Remove the oldest unlocked candidates until the total is at most `target_bytes`.
///
/// Busy entries are skipped and not retried in this pass.
pub(crate) fn purge_entries(scan: CacheScan, target_bytes: u64) -> Result<PurgeReport, CacheError> {
    let mut report = PurgeReport {
        before_bytes: scan.total_bytes,
        after_bytes: scan.total_bytes,
        target_bytes,
        ..PurgeReport::default()
    };

    for record in scan.entries {
        if report.after_bytes <= target_bytes {
            break;
        }
        match evict_entry(&record.path)? {
            EvictOutcome::Removed { bytes } => {
                report.after_bytes = report.after_bytes.saturating_sub(bytes);
                report.removed.push(record);
            }
            EvictOutcome::Busy => {
                tracing::debug!(
                    target: "lockstash.cache",
                    path = %record.path.display(),
                    "cache entry is busy, not purging it"
                );
                report.skipped_busy.push(record.path);
            }
            EvictOutcome::Absent => {
                report.after_bytes = report.after_bytes.saturating_sub(record.size_bytes);
            }
        }
    }

    tracing::debug!(
        target: "lockstash.cache",
        before = report.before_bytes,
        after = report.after_bytes,
        removed = report.removed.len(),
        skipped = report.skipped_busy.len(),
        "purge finished"
    );
    Ok(report)
}
