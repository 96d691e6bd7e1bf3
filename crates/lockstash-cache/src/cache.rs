use crate::config::{self, CacheConfig};
use crate::error::CacheError;
use crate::ledger::{LedgerGuard, SizeLedger};
use crate::lock::{self, LockMode, LockedFile};
use crate::path;
use crate::scan::{self, CacheEntryRecord, EmptyEntries, EvictOutcome, PurgeReport};
use filetime::FileTime;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Result of a non-blocking read attempt.
#[derive(Debug)]
#[must_use]
pub enum ReadProbe {
    Locked(LockedFile),
    /// The entry exists but another handle holds it exclusively.
    Busy,
    Absent,
}

/// Snapshot of a cache directory for operators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub dir: PathBuf,
    pub prefix: String,
    pub max_size_bytes: u64,
    pub target_size_bytes: u64,
    /// Size recorded in the cache info file.
    pub ledger_bytes: u64,
    /// Size of the published entries found on disk.
    pub scanned_bytes: u64,
    /// Published entries, least recently used first.
    pub entries: Vec<CacheEntryRecord>,
}

impl CacheStatus {
    pub fn is_consistent(&self) -> bool {
        self.ledger_bytes == self.scanned_bytes
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    /// Previously recorded size, `None` if the cache info file was unreadable.
    pub previous_bytes: Option<u64>,
    pub current_bytes: u64,
    pub removed_empty: Vec<PathBuf>,
}

/// A size-bounded directory of derived files shared by cooperating processes.
///
/// All coordination goes through advisory locks on the entries and on the cache info file, so any
/// number of processes (or independent `Cache` values in one process) may use the same directory.
///
/// Entry locks are handed out as [`LockedFile`] tokens and must be returned through
/// [`Cache::unlock`]. Size mutations need a [`LedgerGuard`] from [`Cache::lock_cache_info`].
#[derive(Clone, Debug)]
pub struct Cache {
    dir: PathBuf,
    prefix: String,
    max_size_bytes: u64,
    target_size_bytes: u64,
    ledger: SizeLedger,
}

impl Cache {
    /// Validate `config` and open the cache, creating the cache info file if needed.
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        Self::open(config.dir.clone(), config.prefix.clone(), config.max_size_bytes())
    }

    /// Like [`Cache::new`] with the limit given in bytes rather than megabytes.
    pub fn with_byte_limit(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        max_size_bytes: u64,
    ) -> Result<Self, CacheError> {
        let dir = dir.into();
        let prefix = prefix.into();
        config::validate_location(&dir, &prefix)?;
        config::validate_max_size(max_size_bytes)?;
        Self::open(dir, prefix, max_size_bytes)
    }

    fn open(dir: PathBuf, prefix: String, max_size_bytes: u64) -> Result<Self, CacheError> {
        let ledger = SizeLedger::new(&dir);
        ledger.initialize_if_absent()?;

        let target_size_bytes = (u128::from(max_size_bytes) * 4 / 5) as u64;
        tracing::debug!(
            target: "lockstash.cache",
            dir = %dir.display(),
            prefix = %prefix,
            max_size_bytes,
            target_size_bytes,
            "opened cache"
        );

        Ok(Self {
            dir,
            prefix,
            max_size_bytes,
            target_size_bytes,
            ledger,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    /// Purges stop once the total is at or below this size (80% of the limit).
    pub fn target_size_bytes(&self) -> u64 {
        self.target_size_bytes
    }

    pub fn cache_info_path(&self) -> &Path {
        self.ledger.path()
    }

    /// Path of the entry caching `source`. See [`path::cache_file_name`].
    pub fn cache_file_name(&self, source: &str) -> Result<PathBuf, CacheError> {
        path::cache_file_name(&self.dir, &self.prefix, source)
    }

    pub fn cache_file_name_for_path(&self, source: &Path) -> Result<PathBuf, CacheError> {
        path::cache_file_name_for_path(&self.dir, &self.prefix, source)
    }

    /// Create `entry` and lock it exclusively. `Ok(None)` if it already exists.
    ///
    /// Runs under the exclusive cache info lock, so no reader can open the file between its
    /// creation and the lock being granted.
    pub fn create_and_lock(&self, entry: &Path) -> Result<Option<LockedFile>, CacheError> {
        let guard = self.ledger.lock_exclusive()?;
        let created = LockedFile::create_exclusive(entry);
        guard.unlock()?;

        let created = created?;
        tracing::debug!(
            target: "lockstash.cache",
            path = %entry.display(),
            created = created.is_some(),
            "create_and_lock"
        );
        Ok(created)
    }

    /// Block until `entry` can be share-locked. `Ok(None)` if it does not exist, or if it was
    /// removed while this call waited (its producer failed).
    ///
    /// A granted lock also bumps the entry's access time.
    pub fn get_read_lock(&self, entry: &Path) -> Result<Option<LockedFile>, CacheError> {
        match self.read_lock(entry, true)? {
            ReadProbe::Locked(file) => Ok(Some(file)),
            ReadProbe::Busy | ReadProbe::Absent => Ok(None),
        }
    }

    /// Non-blocking [`Cache::get_read_lock`].
    pub fn try_read_lock(&self, entry: &Path) -> Result<ReadProbe, CacheError> {
        self.read_lock(entry, false)
    }

    fn read_lock(&self, entry: &Path, blocking: bool) -> Result<ReadProbe, CacheError> {
        let guard = self.ledger.lock_shared()?;
        let file = match lock::open_existing(entry) {
            Ok(Some(file)) => file,
            Ok(None) => {
                guard.unlock()?;
                return Ok(ReadProbe::Absent);
            }
            Err(err) => {
                guard.unlock()?;
                return Err(err);
            }
        };
        let acquired = lock::try_lock(&file, entry, LockMode::Shared);
        // The producer needs the cache info lock to publish, so never wait while holding it.
        guard.unlock()?;

        if !acquired? {
            if !blocking {
                return Ok(ReadProbe::Busy);
            }
            tracing::debug!(
                target: "lockstash.cache",
                path = %entry.display(),
                "waiting for cache entry producer"
            );
            lock::lock_blocking(&file, entry, LockMode::Shared)?;
        }

        let linked = lock::still_linked(&file, entry);
        let held = LockedFile::from_parts(file, entry, LockMode::Shared);
        if !linked? {
            tracing::debug!(
                target: "lockstash.cache",
                path = %entry.display(),
                "cache entry was removed before it was published"
            );
            held.unlock()?;
            return Ok(ReadProbe::Absent);
        }

        touch_access_time(entry);
        tracing::trace!(target: "lockstash.cache", path = %entry.display(), "read lock granted");
        Ok(ReadProbe::Locked(held))
    }

    /// Release an entry lock obtained from this cache.
    pub fn unlock(&self, entry: LockedFile) -> Result<(), CacheError> {
        entry.unlock()
    }

    /// Exclusively lock the cache info file. Required by every size mutation.
    pub fn lock_cache_info(&self) -> Result<LedgerGuard, CacheError> {
        self.ledger.lock_exclusive()
    }

    pub fn unlock_cache_info(&self, guard: LedgerGuard) -> Result<(), CacheError> {
        guard.unlock()
    }

    /// Add the size of the freshly written `entry` to the recorded total and return the new total.
    ///
    /// The new total is checked against a directory scan before it is written; a mismatch fails
    /// with [`CacheError::SizeMismatch`] and leaves the recorded size unchanged.
    pub fn update_cache_info(
        &self,
        guard: &mut LedgerGuard,
        entry: &Path,
    ) -> Result<u64, CacheError> {
        guard.require_exclusive()?;
        let current = guard.read_size()?;
        let entry_size = std::fs::metadata(entry)
            .map_err(|err| CacheError::lock("stat", entry, err))?
            .len();
        let total = current.saturating_add(entry_size);

        self.check_consistency(guard, total, Some(entry))?;

        guard.write_size(total)?;
        tracing::debug!(
            target: "lockstash.cache",
            path = %entry.display(),
            entry_size,
            total,
            "recorded cache entry size"
        );
        Ok(total)
    }

    pub fn cache_too_big(&self, current_size: u64) -> bool {
        current_size > self.max_size_bytes
    }

    /// Size recorded in the cache info file.
    pub fn cache_size(&self) -> Result<u64, CacheError> {
        let mut guard = self.ledger.lock_shared()?;
        let size = guard.read_size();
        guard.unlock()?;
        size
    }

    /// Remove least recently used entries until the total is at most the target size.
    ///
    /// `current_size` must equal the recorded size, and the published entries on disk must add up
    /// to it; otherwise this fails with [`CacheError::SizeMismatch`] without deleting anything.
    pub fn purge(
        &self,
        guard: &mut LedgerGuard,
        current_size: u64,
    ) -> Result<PurgeReport, CacheError> {
        self.purge_inner(guard, current_size, None)
    }

    /// [`Cache::purge`] that never removes `keep`, the entry the caller just wrote and still holds.
    pub fn purge_excluding(
        &self,
        guard: &mut LedgerGuard,
        current_size: u64,
        keep: &Path,
    ) -> Result<PurgeReport, CacheError> {
        self.purge_inner(guard, current_size, Some(keep))
    }

    /// Lock the cache info file, purge down to the target size and unlock again.
    pub fn purge_now(&self) -> Result<PurgeReport, CacheError> {
        let mut guard = self.lock_cache_info()?;
        let report = guard
            .read_size()
            .and_then(|size| self.purge(&mut guard, size));
        guard.unlock()?;
        report
    }

    fn purge_inner(
        &self,
        guard: &mut LedgerGuard,
        current_size: u64,
        keep: Option<&Path>,
    ) -> Result<PurgeReport, CacheError> {
        guard.require_exclusive()?;
        let found = self.check_consistency(guard, current_size, keep)?;

        tracing::debug!(
            target: "lockstash.cache",
            current_size,
            target_size = self.target_size_bytes,
            candidates = found.entries.len(),
            "purging cache"
        );
        let report = scan::purge_entries(found, self.target_size_bytes)?;
        guard.write_size(report.after_bytes)?;
        Ok(report)
    }

    fn check_consistency(
        &self,
        guard: &LedgerGuard,
        expected: u64,
        keep: Option<&Path>,
    ) -> Result<scan::CacheScan, CacheError> {
        let found = scan::scan(&self.dir, &self.prefix, keep, EmptyEntries::Reject)?;
        if found.total_bytes != expected {
            return Err(CacheError::SizeMismatch {
                path: guard.path().to_path_buf(),
                recorded: expected,
                computed: found.total_bytes,
            });
        }
        Ok(found)
    }

    /// Remove a single entry if nobody holds a lock on it, and subtract its size.
    pub fn purge_file(&self, entry: &Path) -> Result<EvictOutcome, CacheError> {
        let mut guard = self.lock_cache_info()?;
        let outcome = self.purge_file_locked(&mut guard, entry);
        guard.unlock()?;
        outcome
    }

    fn purge_file_locked(
        &self,
        guard: &mut LedgerGuard,
        entry: &Path,
    ) -> Result<EvictOutcome, CacheError> {
        let outcome = scan::evict_entry(entry)?;
        if let EvictOutcome::Removed { bytes } = outcome {
            let current = guard.read_size()?;
            if current < bytes {
                tracing::warn!(
                    target: "lockstash.cache",
                    path = %entry.display(),
                    current,
                    bytes,
                    "evicted entry was larger than the recorded cache size"
                );
            }
            guard.write_size(current.saturating_sub(bytes))?;
        }
        Ok(outcome)
    }

    /// Swap an exclusive entry lock for a shared one.
    ///
    /// The exclusive cache info guard keeps purges out of the window between the two locks.
    pub fn downgrade(
        &self,
        guard: &LedgerGuard,
        entry: LockedFile,
    ) -> Result<LockedFile, CacheError> {
        guard.require_exclusive()?;
        if entry.mode() != LockMode::Exclusive {
            return Err(CacheError::WrongLockMode {
                path: entry.path().to_path_buf(),
                expected: LockMode::Exclusive,
                actual: entry.mode(),
            });
        }

        let path = entry.path().to_path_buf();
        entry.unlock()?;
        let shared = LockedFile::lock_shared(&path)?;
        shared.ok_or(CacheError::EntryVanished { path })
    }

    /// Rescan the directory and overwrite the recorded size with the result.
    ///
    /// Zero-byte entries nobody holds are deleted. Use this after a producer crashed mid-write.
    pub fn rebuild_ledger(&self) -> Result<RebuildReport, CacheError> {
        let mut guard = self.lock_cache_info()?;
        let result = self.rebuild_locked(&mut guard);
        guard.unlock()?;
        result
    }

    fn rebuild_locked(&self, guard: &mut LedgerGuard) -> Result<RebuildReport, CacheError> {
        let previous_bytes = match guard.read_size() {
            Ok(size) => Some(size),
            Err(CacheError::TruncatedLedger { .. }) => None,
            Err(err) => return Err(err),
        };
        let found = scan::scan(&self.dir, &self.prefix, None, EmptyEntries::Remove)?;
        guard.write_size(found.total_bytes)?;

        if previous_bytes != Some(found.total_bytes) {
            tracing::warn!(
                target: "lockstash.cache",
                previous = ?previous_bytes,
                current = found.total_bytes,
                "rebuilt cache info"
            );
        }
        Ok(RebuildReport {
            previous_bytes,
            current_bytes: found.total_bytes,
            removed_empty: found.removed_empty,
        })
    }

    pub fn status(&self) -> Result<CacheStatus, CacheError> {
        let mut guard = self.ledger.lock_shared()?;
        let result = guard.read_size().and_then(|ledger_bytes| {
            let found = scan::scan(&self.dir, &self.prefix, None, EmptyEntries::Reject)?;
            Ok((ledger_bytes, found))
        });
        guard.unlock()?;
        let (ledger_bytes, found) = result?;

        Ok(CacheStatus {
            dir: self.dir.clone(),
            prefix: self.prefix.clone(),
            max_size_bytes: self.max_size_bytes,
            target_size_bytes: self.target_size_bytes,
            ledger_bytes,
            scanned_bytes: found.total_bytes,
            entries: found.entries,
        })
    }
}

fn touch_access_time(entry: &Path) {
    if let Err(err) = filetime::set_file_atime(entry, FileTime::now()) {
        tracing::debug!(
            target: "lockstash.cache",
            path = %entry.display(),
            error = %err,
            "failed to update cache entry access time"
        );
    }
}
