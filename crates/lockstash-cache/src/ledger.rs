use crate::error::CacheError;
use crate::lock::{self, LockMode};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Name of the control file holding the cumulative cache size.
pub const CACHE_INFO_FILENAME: &str = "bes.cache.info";

const SIZE_WIDTH: usize = std::mem::size_of::<u64>();

/// The per-directory control file recording the total size of all cache entries.
///
/// The file holds a single native-endian `u64`. Every read or write goes through a
/// [`LedgerGuard`], so the type system enforces that callers hold the file's lock.
#[derive(Clone, Debug)]
pub struct SizeLedger {
    path: PathBuf,
}

impl SizeLedger {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(CACHE_INFO_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the ledger with a recorded size of zero unless it already exists.
    ///
    /// The zeroed file is written next to the ledger and then hard-linked into place, which
    /// fails if the name exists. Exactly one concurrent caller wins and no process can observe a
    /// ledger without its 8 bytes. Returns whether this call created it.
    pub fn initialize_if_absent(&self) -> Result<bool, CacheError> {
        if self.path.exists() {
            return Ok(false);
        }

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut staged = tempfile::Builder::new()
            .prefix(".cache-info.")
            .tempfile_in(dir)
            .map_err(|err| CacheError::lock("stage", &self.path, err))?;
        staged
            .write_all(&0u64.to_ne_bytes())
            .and_then(|()| staged.as_file().sync_all())
            .map_err(|err| CacheError::lock("write", staged.path(), err))?;

        match std::fs::hard_link(staged.path(), &self.path) {
            Ok(()) => {
                tracing::debug!(
                    target: "lockstash.cache",
                    path = %self.path.display(),
                    "initialized cache info"
                );
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(CacheError::lock("create", &self.path, err)),
        }
    }

    /// Block until the ledger is exclusively locked. Required for every size mutation.
    pub fn lock_exclusive(&self) -> Result<LedgerGuard, CacheError> {
        self.lock(LockMode::Exclusive)
    }

    /// Block until the ledger is share-locked. Readers use this to serialize against creation and
    /// purge.
    pub fn lock_shared(&self) -> Result<LedgerGuard, CacheError> {
        self.lock(LockMode::Shared)
    }

    fn lock(&self, mode: LockMode) -> Result<LedgerGuard, CacheError> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode == LockMode::Exclusive)
            .open(&self.path)
            .map_err(|err| CacheError::lock("open", &self.path, err))?;
        lock::lock_blocking(&file, &self.path, mode)?;

        Ok(LedgerGuard {
            file: Some(file),
            path: self.path.clone(),
            mode,
        })
    }
}

/// A held lock on the ledger.
#[derive(Debug)]
#[must_use = "dropping a LedgerGuard releases the cache info lock"]
pub struct LedgerGuard {
    file: Option<File>,
    path: PathBuf,
    mode: LockMode,
}

impl LedgerGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_size(&mut self) -> Result<u64, CacheError> {
        let path = self.path.clone();
        let file = self.file_mut()?;
        let mut buf = [0u8; SIZE_WIDTH];
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|err| match err.kind() {
                io::ErrorKind::UnexpectedEof => CacheError::TruncatedLedger { path: path.clone() },
                _ => CacheError::lock("read", &path, err),
            })?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write_size(&mut self, size: u64) -> Result<(), CacheError> {
        self.require_exclusive()?;
        let path = self.path.clone();
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&size.to_ne_bytes()))
            .and_then(|()| file.flush())
            .map_err(|err| CacheError::lock("write", &path, err))?;

        tracing::trace!(target: "lockstash.cache", size, "cache info updated");
        Ok(())
    }

    pub fn require_exclusive(&self) -> Result<(), CacheError> {
        if self.mode == LockMode::Exclusive {
            Ok(())
        } else {
            Err(CacheError::WrongLockMode {
                path: self.path.clone(),
                expected: LockMode::Exclusive,
                actual: self.mode,
            })
        }
    }

    /// Release the lock and close the file. Both failures are reported.
    pub fn unlock(mut self) -> Result<(), CacheError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        fs2::FileExt::unlock(&file).map_err(|err| CacheError::lock("unlock", &self.path, err))?;
        lock::close(file, &self.path)
    }

    fn file_mut(&mut self) -> Result<&mut File, CacheError> {
        let path = &self.path;
        self.file.as_mut().ok_or_else(|| {
            CacheError::lock("use", path, io::Error::other("cache info lock already released"))
        })
    }
}

impl Drop for LedgerGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            tracing::debug!(
                target: "lockstash.cache",
                path = %self.path.display(),
                "cache info lock released by drop"
            );
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}
