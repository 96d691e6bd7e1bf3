use crate::error::CacheError;
use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Lock discipline of a [`LockedFile`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// An open file holding an advisory lock that is safe to share across processes.
///
/// The lock subject is the open file, not the path: closing the handle releases the lock. Call
/// [`LockedFile::unlock`] to release it and observe errors. Dropping the value still releases the
/// lock, but logs a warning since the release can no longer fail loudly.
///
/// `fs2` uses `flock(2)` on Unix, so two handles opened by the same process exclude each other
/// exactly like two processes do.
#[derive(Debug)]
#[must_use = "dropping a LockedFile releases its lock; call `unlock` to observe errors"]
pub struct LockedFile {
    file: Option<File>,
    path: PathBuf,
    mode: LockMode,
}

impl LockedFile {
    /// Atomically create `path` and lock it exclusively.
    ///
    /// Returns `Ok(None)` if the file already exists.
    pub fn create_exclusive(path: &Path) -> Result<Option<Self>, CacheError> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(CacheError::lock("create", path, err)),
        };

        lock_blocking(&file, path, LockMode::Exclusive)?;
        tracing::trace!(target: "lockstash.cache", path = %path.display(), "created locked file");

        Ok(Some(Self::from_parts(file, path, LockMode::Exclusive)))
    }

    /// Block until a shared lock on the existing file at `path` is granted.
    ///
    /// Returns `Ok(None)` if the file does not exist when it is opened, or if it was unlinked
    /// while this call waited for the lock.
    pub fn lock_shared(path: &Path) -> Result<Option<Self>, CacheError> {
        let Some(file) = open_existing(path)? else {
            return Ok(None);
        };
        lock_blocking(&file, path, LockMode::Shared)?;
        Self::verified(file, path, LockMode::Shared)
    }

    /// Lock the existing file at `path` exclusively.
    ///
    /// The blocking variant waits for the lock. The non-blocking variant returns `Ok(None)` when
    /// another handle holds any lock on the file. Both return `Ok(None)` when the file is absent.
    pub fn lock_exclusive(path: &Path, blocking: bool) -> Result<Option<Self>, CacheError> {
        let Some(file) = open_existing(path)? else {
            return Ok(None);
        };
        if blocking {
            lock_blocking(&file, path, LockMode::Exclusive)?;
        } else if !try_lock(&file, path, LockMode::Exclusive)? {
            tracing::trace!(target: "lockstash.cache", path = %path.display(), "file is busy");
            return Ok(None);
        }
        Self::verified(file, path, LockMode::Exclusive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Release the lock and close the handle.
    ///
    /// A failure here means the descriptor is in an unknown state and is reported as an error.
    pub fn unlock(mut self) -> Result<(), CacheError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        fs2::FileExt::unlock(&file).map_err(|err| CacheError::lock("unlock", &self.path, err))?;
        close(file, &self.path)?;
        tracing::trace!(target: "lockstash.cache", path = %self.path.display(), "unlocked file");
        Ok(())
    }

    pub(crate) fn from_parts(file: File, path: &Path, mode: LockMode) -> Self {
        Self {
            file: Some(file),
            path: path.to_path_buf(),
            mode,
        }
    }

    pub(crate) fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    fn verified(file: File, path: &Path, mode: LockMode) -> Result<Option<Self>, CacheError> {
        if still_linked(&file, path)? {
            Ok(Some(Self::from_parts(file, path, mode)))
        } else {
            tracing::debug!(
                target: "lockstash.cache",
                path = %path.display(),
                "file was removed while waiting for its lock"
            );
            Ok(None)
        }
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            tracing::warn!(
                target: "lockstash.cache",
                path = %self.path.display(),
                mode = %self.mode,
                "lock released by drop instead of an explicit unlock"
            );
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

/// Open an existing file for locking. `Ok(None)` if it does not exist.
pub(crate) fn open_existing(path: &Path) -> Result<Option<File>, CacheError> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(CacheError::lock("open", path, err)),
    }
}

/// Try to take `mode` on `file` without blocking. `Ok(false)` if another handle holds a
/// conflicting lock.
pub(crate) fn try_lock(file: &File, path: &Path, mode: LockMode) -> Result<bool, CacheError> {
    let result = match mode {
        LockMode::Shared => fs2::FileExt::try_lock_shared(file),
        LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(file),
    };
    match result {
        Ok(()) => Ok(true),
        Err(err) if is_contended(&err) => Ok(false),
        Err(err) => Err(CacheError::lock("try-lock", path, err)),
    }
}

pub(crate) fn lock_blocking(file: &File, path: &Path, mode: LockMode) -> Result<(), CacheError> {
    let result = match mode {
        LockMode::Shared => fs2::FileExt::lock_shared(file),
        LockMode::Exclusive => fs2::FileExt::lock_exclusive(file),
    };
    result.map_err(|err| CacheError::lock("lock", path, err))
}

/// Whether `path` still names the file behind `file`.
///
/// A producer that fails unlinks its entry before unlocking it, so a waiter can be granted a lock
/// on a file that no longer has a name.
pub(crate) fn still_linked(file: &File, path: &Path) -> Result<bool, CacheError> {
    let on_disk = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(CacheError::lock("stat", path, err)),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt as _;
        let held = file
            .metadata()
            .map_err(|err| CacheError::lock("stat", path, err))?;
        Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino())
    }

    #[cfg(not(unix))]
    {
        let _ = (file, on_disk);
        Ok(true)
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Close `file`, reporting the error `File`'s drop would swallow.
pub(crate) fn close(file: File, path: &Path) -> Result<(), CacheError> {
    #[cfg(unix)]
    {
        use std::os::unix::io::IntoRawFd as _;
        let fd = file.into_raw_fd();
        // SAFETY: `fd` was just released from an owned `File` and is closed exactly once here.
        if unsafe { libc::close(fd) } == -1 {
            return Err(CacheError::lock("close", path, io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        drop(file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_exclusive_reports_existing_file_as_absent_precondition() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("entry");

        let first = LockedFile::create_exclusive(&path).unwrap().unwrap();
        assert_eq!(first.mode(), LockMode::Exclusive);
        assert!(LockedFile::create_exclusive(&path).unwrap().is_none());
        first.unlock().unwrap();
    }

    #[test]
    fn shared_lock_on_missing_file_is_absent() {
        let tmp = TempDir::new().unwrap();
        assert!(LockedFile::lock_shared(&tmp.path().join("missing"))
            .unwrap()
            .is_none());
        assert!(LockedFile::lock_exclusive(&tmp.path().join("missing"), false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn separate_handles_exclude_each_other() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("entry");
        std::fs::write(&path, b"data").unwrap();

        let reader = LockedFile::lock_shared(&path).unwrap().unwrap();
        let second_reader = LockedFile::lock_shared(&path).unwrap().unwrap();
        assert!(LockedFile::lock_exclusive(&path, false).unwrap().is_none());

        reader.unlock().unwrap();
        assert!(LockedFile::lock_exclusive(&path, false).unwrap().is_none());
        second_reader.unlock().unwrap();

        let writer = LockedFile::lock_exclusive(&path, false).unwrap().unwrap();
        writer.unlock().unwrap();
    }

    #[test]
    fn dropping_a_token_releases_the_lock() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("entry");
        std::fs::write(&path, b"data").unwrap();

        let held = LockedFile::lock_exclusive(&path, true).unwrap().unwrap();
        drop(held);
        let again = LockedFile::lock_exclusive(&path, false).unwrap().unwrap();
        again.unlock().unwrap();
    }

    #[test]
    fn waiter_sees_absent_when_the_holder_unlinks_the_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("entry");
        let writer = LockedFile::create_exclusive(&path).unwrap().unwrap();

        let waiter = {
            let path = path.clone();
            std::thread::spawn(move || LockedFile::lock_shared(&path).unwrap().is_none())
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        std::fs::remove_file(&path).unwrap();
        writer.unlock().unwrap();

        assert!(waiter.join().unwrap());
    }
}
