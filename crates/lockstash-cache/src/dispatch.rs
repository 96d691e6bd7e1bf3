use crate::cache::Cache;
use crate::decompress;
use crate::error::CacheError;
use crate::ledger::LedgerGuard;
use crate::lock::LockedFile;
use crate::util::remove_file_best_effort;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Writes the decompressed form of `source` into `target`.
///
/// `target` already exists and is exclusively locked by the caller. An implementation that fails
/// should remove it; the dispatcher removes whatever is left either way.
pub trait Decompressor: Send + Sync {
    fn decompress(&self, source: &Path, target: &Path) -> io::Result<()>;
}

impl<F> Decompressor for F
where
    F: Fn(&Path, &Path) -> io::Result<()> + Send + Sync,
{
    fn decompress(&self, source: &Path, target: &Path) -> io::Result<()> {
        self(source, target)
    }
}

/// Decompressors keyed by file extension (exact, case-sensitive match, without the dot).
#[derive(Clone, Default)]
pub struct DecompressorRegistry {
    by_extension: BTreeMap<String, Arc<dyn Decompressor>>,
}

impl fmt::Debug for DecompressorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecompressorRegistry")
            .field("extensions", &self.by_extension.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DecompressorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `gz` and `zst` support.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("gz", decompress::gunzip);
        registry.register("zst", decompress::unzstd);
        registry
    }

    /// Register `decompressor` for `extension`, replacing any previous one.
    pub fn register(
        &mut self,
        extension: impl Into<String>,
        decompressor: impl Decompressor + 'static,
    ) -> &mut Self {
        self.by_extension
            .insert(extension.into(), Arc::new(decompressor));
        self
    }

    pub fn get(&self, extension: &str) -> Option<&dyn Decompressor> {
        self.by_extension.get(extension).map(|d| d.as_ref())
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.by_extension.keys().map(String::as_str)
    }

    /// The extension and decompressor responsible for `source`, if any.
    ///
    /// The extension is everything after the last `.` of the file name, the same part
    /// [`crate::cache_file_name`] strips, so a dot-file such as `.gz` has extension `gz`.
    pub fn for_source(&self, source: &Path) -> Option<(&str, &dyn Decompressor)> {
        let (_, extension) = source.file_name()?.to_str()?.rsplit_once('.')?;
        let (key, decompressor) = self.by_extension.get_key_value(extension)?;
        Some((key.as_str(), decompressor.as_ref()))
    }
}

/// Looks up or populates the cached, decompressed copy of a compressed source file.
#[derive(Debug)]
pub struct Dispatcher<'c> {
    cache: &'c Cache,
    registry: DecompressorRegistry,
}

impl<'c> Dispatcher<'c> {
    pub fn new(cache: &'c Cache, registry: DecompressorRegistry) -> Self {
        Self { cache, registry }
    }

    pub fn cache(&self) -> &Cache {
        self.cache
    }

    pub fn registry(&self) -> &DecompressorRegistry {
        &self.registry
    }

    /// Return a shared lock on the decompressed copy of `source`, producing it if needed.
    ///
    /// `Ok(None)` means `source` has no registered extension and should be used as is. The caller
    /// owns the returned lock and must pass it to [`Cache::unlock`] when done reading.
    ///
    /// Exactly one process decompresses a given source. Everyone else blocks until the producer
    /// publishes the entry. If the producer fails, those waiters get
    /// [`CacheError::EntryVanished`].
    pub fn fetch(&self, source: &Path) -> Result<Option<LockedFile>, CacheError> {
        let Some((extension, decompressor)) = self.registry.for_source(source) else {
            tracing::trace!(
                target: "lockstash.cache",
                source = %source.display(),
                "no decompressor registered"
            );
            return Ok(None);
        };
        let entry = self.cache.cache_file_name_for_path(source)?;

        if let Some(reader) = self.cache.get_read_lock(&entry)? {
            tracing::debug!(target: "lockstash.cache", path = %entry.display(), "cache hit");
            return Ok(Some(reader));
        }

        match self.cache.create_and_lock(&entry)? {
            Some(writer) => {
                tracing::debug!(
                    target: "lockstash.cache",
                    source = %source.display(),
                    path = %entry.display(),
                    extension,
                    "cache miss, decompressing"
                );
                self.produce(source, decompressor, writer).map(Some)
            }
            None => {
                // Lost the creation race; the winner publishes or removes the entry.
                let reader = self.cache.get_read_lock(&entry)?;
                reader
                    .ok_or(CacheError::EntryVanished { path: entry })
                    .map(Some)
            }
        }
    }

    fn produce(
        &self,
        source: &Path,
        decompressor: &dyn Decompressor,
        writer: LockedFile,
    ) -> Result<LockedFile, CacheError> {
        let entry = writer.path().to_path_buf();

        if let Err(err) = decompressor.decompress(source, &entry) {
            return Err(self.abandon(
                writer,
                None,
                CacheError::Decompress {
                    source_path: source.to_path_buf(),
                    source: err,
                },
            ));
        }

        let written = match std::fs::metadata(&entry) {
            Ok(meta) => meta.len(),
            Err(err) => return Err(self.abandon(writer, None, CacheError::lock("stat", &entry, err))),
        };
        if written == 0 {
            return Err(self.abandon(
                writer,
                None,
                CacheError::EmptyDecompression {
                    source_path: source.to_path_buf(),
                },
            ));
        }

        let mut guard = match self.cache.lock_cache_info() {
            Ok(guard) => guard,
            Err(err) => return Err(self.abandon(writer, None, err)),
        };
        let size = match self.cache.update_cache_info(&mut guard, &entry) {
            Ok(size) => size,
            Err(err) => return Err(self.abandon(writer, Some(guard), err)),
        };

        // The entry is accounted for from here on, so failures keep it on disk.
        if self.cache.cache_too_big(size) {
            if let Err(err) = self.cache.purge_excluding(&mut guard, size, &entry) {
                warn_if_release_failed("cache entry", writer.unlock());
                warn_if_release_failed("cache info", guard.unlock());
                return Err(err);
            }
        }

        let reader = match self.cache.downgrade(&guard, writer) {
            Ok(reader) => reader,
            Err(err) => {
                warn_if_release_failed("cache info", guard.unlock());
                return Err(err);
            }
        };
        if let Err(err) = self.cache.unlock_cache_info(guard) {
            warn_if_release_failed("cache entry", reader.unlock());
            return Err(err);
        }

        tracing::debug!(
            target: "lockstash.cache",
            path = %entry.display(),
            bytes = written,
            "cache entry published"
        );
        Ok(reader)
    }

    /// Remove the unpublished entry, release its lock and return `err`.
    fn abandon(
        &self,
        writer: LockedFile,
        guard: Option<LedgerGuard>,
        err: CacheError,
    ) -> CacheError {
        tracing::debug!(
            target: "lockstash.cache",
            path = %writer.path().display(),
            error = %err,
            "abandoning cache entry"
        );
        remove_file_best_effort(writer.path(), "abandon");
        warn_if_release_failed("abandoned cache entry", writer.unlock());
        if let Some(guard) = guard {
            warn_if_release_failed("cache info", guard.unlock());
        }
        err
    }
}

/// Failing to release a lock while already returning another error is logged, not returned.
fn warn_if_release_failed(what: &'static str, result: Result<(), CacheError>) {
    if let Err(err) = result {
        tracing::warn!(target: "lockstash.cache", what, error = %err, "failed to release lock");
    }
}
