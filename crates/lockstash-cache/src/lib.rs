//! A size-bounded on-disk cache shared by independent processes.
//!
//! Cooperating processes coordinate only through advisory file locks (`flock(2)` via `fs2`), with
//! no shared memory and no IPC. The crate guarantees:
//! - at most one producer per cache entry ([`Cache::create_and_lock`] is a test-and-set on the
//!   file name)
//! - any number of concurrent readers of a published entry (shared locks)
//! - bounded disk usage through LRU purging that never deletes a locked entry
//!
//! [`Dispatcher`] is the client of the engine: it maps a compressed source file to the cached,
//! decompressed copy and produces the copy on a miss.
//!
//! ## On-disk layout
//!
//! Everything lives directly in the configured cache directory:
//! - `bes.cache.info`: the cache info file, a single native-endian `u64` holding the total size
//!   in bytes of all published entries. Every change happens under its exclusive lock.
//! - `{prefix}#{mangled}`: one entry per source, see [`cache_file_name`].
//!
//! ## Locking protocol
//!
//! - Entries are created under the exclusive cache info lock and opened by readers under the
//!   shared cache info lock, so a reader never observes a created but unlocked entry.
//! - A producer writes while holding the entry's exclusive lock, then (under the exclusive cache
//!   info lock) adds the entry's size, purges if needed and downgrades to a shared lock.
//! - A producer that fails unlinks its entry before unlocking. Waiting readers notice that the
//!   path no longer names the file they locked and report the entry as absent.

mod cache;
mod config;
mod decompress;
mod dispatch;
mod error;
mod ledger;
mod lock;
mod path;
mod scan;
mod util;

pub use cache::{Cache, CacheStatus, ReadProbe, RebuildReport};
pub use config::{
    CacheConfig, BYTES_PER_MEGABYTE, ENV_CACHE_DIR, ENV_CACHE_MAX_SIZE_MB, ENV_CACHE_PREFIX,
    MAX_CACHE_SIZE_IN_BYTES, MAX_CACHE_SIZE_IN_MEGABYTES,
};
pub use decompress::{gunzip, unzstd};
pub use dispatch::{Decompressor, DecompressorRegistry, Dispatcher};
pub use error::{CacheError, ErrorClass};
pub use ledger::{LedgerGuard, SizeLedger, CACHE_INFO_FILENAME};
pub use lock::{LockMode, LockedFile};
pub use path::{cache_file_name, cache_file_name_for_path, CACHE_NAME_SEPARATOR};
pub use scan::{CacheEntryRecord, EvictOutcome, PurgeReport};
