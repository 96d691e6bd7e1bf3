use flate2::write::GzEncoder;
use flate2::Compression;
use lockstash_cache::{
    Cache, CacheError, DecompressorRegistry, Dispatcher, ErrorClass, LockMode, ReadProbe,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const THREADS: usize = 8;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open_cache(dir: &Path) -> Cache {
    Cache::with_byte_limit(dir, "rc", 1 << 20).unwrap()
}

fn write_gzip(path: &Path, contents: &[u8]) {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(contents).unwrap();
    std::fs::write(path, encoder.finish().unwrap()).unwrap();
}

#[test]
fn exactly_one_of_many_processes_produces_an_entry() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_path_buf();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let dir = dir.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                // Each thread plays a separate process with its own cache handle.
                let cache = open_cache(&dir);
                let entry = cache.cache_file_name("/data/shared.nc.gz").unwrap();
                barrier.wait();

                match cache.create_and_lock(&entry).unwrap() {
                    Some(writer) => {
                        thread::sleep(Duration::from_millis(50));
                        std::fs::write(&entry, b"decompressed").unwrap();
                        let mut guard = cache.lock_cache_info().unwrap();
                        cache.update_cache_info(&mut guard, &entry).unwrap();
                        let reader = cache.downgrade(&guard, writer).unwrap();
                        cache.unlock_cache_info(guard).unwrap();
                        assert_eq!(reader.mode(), LockMode::Shared);
                        cache.unlock(reader).unwrap();
                        true
                    }
                    None => {
                        let reader = cache.get_read_lock(&entry).unwrap().unwrap();
                        assert_eq!(std::fs::read(&entry).unwrap(), b"decompressed");
                        cache.unlock(reader).unwrap();
                        false
                    }
                }
            })
        })
        .collect();

    let producers = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|produced| *produced)
        .count();
    assert_eq!(producers, 1);
    assert_eq!(open_cache(&dir).cache_size().unwrap(), 12);
}

#[test]
fn concurrent_fetches_decompress_once() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    std::fs::create_dir_all(&cache_dir).unwrap();
    let source = tmp.path().join("fnoc1.nc.gz");
    write_gzip(&source, b"netcdf payload");

    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache_dir = cache_dir.clone();
            let source = source.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let cache = open_cache(&cache_dir);
                let mut registry = DecompressorRegistry::new();
                registry.register("gz", move |src: &Path, dst: &Path| -> io::Result<()> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(30));
                    lockstash_cache::gunzip(src, dst)
                });
                let dispatcher = Dispatcher::new(&cache, registry);

                barrier.wait();
                let reader = dispatcher.fetch(&source).unwrap().unwrap();
                let contents = std::fs::read(reader.path()).unwrap();
                cache.unlock(reader).unwrap();
                contents
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), b"netcdf payload");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let status = open_cache(&cache_dir).status().unwrap();
    assert_eq!(status.ledger_bytes, 14);
    assert!(status.is_consistent());
}

#[test]
fn failed_decompression_leaves_nothing_behind() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    std::fs::create_dir_all(&cache_dir).unwrap();
    let source = tmp.path().join("foo.gz");
    write_gzip(&source, b"eventually fine");

    let cache = open_cache(&cache_dir);
    let entry = cache.cache_file_name_for_path(&source).unwrap();

    let mut failing = DecompressorRegistry::new();
    failing.register("gz", |_: &Path, dst: &Path| -> io::Result<()> {
        std::fs::write(dst, b"partial")?;
        Err(io::Error::new(io::ErrorKind::InvalidData, "truncated input"))
    });
    let dispatcher = Dispatcher::new(&cache, failing);

    let err = dispatcher.fetch(&source).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Decompression);
    assert!(matches!(err, CacheError::Decompress { ref source_path, .. } if *source_path == source));
    assert!(!entry.exists());
    assert_eq!(cache.cache_size().unwrap(), 0);

    // Still no stale entry on the next attempt.
    assert!(dispatcher.fetch(&source).is_err());
    assert!(!entry.exists());

    let working = Dispatcher::new(&cache, DecompressorRegistry::with_builtin());
    let reader = working.fetch(&source).unwrap().unwrap();
    assert_eq!(reader.path(), entry.as_path());
    assert_eq!(std::fs::read(reader.path()).unwrap(), b"eventually fine");
    cache.unlock(reader).unwrap();
    assert_eq!(cache.cache_size().unwrap(), 15);
}

#[test]
fn reader_waiting_on_a_failed_producer_sees_absent() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let dir: PathBuf = tmp.path().to_path_buf();
    let producer = open_cache(&dir);
    let entry = producer.cache_file_name("/data/doomed.gz").unwrap();
    let writer = producer.create_and_lock(&entry).unwrap().unwrap();

    let waiter = {
        let dir = dir.clone();
        let entry = entry.clone();
        thread::spawn(move || open_cache(&dir).get_read_lock(&entry).unwrap().is_none())
    };

    thread::sleep(Duration::from_millis(100));
    std::fs::remove_file(&entry).unwrap();
    producer.unlock(writer).unwrap();

    assert!(waiter.join().unwrap());
    assert!(!entry.exists());
}

#[test]
fn try_read_lock_reports_each_state() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open_cache(tmp.path());
    let entry = cache.cache_file_name("/data/x.gz").unwrap();

    assert!(matches!(cache.try_read_lock(&entry).unwrap(), ReadProbe::Absent));

    let writer = cache.create_and_lock(&entry).unwrap().unwrap();
    assert!(matches!(cache.try_read_lock(&entry).unwrap(), ReadProbe::Busy));

    std::fs::write(&entry, b"x").unwrap();
    let mut guard = cache.lock_cache_info().unwrap();
    cache.update_cache_info(&mut guard, &entry).unwrap();
    let reader = cache.downgrade(&guard, writer).unwrap();
    cache.unlock_cache_info(guard).unwrap();

    match cache.try_read_lock(&entry).unwrap() {
        ReadProbe::Locked(second) => cache.unlock(second).unwrap(),
        other => panic!("expected a shared lock, got {other:?}"),
    }
    cache.unlock(reader).unwrap();
}

/// Starts a fetch that waits on an entry this thread created, then swaps that entry for a second
/// unpublished file before releasing the first. The fetch finds its file unlinked, fails to create
/// the entry itself and has to wait for the second file. `publish` decides whether that file is
/// published or removed.
fn fetch_after_losing_the_creation_race(
    publish: bool,
) -> (Result<Option<Vec<u8>>, CacheError>, usize) {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let cache_dir = tmp.path().join("cache");
    std::fs::create_dir_all(&cache_dir).unwrap();
    let source = tmp.path().join("raced.nc.gz");
    write_gzip(&source, b"from the source");

    let holder = open_cache(&cache_dir);
    let entry = holder.cache_file_name_for_path(&source).unwrap();
    let first = holder.create_and_lock(&entry).unwrap().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let cache_dir = cache_dir.clone();
        let source = source.clone();
        let calls = calls.clone();
        thread::spawn(move || -> Result<Option<Vec<u8>>, CacheError> {
            let cache = open_cache(&cache_dir);
            let mut registry = DecompressorRegistry::new();
            registry.register("gz", move |src: &Path, dst: &Path| -> io::Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                lockstash_cache::gunzip(src, dst)
            });
            let dispatcher = Dispatcher::new(&cache, registry);

            match dispatcher.fetch(&source)? {
                Some(reader) => {
                    let contents = std::fs::read(reader.path()).unwrap();
                    cache.unlock(reader)?;
                    Ok(Some(contents))
                }
                None => Ok(None),
            }
        })
    };

    thread::sleep(Duration::from_millis(200));
    std::fs::remove_file(&entry).unwrap();
    let second = holder.create_and_lock(&entry).unwrap().unwrap();
    holder.unlock(first).unwrap();
    thread::sleep(Duration::from_millis(200));

    if publish {
        std::fs::write(&entry, b"from the holder").unwrap();
        let mut guard = holder.lock_cache_info().unwrap();
        holder.update_cache_info(&mut guard, &entry).unwrap();
        let reader = holder.downgrade(&guard, second).unwrap();
        holder.unlock_cache_info(guard).unwrap();
        holder.unlock(reader).unwrap();
    } else {
        std::fs::remove_file(&entry).unwrap();
        holder.unlock(second).unwrap();
    }

    let result = fetcher.join().unwrap();
    (result, calls.load(Ordering::SeqCst))
}

#[test]
fn fetch_that_loses_the_creation_race_reads_the_winners_entry() {
    let (result, calls) = fetch_after_losing_the_creation_race(true);
    assert_eq!(result.unwrap().unwrap(), b"from the holder");
    assert_eq!(calls, 0);
}

#[test]
fn fetch_that_loses_the_creation_race_to_a_failed_producer_reports_vanished() {
    let (result, calls) = fetch_after_losing_the_creation_race(false);
    let err = result.unwrap_err();
    assert!(matches!(err, CacheError::EntryVanished { .. }));
    assert_eq!(err.class(), ErrorClass::Corruption);
    assert_eq!(calls, 0);
}
