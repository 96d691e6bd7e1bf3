//! Built-in decompressors.
//!
//! Each one writes into an existing, already locked target and removes it again on failure so no
//! half-written entry stays behind.

use crate::util::remove_file_best_effort;
use flate2::read::MultiGzDecoder;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

/// Decompress a (possibly multi-member) gzip file.
pub fn gunzip(source: &Path, target: &Path) -> io::Result<()> {
    with_cleanup(target, "gunzip", || {
        let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(source)?));
        let mut out = open_target(target)?;
        io::copy(&mut decoder, &mut out)?;
        finish(out)
    })
}

/// Decompress a zstd frame stream.
pub fn unzstd(source: &Path, target: &Path) -> io::Result<()> {
    with_cleanup(target, "unzstd", || {
        let input = BufReader::new(File::open(source)?);
        let mut out = open_target(target)?;
        zstd::stream::copy_decode(input, &mut out)?;
        finish(out)
    })
}

fn open_target(target: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(target)?;
    Ok(BufWriter::new(file))
}

fn finish(out: BufWriter<File>) -> io::Result<()> {
    let file = out.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()
}

fn with_cleanup(
    target: &Path,
    reason: &'static str,
    run: impl FnOnce() -> io::Result<()>,
) -> io::Result<()> {
    let result = run();
    if result.is_err() {
        remove_file_best_effort(target, reason);
    }
    result
}
