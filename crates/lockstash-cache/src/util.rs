use filetime::FileTime;
use serde::Serializer;
use std::path::Path;

/// Remove `path`, treating an already-missing file as success. Failures are logged, not returned.
pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::warn!(
                target: "lockstash.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

/// Milliseconds since the unix epoch, clamped to zero for pre-epoch timestamps.
pub(crate) fn file_time_millis(time: FileTime) -> u64 {
    let seconds = time.unix_seconds();
    if seconds < 0 {
        return 0;
    }
    (seconds as u64)
        .saturating_mul(1000)
        .saturating_add(u64::from(time.nanoseconds() / 1_000_000))
}

pub(crate) fn serialize_file_time_millis<S: Serializer>(
    time: &FileTime,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(file_time_millis(*time))
}
