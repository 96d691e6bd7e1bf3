use crate::error::CacheError;
use std::path::{Path, PathBuf};

/// Separator between the prefix and the mangled source path, and the replacement for `/`.
pub const CACHE_NAME_SEPARATOR: char = '#';

/// Build the cache file name holding the decompressed copy of `source`.
///
/// A single leading `/` is dropped, every remaining `/` becomes `#`, and the last `.`-delimited
/// extension is stripped. For example `/usr/lib/data/fnoc1.nc.gz` with prefix `rc` maps to
/// `{cache_dir}/rc#usr#lib#data#fnoc1.nc`.
///
/// This is a pure function of its inputs and never touches the filesystem. Distinct sources that
/// mangle to the same name share one cache file.
pub fn cache_file_name(cache_dir: &Path, prefix: &str, source: &str) -> Result<PathBuf, CacheError> {
    if source.is_empty() {
        return Err(CacheError::EmptySourcePath);
    }

    let trimmed = source.strip_prefix('/').unwrap_or(source);
    let mut mangled = trimmed.replace('/', "#");
    if let Some(dot) = mangled.rfind('.') {
        mangled.truncate(dot);
    }

    Ok(cache_dir.join(format!("{prefix}{CACHE_NAME_SEPARATOR}{mangled}")))
}

/// Like [`cache_file_name`] for a filesystem path.
pub fn cache_file_name_for_path(
    cache_dir: &Path,
    prefix: &str,
    source: &Path,
) -> Result<PathBuf, CacheError> {
    let source_str = source.to_str().ok_or_else(|| CacheError::NonUtf8Path {
        path: source.to_path_buf(),
    })?;
    cache_file_name(cache_dir, prefix, source_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(source: &str) -> String {
        cache_file_name(Path::new("/cache"), "rc", source)
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn mangles_slashes_and_drops_the_extension() {
        assert_eq!(name("/usr/lib/data/fnoc1.nc.gz"), "/cache/rc#usr#lib#data#fnoc1.nc");
        assert_eq!(name("data/file.bz2"), "/cache/rc#data#file");
        assert_eq!(name("/noext"), "/cache/rc#noext");
    }

    #[test]
    fn only_one_leading_slash_is_stripped() {
        assert_eq!(name("//a/b.gz"), "/cache/rc##a#b");
    }

    #[test]
    fn strips_the_last_dot_anywhere_in_the_mangled_path() {
        assert_eq!(name("/dir.d/file"), "/cache/rc#dir");
    }

    #[test]
    fn derived_names_are_stable_and_flat() {
        for source in ["/a/b/c.gz", "x.Z", "/deep/ly/nested/dir/data.nc.zst", "plain"] {
            let first = cache_file_name(Path::new("/cache"), "rc", source).unwrap();
            let second = cache_file_name(Path::new("/cache"), "rc", source).unwrap();
            assert_eq!(first, second);

            let file_name = first.file_name().unwrap().to_str().unwrap();
            assert!(file_name.starts_with("rc#"));
            assert!(!file_name.contains('/'));
            assert_eq!(first.parent().unwrap(), Path::new("/cache"));
        }
    }

    #[test]
    fn empty_source_is_rejected() {
        assert!(matches!(
            cache_file_name(Path::new("/cache"), "rc", ""),
            Err(CacheError::EmptySourcePath)
        ));
    }
}
