//! The on-disk include cache: one file per reference, named by
//! `fingerprint::fingerprint_path`, no metadata sidecar (spec.md §3, §4.4).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::exclusion::ExclusionMatcher;
use crate::fingerprint::fingerprint_path;

/// Owns a cache directory and a policy for which references may be
/// stored in it.
pub struct FileCache {
    cache_dir: PathBuf,
    exclusions: ExclusionMatcher,
}

impl FileCache {
    pub fn new(cache_dir: impl Into<PathBuf>, exclusions: ExclusionMatcher) -> Self {
        FileCache {
            cache_dir: cache_dir.into(),
            exclusions,
        }
    }

    pub fn is_excluded(&self, reference: &str) -> bool {
        self.exclusions.is_excluded(reference)
    }

    /// The fingerprint path for `reference`, without touching disk.
    pub fn cached_path(&self, reference: &str) -> PathBuf {
        self.cache_dir.join(fingerprint_path(reference))
    }

    /// Returns the cached body if the fingerprint file exists.
    pub fn find(&self, reference: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.cached_path(reference);
        match fs::read(&path) {
            Ok(bytes) => {
                debug!("cache hit for \"{}\" at {}", reference, path.display());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes `body` at the fingerprint path, creating the cache
    /// directory lazily. Writes go to a temp file in the same directory
    /// and are renamed into place, so a concurrent reader never observes
    /// a partially written cache entry (spec.md §5).
    pub fn store(&self, reference: &str, body: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        let target = self.cached_path(reference);
        let tmp = self.temp_path(reference);
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &target)?;
        debug!("cached \"{}\" at {}", reference, target.display());
        Ok(())
    }

    /// Removes the cache directory recursively. A missing directory is
    /// not an error.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.cache_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn temp_path(&self, reference: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.tmp", fingerprint_path(reference)))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_then_find_round_trips() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path(), ExclusionMatcher::empty());
        cache.store("github:a/b/c.txt", b"cached").unwrap();
        assert_eq!(
            cache.find("github:a/b/c.txt").unwrap(),
            Some(b"cached".to_vec())
        );
    }

    #[test]
    fn find_on_empty_cache_is_none() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path(), ExclusionMatcher::empty());
        assert_eq!(cache.find("nothing/here.txt").unwrap(), None);
    }

    #[test]
    fn clear_after_store_removes_entry() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path(), ExclusionMatcher::empty());
        cache.store("a.txt", b"body").unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.find("a.txt").unwrap(), None);
    }

    #[test]
    fn clear_on_missing_directory_is_not_an_error() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("does-not-exist-yet");
        let cache = FileCache::new(nested, ExclusionMatcher::empty());
        assert!(cache.clear().is_ok());
    }

    #[test]
    fn store_creates_cache_directory_lazily() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested/cache");
        let cache = FileCache::new(&nested, ExclusionMatcher::empty());
        assert!(!nested.exists());
        cache.store("a.txt", b"body").unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn cached_path_does_not_touch_disk() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path(), ExclusionMatcher::empty());
        let path = cache.cached_path("a.txt");
        assert!(!path.exists());
    }
}
