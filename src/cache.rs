//! Filesystem response cache
//!
//! Entries live at `root/host/<path segments>`: transformed text gets a
//! `.cache` suffix, saved images are stored under their own name. Freshness is
//! the file's mtime plus the site's TTL.

use crate::classify;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const TEXT_SUFFIX: &str = ".cache";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to inspect cache entry {path}: {source}")]
    Stat { path: PathBuf, source: io::Error },
    #[error("failed to read cache entry {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write cache entry {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Why a lookup did not produce a servable entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    NotFound,
    Stale,
    NameTooLong,
    IsDirectory,
}

#[derive(Debug)]
pub enum CacheLookup {
    Hit(CachedEntry),
    Miss(MissReason),
}

#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub path: PathBuf,
    pub body: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    save_images: bool,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, save_images: bool) -> Self {
        Self {
            root: root.into(),
            save_images,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn saves_images(&self) -> bool {
        self.save_images
    }

    /// Directory-safe location for `(host, path)` without any suffix
    fn key_path(&self, host: &str, path: &str) -> PathBuf {
        let mut out = self.root.clone();
        out.push(sanitize_segment(host).unwrap_or("_"));

        let path = classify::canonical_path(path);
        let mut pushed = false;
        for segment in path.split('/').filter_map(sanitize_segment) {
            out.push(segment);
            pushed = true;
        }
        if !pushed {
            out.push(classify::HOME_CACHE_KEY.trim_start_matches('/'));
        }
        out
    }

    /// File backing the entry for `(host, path)`
    pub fn entry_path(&self, host: &str, path: &str) -> PathBuf {
        let key = self.key_path(host, path);
        if self.save_images && classify::is_image_path(path) {
            key
        } else {
            with_suffix(key, TEXT_SUFFIX)
        }
    }

    /// Find a fresh entry for `(host, path)`
    pub fn lookup(
        &self,
        host: &str,
        path: &str,
        ttl_minutes: i64,
        now: SystemTime,
    ) -> Result<CacheLookup, CacheError> {
        let file = self.entry_path(host, path);

        let metadata = match fs::metadata(&file) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %file.display(), "Cache miss");
                return Ok(CacheLookup::Miss(MissReason::NotFound));
            }
            Err(e) if is_name_too_long(&e) => {
                warn!(path = %file.display(), "Cache file name too long");
                return Ok(CacheLookup::Miss(MissReason::NameTooLong));
            }
            Err(source) => return Err(CacheError::Stat { path: file, source }),
        };

        let modified = metadata
            .modified()
            .map_err(|source| CacheError::Stat { path: file.clone(), source })?;
        if !is_fresh(modified, ttl_minutes, now) {
            debug!(path = %file.display(), "Cache entry expired");
            return Ok(CacheLookup::Miss(MissReason::Stale));
        }
        if metadata.is_dir() {
            warn!(path = %file.display(), "Cache entry is a directory");
            return Ok(CacheLookup::Miss(MissReason::IsDirectory));
        }

        let body = fs::read(&file).map_err(|source| CacheError::Read { path: file.clone(), source })?;
        Ok(CacheLookup::Hit(CachedEntry {
            path: file,
            body,
            content_type: classify::content_type_for_path(classify::canonical_path(path)),
        }))
    }

    /// Store a transformed text body for `(host, path)`
    pub fn store(&self, host: &str, path: &str, body: &[u8]) -> Result<PathBuf, CacheError> {
        let file = with_suffix(self.key_path(host, path), TEXT_SUFFIX);
        write_atomic(&file, body)?;
        Ok(file)
    }

    /// Store an origin image verbatim for `(host, path)`
    pub fn store_image(&self, host: &str, path: &str, body: &[u8]) -> Result<PathBuf, CacheError> {
        let file = self.key_path(host, path.trim_end_matches('/'));
        write_atomic(&file, body)?;
        Ok(file)
    }
}

/// Whether an entry modified at `modified` is still fresh at `now`.
///
/// Stale iff `now > modified + ttl_minutes * 60`, compared in whole seconds.
pub fn is_fresh(modified: SystemTime, ttl_minutes: i64, now: SystemTime) -> bool {
    let modified = unix_seconds(modified);
    let now = unix_seconds(now);
    now <= modified.saturating_add(ttl_minutes.saturating_mul(60))
}

fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

fn sanitize_segment(segment: &str) -> Option<&str> {
    match segment {
        "" | "." | ".." => None,
        s if s.contains('\\') || s.contains('\0') => None,
        s => Some(s),
    }
}

fn with_suffix(path: PathBuf, suffix: &str) -> PathBuf {
    let mut raw = path.into_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Write through a temp file in the target directory, then rename into place
fn write_atomic(file: &Path, body: &[u8]) -> Result<(), CacheError> {
    let wrap = |source: io::Error| CacheError::Write {
        path: file.to_path_buf(),
        source,
    };

    let dir = file.parent().ok_or_else(|| {
        wrap(io::Error::new(io::ErrorKind::InvalidInput, "cache path has no parent"))
    })?;
    fs::create_dir_all(dir).map_err(wrap)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(wrap)?;
    tmp.write_all(body).map_err(wrap)?;
    tmp.persist(file).map_err(|e| wrap(e.error))?;

    debug!(path = %file.display(), bytes = body.len(), "Cache entry written");
    Ok(())
}

#[cfg(unix)]
fn is_name_too_long(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENAMETOOLONG)
}

#[cfg(not(unix))]
fn is_name_too_long(_err: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn hit_body(lookup: CacheLookup) -> Vec<u8> {
        match lookup {
            CacheLookup::Hit(entry) => entry.body,
            CacheLookup::Miss(reason) => panic!("expected hit, got {:?}", reason),
        }
    }

    #[test]
    fn test_ttl_boundary() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert!(is_fresh(now - Duration::from_secs(299), 5, now));
        assert!(is_fresh(now - Duration::from_secs(300), 5, now));
        assert!(!is_fresh(now - Duration::from_secs(301), 5, now));
        assert!(!is_fresh(now - Duration::from_secs(1), 0, now));
    }

    #[test]
    fn test_home_aliases_share_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path(), false);

        cache.store("mirror.net", "/index.php", b"<html>home</html>").unwrap();
        assert!(dir.path().join("mirror.net/index.html.cache").is_file());

        let lookup = cache.lookup("mirror.net", "/", 60, SystemTime::now()).unwrap();
        match lookup {
            CacheLookup::Hit(entry) => {
                assert_eq!(entry.body, b"<html>home</html>");
                assert_eq!(entry.content_type, "text/html; charset=utf-8");
            }
            CacheLookup::Miss(reason) => panic!("expected hit, got {:?}", reason),
        }
    }

    #[test]
    fn test_lookup_stale_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path(), false);
        let file = cache.store("mirror.net", "/a.css", b"body{}").unwrap();

        let modified = SystemTime::now() - Duration::from_secs(301);
        fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(modified)
            .unwrap();

        let lookup = cache.lookup("mirror.net", "/a.css", 5, SystemTime::now()).unwrap();
        assert!(matches!(lookup, CacheLookup::Miss(MissReason::Stale)));

        let lookup = cache.lookup("mirror.net", "/a.css", 10, SystemTime::now()).unwrap();
        assert_eq!(hit_body(lookup), b"body{}");
    }

    #[test]
    fn test_lookup_missing_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path(), false);

        let lookup = cache.lookup("mirror.net", "/nope.html", 5, SystemTime::now()).unwrap();
        assert!(matches!(lookup, CacheLookup::Miss(MissReason::NotFound)));

        fs::create_dir_all(dir.path().join("mirror.net/dir.cache")).unwrap();
        let lookup = cache.lookup("mirror.net", "/dir", 5, SystemTime::now()).unwrap();
        assert!(matches!(lookup, CacheLookup::Miss(MissReason::IsDirectory)));
    }

    #[cfg(unix)]
    #[test]
    fn test_name_too_long_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path(), false);
        let path = format!("/{}", "a".repeat(400));

        let lookup = cache.lookup("mirror.net", &path, 5, SystemTime::now()).unwrap();
        assert!(matches!(lookup, CacheLookup::Miss(MissReason::NameTooLong)));
    }

    #[test]
    fn test_keys_cannot_escape_host_dir() {
        let cache = CacheStore::new("/cache", false);
        assert_eq!(
            cache.entry_path("mirror.net", "/../../etc/passwd"),
            PathBuf::from("/cache/mirror.net/etc/passwd.cache")
        );
        assert_eq!(
            cache.entry_path("mirror.net", "/.."),
            PathBuf::from("/cache/mirror.net/index.html.cache")
        );
        assert_eq!(
            cache.entry_path("mirror.net", "/news//1.html"),
            PathBuf::from("/cache/mirror.net/news/1.html.cache")
        );
    }

    #[test]
    fn test_images_stored_without_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path(), true);

        cache.store_image("mirror.net", "/img/logo.png", b"\x89PNG").unwrap();
        assert_eq!(cache.entry_path("mirror.net", "/img/logo.png"), dir.path().join("mirror.net/img/logo.png"));

        let lookup = cache.lookup("mirror.net", "/img/logo.png", 5, SystemTime::now()).unwrap();
        match lookup {
            CacheLookup::Hit(entry) => {
                assert_eq!(entry.body, b"\x89PNG");
                assert_eq!(entry.content_type, "image/png");
            }
            CacheLookup::Miss(reason) => panic!("expected hit, got {:?}", reason),
        }

        let no_images = CacheStore::new(dir.path(), false);
        assert_eq!(
            no_images.entry_path("mirror.net", "/img/logo.png"),
            dir.path().join("mirror.net/img/logo.png.cache")
        );
    }
}
