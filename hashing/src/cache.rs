use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::Digest;

/// The portion of a file's metadata that is cheap to `stat` and that, when unchanged,
/// lets us trust a previously computed digest without re-reading the file's content.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct StatKey {
  mtime: Option<SystemTime>,
  size: u64,
  inode: Option<u64>,
  is_executable: bool,
}

impl StatKey {
  fn of(metadata: &fs::Metadata) -> StatKey {
    StatKey {
      mtime: metadata.modified().ok(),
      size: metadata.len(),
      inode: inode_of(metadata),
      is_executable: is_executable(metadata),
    }
  }
}

#[cfg(unix)]
fn inode_of(metadata: &fs::Metadata) -> Option<u64> {
  use std::os::unix::fs::MetadataExt;
  Some(metadata.ino())
}

#[cfg(not(unix))]
fn inode_of(_metadata: &fs::Metadata) -> Option<u64> {
  None
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
  false
}

/// An in-memory cache of `path -> (StatKey, Digest)`, invalidated per-path whenever the
/// path's stat metadata no longer matches what was observed the last time it was hashed.
///
/// This avoids re-reading file content on every build when nothing has touched the file,
/// while remaining correct in the face of external edits: any metadata drift forces a
/// re-read rather than trusting stale content.
pub struct CachedDigest {
  entries: Mutex<HashMap<std::path::PathBuf, (StatKey, Digest)>>,
}

impl CachedDigest {
  pub fn new() -> CachedDigest {
    CachedDigest {
      entries: Mutex::new(HashMap::new()),
    }
  }

  /// Returns the digest of the file at `path`, using the cache if the file's stat key
  /// has not changed since it was last observed. If `remove_write_permissions` is set,
  /// the file's write bits are cleared before (re-)hashing, so that hardlink-sharing the
  /// content with a content-addressed store cannot be invalidated by accidental edits.
  pub fn refresh(&self, path: &Path, remove_write_permissions: bool) -> io::Result<Digest> {
    let metadata = match fs::symlink_metadata(path) {
      Ok(m) => m,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(e),
      Err(e) => return Err(e),
    };
    let stat_key = StatKey::of(&metadata);

    if let Some((cached_key, digest)) = self.entries.lock().unwrap().get(path) {
      if *cached_key == stat_key {
        return Ok(*digest);
      }
    }

    if remove_write_permissions {
      clear_write_bit(path)?;
    }

    let content = fs::read(path)?;
    let digest = Digest::of_bytes(&content);
    self
      .entries
      .lock()
      .unwrap()
      .insert(path.to_path_buf(), (stat_key, digest));
    Ok(digest)
  }

  /// Drops any cached entry for `path`, forcing the next `refresh` to re-stat and
  /// (if necessary) re-read the content.
  pub fn invalidate(&self, path: &Path) {
    self.entries.lock().unwrap().remove(path);
  }

  pub fn len(&self) -> usize {
    self.entries.lock().unwrap().len()
  }
}

#[cfg(unix)]
fn clear_write_bit(path: &Path) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  let metadata = fs::metadata(path)?;
  let mut perms = metadata.permissions();
  perms.set_mode(perms.mode() & !0o222);
  fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn clear_write_bit(_path: &Path) -> io::Result<()> {
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::CachedDigest;
  use std::fs;
  use std::io::Write;

  #[test]
  fn refresh_caches_until_content_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");
    fs::write(&path, b"one").unwrap();

    let cache = CachedDigest::new();
    let first = cache.refresh(&path, false).unwrap();
    assert_eq!(cache.len(), 1);

    // Re-reading without touching the file returns the same digest from cache.
    let second = cache.refresh(&path, false).unwrap();
    assert_eq!(first, second);

    // Changing content (and therefore size/mtime) invalidates the cached entry.
    std::thread::sleep(std::time::Duration::from_millis(10));
    let mut f = fs::OpenOptions::new().write(true).open(&path).unwrap();
    f.write_all(b"two-longer").unwrap();
    drop(f);

    let third = cache.refresh(&path, false).unwrap();
    assert_ne!(first, third);
  }

  #[test]
  fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing");
    let cache = CachedDigest::new();
    assert!(cache.refresh(&path, false).is_err());
  }
}
