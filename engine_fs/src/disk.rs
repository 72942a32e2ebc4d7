use std::path::{Path as StdPath, PathBuf};

use async_trait::async_trait;

/// The filesystem operations `load_dir` needs, abstracted so that the loader's algorithm
/// (§4.E) can be exercised without touching a real disk. `RealDisk` is the only
/// production implementation; tests may supply a lighter fake.
#[async_trait]
pub trait Disk: Send + Sync {
  /// Lists the basenames of `dir`'s immediate entries, tagged with whether each is itself
  /// a directory. Non-existent directories return an empty listing rather than an error
  /// (§4.E triage: "External path -> readdir, tolerate ENOENT").
  async fn read_dir(&self, dir: &StdPath) -> std::io::Result<Vec<(String, bool)>>;

  async fn remove_file(&self, path: &StdPath) -> std::io::Result<()>;

  async fn remove_dir_all(&self, path: &StdPath) -> std::io::Result<()>;

  async fn create_dir_all(&self, path: &StdPath) -> std::io::Result<()>;

  async fn exists(&self, path: &StdPath) -> bool;
}

pub struct RealDisk;

#[async_trait]
impl Disk for RealDisk {
  async fn read_dir(&self, dir: &StdPath) -> std::io::Result<Vec<(String, bool)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
      Ok(entries) => entries,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(err) => return Err(err),
    };
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
      let file_type = entry.file_type().await?;
      let name = entry.file_name().to_string_lossy().into_owned();
      out.push((name, file_type.is_dir()));
    }
    out.sort();
    Ok(out)
  }

  async fn remove_file(&self, path: &StdPath) -> std::io::Result<()> {
    tokio::fs::remove_file(path).await
  }

  async fn remove_dir_all(&self, path: &StdPath) -> std::io::Result<()> {
    tokio::fs::remove_dir_all(path).await
  }

  async fn create_dir_all(&self, path: &StdPath) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await
  }

  async fn exists(&self, path: &StdPath) -> bool {
    tokio::fs::metadata(path).await.is_ok()
  }
}

pub fn join(root: &StdPath, relative: &StdPath) -> PathBuf {
  root.join(relative)
}
