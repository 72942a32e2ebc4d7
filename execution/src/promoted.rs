use std::collections::BTreeSet;
use std::path::{Path as StdPath, PathBuf};

use serde::{Deserialize, Serialize};

/// The persistent set of source-tree paths a `Promote`-mode rule has written to (§3,
/// §6: ".to-delete-in-source-tree"), so that a later `clean` can remove exactly what the
/// build placed outside the build tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PromotedToDeleteSet {
  entries: BTreeSet<PathBuf>,
  #[serde(skip)]
  dirty: bool,
}

impl PromotedToDeleteSet {
  pub fn new() -> PromotedToDeleteSet {
    PromotedToDeleteSet::default()
  }

  pub fn load(path: &StdPath) -> PromotedToDeleteSet {
    let bytes = match std::fs::read(path) {
      Ok(bytes) => bytes,
      Err(_) => return PromotedToDeleteSet::new(),
    };
    match bincode::deserialize::<BTreeSet<PathBuf>>(&bytes) {
      Ok(entries) => PromotedToDeleteSet {
        entries,
        dirty: false,
      },
      Err(_) => {
        log::warn!("promoted-to-delete set at {path:?} is unreadable; starting fresh");
        PromotedToDeleteSet::new()
      }
    }
  }

  pub fn insert(&mut self, path: PathBuf) {
    if self.entries.insert(path) {
      self.dirty = true;
    }
  }

  pub fn remove(&mut self, path: &StdPath) {
    if self.entries.remove(path) {
      self.dirty = true;
    }
  }

  pub fn contains(&self, path: &StdPath) -> bool {
    self.entries.contains(path)
  }

  pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
    self.entries.iter()
  }

  pub fn is_dirty(&self) -> bool {
    self.dirty
  }

  pub fn save(&mut self, path: &StdPath) -> std::io::Result<()> {
    if !self.dirty {
      return Ok(());
    }
    let bytes =
      bincode::serialize(&self.entries).expect("an in-memory path set must always serialize");
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    self.dirty = false;
    Ok(())
  }
}

pub fn default_promoted_set_path(build_root: &StdPath) -> PathBuf {
  build_root.join(".to-delete-in-source-tree")
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn round_trips_through_disk() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(".to-delete-in-source-tree");

    let mut set = PromotedToDeleteSet::new();
    set.insert(PathBuf::from("gen.ml"));
    set.save(&path).unwrap();

    let reloaded = PromotedToDeleteSet::load(&path);
    assert!(reloaded.contains(&PathBuf::from("gen.ml")));
  }

  #[test]
  fn removal_takes_effect_after_reload() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(".to-delete-in-source-tree");

    let mut set = PromotedToDeleteSet::new();
    set.insert(PathBuf::from("gen.ml"));
    set.save(&path).unwrap();

    let mut reloaded = PromotedToDeleteSet::load(&path);
    reloaded.remove(&PathBuf::from("gen.ml"));
    reloaded.save(&path).unwrap();

    assert!(!PromotedToDeleteSet::load(&path).contains(&PathBuf::from("gen.ml")));
  }
}
