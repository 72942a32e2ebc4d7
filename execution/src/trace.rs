use std::collections::BTreeMap;
use std::path::{Path as StdPath, PathBuf};

use action::Dep;
use hashing::Digest;
use serde::{Deserialize, Serialize};

/// The trace DB schema version (§6: ".db"). Bumped whenever `TraceEntry`'s shape changes;
/// a DB written with a different version is discarded wholesale rather than migrated.
pub const TRACE_DB_VERSION: u32 = 6;

/// One stage of dynamically-discovered dependencies an action's execution recorded, in
/// the order they were discovered. Replaying a trace hit re-resolves `deps` and compares
/// the resulting digest against `resolved_digest`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DynamicDepsStage {
  pub deps: Vec<Dep>,
  pub resolved_digest: Digest,
}

/// What is known about a head target's last successful build, keyed by the target's
/// rendered path (§6: "path -> { rule_digest, [(dep_set, digest)]*, targets_digest }").
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
  pub rule_digest: Digest,
  pub dynamic_deps_stages: Vec<DynamicDepsStage>,
  pub targets_digest: Digest,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TraceDbContents {
  entries: BTreeMap<String, TraceEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct VersionedTraceDb {
  version: u32,
  contents: TraceDbContents,
}

/// The persistent trace database, loaded lazily on first use and dumped at end-of-build
/// (§3 lifecycle). An in-memory `BTreeMap` backed by a single bincode-encoded file: the
/// core assumes a single writer (§5), so no finer-grained locking is needed here.
#[derive(Debug, Default)]
pub struct TraceDb {
  contents: TraceDbContents,
  dirty: bool,
}

impl TraceDb {
  pub fn new() -> TraceDb {
    TraceDb::default()
  }

  /// Loads `path`, returning an empty DB (rather than an error) if the file is absent or
  /// was written under a different schema version — a version bump is a deliberate reset,
  /// not a corruption to report.
  pub fn load(path: &StdPath) -> TraceDb {
    let bytes = match std::fs::read(path) {
      Ok(bytes) => bytes,
      Err(_) => return TraceDb::new(),
    };
    match bincode::deserialize::<VersionedTraceDb>(&bytes) {
      Ok(db) if db.version == TRACE_DB_VERSION => TraceDb {
        contents: db.contents,
        dirty: false,
      },
      _ => {
        log::warn!("trace DB at {path:?} is missing or has an incompatible schema version; starting fresh");
        TraceDb::new()
      }
    }
  }

  pub fn get(&self, head_target: &str) -> Option<&TraceEntry> {
    self.contents.entries.get(head_target)
  }

  pub fn insert(&mut self, head_target: String, entry: TraceEntry) {
    self.contents.entries.insert(head_target, entry);
    self.dirty = true;
  }

  pub fn remove(&mut self, head_target: &str) {
    if self.contents.entries.remove(head_target).is_some() {
      self.dirty = true;
    }
  }

  pub fn is_dirty(&self) -> bool {
    self.dirty
  }

  /// Persists the DB to `path` if it has changed since the last save, following the
  /// "persistence is deferred to end-of-build" rule (§5).
  pub fn save(&mut self, path: &StdPath) -> std::io::Result<()> {
    if !self.dirty {
      return Ok(());
    }
    let versioned = VersionedTraceDb {
      version: TRACE_DB_VERSION,
      contents: self.contents.clone(),
    };
    let bytes = bincode::serialize(&versioned)
      .expect("in-memory trace DB must always be serializable");
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    self.dirty = false;
    Ok(())
  }
}

pub fn default_trace_db_path(build_root: &StdPath) -> PathBuf {
  build_root.join(".db")
}

#[cfg(test)]
mod tests {
  use super::*;
  use hashing::Digest;
  use tempfile::TempDir;

  fn digest(n: u8) -> Digest {
    Digest::of_bytes(&[n])
  }

  #[test]
  fn round_trips_through_disk() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(".db");

    let mut db = TraceDb::new();
    db.insert(
      "b.txt".to_string(),
      TraceEntry {
        rule_digest: digest(1),
        dynamic_deps_stages: vec![DynamicDepsStage {
          deps: vec![action::Dep::File(action::Path::Source("a".into()))],
          resolved_digest: digest(3),
        }],
        targets_digest: digest(4),
      },
    );
    db.save(&path).unwrap();

    let reloaded = TraceDb::load(&path);
    assert_eq!(reloaded.get("b.txt"), db.get("b.txt"));
  }

  #[test]
  fn missing_file_is_an_empty_db() {
    let tmp = TempDir::new().unwrap();
    let db = TraceDb::load(&tmp.path().join("nope/.db"));
    assert_eq!(db.get("anything"), None);
  }

  #[test]
  fn unsaved_db_with_no_writes_does_not_touch_disk() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(".db");
    let mut db = TraceDb::new();
    db.save(&path).unwrap();
    assert!(!path.exists());
  }

  #[test]
  fn mismatched_schema_version_resets() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(".db");
    let stale = VersionedTraceDb {
      version: TRACE_DB_VERSION + 1,
      contents: TraceDbContents::default(),
    };
    std::fs::write(&path, bincode::serialize(&stale).unwrap()).unwrap();
    let db = TraceDb::load(&path);
    assert_eq!(db.get("anything"), None);
  }
}
