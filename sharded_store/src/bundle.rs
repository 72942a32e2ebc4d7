use std::collections::BTreeMap;
use std::path::PathBuf;

use hashing::Digest;
use serde::{Deserialize, Serialize};

/// One target a rule produced: its digest (as recorded in the trace database) alongside
/// the bytes themselves, so that a cache hit can restore the target without a further
/// round trip to whatever produced it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TargetEntry {
  pub digest: Digest,
  pub bytes: Vec<u8>,
}

/// Everything stored under a single rule digest: every target path the rule declared,
/// mapped to its content. Small enough bundles (source-like outputs) are stored inline
/// rather than fanned out into a separate content-addressed table, which is the
/// simplification this crate makes relative to a store keyed by individual file digest.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
  pub targets: BTreeMap<PathBuf, TargetEntry>,
}

impl Bundle {
  /// A digest over the bundle's full content, used to detect whether two stores of the
  /// same rule digest actually produced the same bytes (non-determinism detection).
  pub fn digest(&self) -> Digest {
    let mut buf = Vec::new();
    for (path, entry) in &self.targets {
      buf.extend_from_slice(path.to_string_lossy().as_bytes());
      buf.push(0);
      buf.extend_from_slice(entry.digest.hash.as_bytes());
      buf.extend_from_slice(&entry.digest.size_bytes.to_le_bytes());
    }
    Digest::of_bytes(&buf)
  }
}
