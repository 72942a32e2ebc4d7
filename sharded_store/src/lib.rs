// Copyright contributors to this project.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments,
  clippy::new_without_default,
  clippy::new_ret_no_self,
  clippy::mutex_atomic
)]

//! The shared cache backing `restore_artifacts`/`store_artifacts` (§6): an LMDB-backed,
//! sharded, leased store keyed by rule digest, each entry holding the digests and bytes of
//! every target a rule produced. Sharding and leasing follow the same design as this
//! workspace's other LMDB-backed stores: one LMDB environment per shard (keyed by the
//! high bits of the key, so that writes to different shards can proceed without
//! contending for the same environment's single writer), and a separate `leases`
//! database recording when each entry may be garbage collected.

mod bundle;
mod shard;

pub use bundle::{Bundle, TargetEntry};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use hashing::Digest;
use task_executor::Executor;
use thiserror::Error;

use shard::Shards;

/// The lease time new entries are stored with, absent an explicit override. Short enough
/// that an idle shared cache can reclaim space, long enough that a build running every few
/// minutes never has to refetch.
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
  #[error("lmdb error: {0}")]
  Lmdb(String),
  #[error("failed to (de)serialize a stored bundle: {0}")]
  Codec(String),
  #[error("shard count must be a power of two, got {0}")]
  InvalidShardCount(u8),
}

/// The outcome of `restore_artifacts`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RestoreOutcome {
  Restored(Vec<(PathBuf, Digest)>),
  NotFound,
}

/// The outcome of `store_artifacts`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreOutcome {
  Stored,
  AlreadyPresent,
  /// A bundle was already present under this key but its content differs from what this
  /// execution just produced: the action is non-deterministic, and the store's existing
  /// entry is left untouched rather than being silently overwritten (§4.F step 8g).
  WillNotStoreNonDeterminism(String),
}

/// A sharded, leased, LMDB-backed cache of rule-digest -> target bundle.
#[derive(Clone)]
pub struct ShardedStore {
  shards: Shards,
  lease_time: Duration,
}

impl ShardedStore {
  pub fn new(
    root_path: PathBuf,
    max_size: usize,
    executor: Executor,
    lease_time: Duration,
    shard_count: u8,
  ) -> Result<ShardedStore, StoreError> {
    let shards = Shards::new(root_path, max_size, executor, shard_count)?;
    Ok(ShardedStore { shards, lease_time })
  }

  /// Looks up `rule_digest`, and if present, returns the digest of each target it holds
  /// (§6 `restore_artifacts`). Writing the bytes to `target_dir` is the caller's
  /// responsibility (`execution` crate), since this crate has no opinion on filesystem
  /// layout beyond what it stores internally.
  pub async fn restore_artifacts(
    &self,
    rule_digest: Digest,
  ) -> Result<(RestoreOutcome, Option<Bundle>), StoreError> {
    match self.shards.load(rule_digest.hash).await? {
      Some(bundle) => {
        self.shards.touch_lease(rule_digest.hash, self.lease_time).await?;
        let digests = bundle
          .targets
          .iter()
          .map(|(path, entry)| (path.clone(), entry.digest))
          .collect();
        Ok((RestoreOutcome::Restored(digests), Some(bundle)))
      }
      None => Ok((RestoreOutcome::NotFound, None)),
    }
  }

  /// Stores the targets a rule just produced under `rule_digest` (§6 `store_artifacts`).
  /// `compute_bundle_digest` is used to detect non-determinism against an
  /// already-present entry rather than trusting equality of the raw bytes, mirroring how
  /// the rule digest itself is computed from a `Facts` digest rather than raw content.
  pub async fn store_artifacts(
    &self,
    rule_digest: Digest,
    targets: BTreeMap<PathBuf, TargetEntry>,
  ) -> Result<StoreOutcome, StoreError> {
    let bundle = Bundle { targets };
    if let Some(existing) = self.shards.load(rule_digest.hash).await? {
      return if existing.digest() == bundle.digest() {
        self
          .shards
          .touch_lease(rule_digest.hash, self.lease_time)
          .await?;
        Ok(StoreOutcome::AlreadyPresent)
      } else {
        Ok(StoreOutcome::WillNotStoreNonDeterminism(format!(
          "stored bundle for {rule_digest:?} differs from the one just produced"
        )))
      };
    }
    self
      .shards
      .store(rule_digest.hash, &bundle, self.lease_time)
      .await?;
    Ok(StoreOutcome::Stored)
  }

  /// Removes every entry whose lease has expired, returning how many were reclaimed.
  pub async fn collect_garbage(&self) -> Result<usize, StoreError> {
    self.shards.collect_garbage().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use hashing::Fingerprint;
  use tempfile::TempDir;

  fn test_executor() -> Executor {
    Executor::from_handle(tokio::runtime::Handle::current())
  }

  fn digest_for(n: u8) -> Digest {
    let mut bytes = [0_u8; hashing::FINGERPRINT_SIZE];
    bytes[0] = n;
    Digest::new(Fingerprint(bytes), n as usize)
  }

  #[tokio::test]
  async fn store_then_restore_round_trips() {
    let tmp = TempDir::new().unwrap();
    let store = ShardedStore::new(
      tmp.path().to_path_buf(),
      1024 * 1024,
      test_executor(),
      DEFAULT_LEASE_TIME,
      4,
    )
    .unwrap();

    let rule_digest = digest_for(7);
    let mut targets = BTreeMap::new();
    targets.insert(
      PathBuf::from("out.txt"),
      TargetEntry {
        digest: Digest::of_bytes(b"hi"),
        bytes: b"hi".to_vec(),
      },
    );

    let outcome = store
      .store_artifacts(rule_digest, targets.clone())
      .await
      .unwrap();
    assert_eq!(outcome, StoreOutcome::Stored);

    let (restored, bundle) = store.restore_artifacts(rule_digest).await.unwrap();
    match restored {
      RestoreOutcome::Restored(entries) => assert_eq!(entries.len(), 1),
      RestoreOutcome::NotFound => panic!("expected a hit"),
    }
    assert_eq!(bundle.unwrap().targets, targets);
  }

  #[tokio::test]
  async fn restore_missing_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let store = ShardedStore::new(
      tmp.path().to_path_buf(),
      1024 * 1024,
      test_executor(),
      DEFAULT_LEASE_TIME,
      4,
    )
    .unwrap();

    let (restored, bundle) = store.restore_artifacts(digest_for(9)).await.unwrap();
    assert_eq!(restored, RestoreOutcome::NotFound);
    assert!(bundle.is_none());
  }

  #[tokio::test]
  async fn storing_different_content_under_same_digest_is_nondeterminism() {
    let tmp = TempDir::new().unwrap();
    let store = ShardedStore::new(
      tmp.path().to_path_buf(),
      1024 * 1024,
      test_executor(),
      DEFAULT_LEASE_TIME,
      4,
    )
    .unwrap();

    let rule_digest = digest_for(3);
    let mut first = BTreeMap::new();
    first.insert(
      PathBuf::from("out.txt"),
      TargetEntry {
        digest: Digest::of_bytes(b"a"),
        bytes: b"a".to_vec(),
      },
    );
    let mut second = BTreeMap::new();
    second.insert(
      PathBuf::from("out.txt"),
      TargetEntry {
        digest: Digest::of_bytes(b"b"),
        bytes: b"b".to_vec(),
      },
    );

    store.store_artifacts(rule_digest, first).await.unwrap();
    let outcome = store.store_artifacts(rule_digest, second).await.unwrap();
    assert!(matches!(
      outcome,
      StoreOutcome::WillNotStoreNonDeterminism(_)
    ));
  }

  #[tokio::test]
  async fn invalid_shard_count_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let result = ShardedStore::new(
      tmp.path().to_path_buf(),
      1024 * 1024,
      test_executor(),
      DEFAULT_LEASE_TIME,
      3,
    );
    assert!(matches!(result, Err(StoreError::InvalidShardCount(3))));
  }
}
