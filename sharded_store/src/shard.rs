use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hashing::{Fingerprint, FINGERPRINT_SIZE};
use lmdb::{
  Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, Transaction, WriteFlags,
};
use task_executor::Executor;

use crate::{Bundle, StoreError};

const SCHEMA_VERSION: u8 = 1;
const VERSIONED_KEY_SIZE: usize = FINGERPRINT_SIZE + 1;

/// A fingerprint with the current schema version appended, so that a future change to the
/// bundle's binary layout can't be misread as an older layout's bytes.
struct VersionedKey([u8; VERSIONED_KEY_SIZE]);

impl VersionedKey {
  fn new(fingerprint: Fingerprint) -> VersionedKey {
    let mut buf = [0_u8; VERSIONED_KEY_SIZE];
    buf[0..FINGERPRINT_SIZE].copy_from_slice(fingerprint.as_bytes());
    buf[FINGERPRINT_SIZE] = SCHEMA_VERSION;
    VersionedKey(buf)
  }
}

impl AsRef<[u8]> for VersionedKey {
  fn as_ref(&self) -> &[u8] {
    &self.0
  }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
struct ShardId(u8);

struct Shard {
  env: Arc<Environment>,
  content: Database,
  leases: Database,
}

/// The sharded set of LMDB environments backing a `ShardedStore`. Split out of `lib.rs` so
/// that the public API (store/restore semantics) reads separately from how a key is routed
/// to a shard and persisted.
#[derive(Clone)]
pub(crate) struct Shards {
  shards: Arc<HashMap<ShardId, Shard>>,
  shard_fingerprint_mask: u8,
  executor: Executor,
}

impl fmt::Debug for Shards {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Shards")
      .field("shard_count", &self.shards.len())
      .finish()
  }
}

impl Shards {
  pub(crate) fn new(
    root_path: PathBuf,
    max_size: usize,
    executor: Executor,
    shard_count: u8,
  ) -> Result<Shards, StoreError> {
    if shard_count.count_ones() != 1 {
      return Err(StoreError::InvalidShardCount(shard_count));
    }

    let max_size_per_shard = max_size / (shard_count as usize);
    let shard_shift = 8 - shard_count.trailing_zeros() as u8;
    let shard_fingerprint_mask = {
      let mask_width = shard_count.trailing_zeros();
      let mut mask = 0_u8;
      for _ in 0..mask_width {
        mask <<= 1;
        mask |= 1;
      }
      mask.rotate_left(shard_shift as u32)
    };

    let mut shards = HashMap::new();
    for b in 0..shard_count {
      let dir = root_path.join(format!("{b:x}"));
      std::fs::create_dir_all(&dir)
        .map_err(|err| StoreError::Lmdb(format!("creating shard dir {dir:?}: {err}")))?;
      let env = Environment::new()
        .set_flags(EnvironmentFlags::NO_SYNC | EnvironmentFlags::NO_TLS)
        .set_max_dbs(2)
        .set_map_size(max_size_per_shard)
        .open(&dir)
        .map_err(|err| StoreError::Lmdb(format!("opening environment at {dir:?}: {err}")))?;
      let content = env
        .create_db(Some("bundles-versioned"), DatabaseFlags::empty())
        .map_err(|err| StoreError::Lmdb(format!("opening content db at {dir:?}: {err}")))?;
      let leases = env
        .create_db(Some("leases-versioned"), DatabaseFlags::empty())
        .map_err(|err| StoreError::Lmdb(format!("opening lease db at {dir:?}: {err}")))?;

      let id = ShardId(b.rotate_left(shard_shift as u32));
      shards.insert(
        id,
        Shard {
          env: Arc::new(env),
          content,
          leases,
        },
      );
    }

    Ok(Shards {
      shards: Arc::new(shards),
      shard_fingerprint_mask,
      executor,
    })
  }

  fn shard_for(&self, fingerprint: &Fingerprint) -> &Shard {
    let id = ShardId(fingerprint.as_bytes()[0] & self.shard_fingerprint_mask);
    &self.shards[&id]
  }

  fn all_shards(&self) -> impl Iterator<Item = &Shard> {
    self.shards.values()
  }

  pub(crate) async fn load(&self, fingerprint: Fingerprint) -> Result<Option<Bundle>, StoreError> {
    let shards = self.clone();
    self
      .executor
      .native_spawn_blocking(move || {
        let shard = shards.shard_for(&fingerprint);
        let key = VersionedKey::new(fingerprint);
        let txn = shard
          .env
          .begin_ro_txn()
          .map_err(|err| StoreError::Lmdb(format!("beginning read transaction: {err}")))?;
        let bytes = match txn.get(shard.content, &key) {
          Ok(bytes) => bytes.to_vec(),
          Err(lmdb::Error::NotFound) => return Ok(None),
          Err(err) => return Err(StoreError::Lmdb(format!("reading bundle: {err}"))),
        };
        let bundle: Bundle = bincode::deserialize(&bytes)
          .map_err(|err| StoreError::Codec(format!("decoding bundle: {err}")))?;
        Ok(Some(bundle))
      })
      .await
      .map_err(|err| StoreError::Lmdb(format!("load task panicked: {err}")))?
  }

  pub(crate) async fn store(
    &self,
    fingerprint: Fingerprint,
    bundle: &Bundle,
    lease_time: Duration,
  ) -> Result<(), StoreError> {
    let bytes =
      bincode::serialize(bundle).map_err(|err| StoreError::Codec(format!("encoding bundle: {err}")))?;
    let shards = self.clone();
    let expires_at = lease_expiration(lease_time);
    self
      .executor
      .native_spawn_blocking(move || {
        let shard = shards.shard_for(&fingerprint);
        let key = VersionedKey::new(fingerprint);
        let mut txn = shard
          .env
          .begin_rw_txn()
          .map_err(|err| StoreError::Lmdb(format!("beginning write transaction: {err}")))?;
        txn
          .put(shard.content, &key, &bytes, WriteFlags::empty())
          .map_err(|err| StoreError::Lmdb(format!("writing bundle: {err}")))?;
        txn
          .put(
            shard.leases,
            &key,
            &expires_at.to_le_bytes(),
            WriteFlags::empty(),
          )
          .map_err(|err| StoreError::Lmdb(format!("writing lease: {err}")))?;
        txn
          .commit()
          .map_err(|err| StoreError::Lmdb(format!("committing store: {err}")))
      })
      .await
      .map_err(|err| StoreError::Lmdb(format!("store task panicked: {err}")))?
  }

  pub(crate) async fn touch_lease(
    &self,
    fingerprint: Fingerprint,
    lease_time: Duration,
  ) -> Result<(), StoreError> {
    let shards = self.clone();
    let expires_at = lease_expiration(lease_time);
    self
      .executor
      .native_spawn_blocking(move || {
        let shard = shards.shard_for(&fingerprint);
        let key = VersionedKey::new(fingerprint);
        let mut txn = shard
          .env
          .begin_rw_txn()
          .map_err(|err| StoreError::Lmdb(format!("beginning lease transaction: {err}")))?;
        txn
          .put(
            shard.leases,
            &key,
            &expires_at.to_le_bytes(),
            WriteFlags::empty(),
          )
          .map_err(|err| StoreError::Lmdb(format!("extending lease: {err}")))?;
        txn
          .commit()
          .map_err(|err| StoreError::Lmdb(format!("committing lease: {err}")))
      })
      .await
      .map_err(|err| StoreError::Lmdb(format!("touch_lease task panicked: {err}")))?
  }

  pub(crate) async fn collect_garbage(&self) -> Result<usize, StoreError> {
    let shards = self.clone();
    self
      .executor
      .native_spawn_blocking(move || {
        let now = lease_expiration(Duration::ZERO);
        let mut removed = 0;
        for shard in shards.all_shards() {
          let expired_keys = {
            let txn = shard
              .env
              .begin_ro_txn()
              .map_err(|err| StoreError::Lmdb(format!("beginning gc read transaction: {err}")))?;
            let mut cursor = txn
              .open_ro_cursor(shard.leases)
              .map_err(|err| StoreError::Lmdb(format!("opening gc cursor: {err}")))?;
            let mut expired = Vec::new();
            for entry in cursor.iter() {
              let (key, value) = entry
                .map_err(|err| StoreError::Lmdb(format!("advancing gc cursor: {err}")))?;
              let expires_at = u64::from_le_bytes(
                value
                  .try_into()
                  .map_err(|_| StoreError::Codec("malformed lease value".to_string()))?,
              );
              if expires_at <= now {
                expired.push(key.to_vec());
              }
            }
            expired
          };

          if expired_keys.is_empty() {
            continue;
          }

          let mut txn = shard
            .env
            .begin_rw_txn()
            .map_err(|err| StoreError::Lmdb(format!("beginning gc write transaction: {err}")))?;
          for key in &expired_keys {
            txn
              .del(shard.content, key, None)
              .or_else(|err| match err {
                lmdb::Error::NotFound => Ok(()),
                err => Err(err),
              })
              .map_err(|err| StoreError::Lmdb(format!("deleting expired bundle: {err}")))?;
            txn
              .del(shard.leases, key, None)
              .map_err(|err| StoreError::Lmdb(format!("deleting expired lease: {err}")))?;
            removed += 1;
          }
          txn
            .commit()
            .map_err(|err| StoreError::Lmdb(format!("committing gc: {err}")))?;
        }
        Ok(removed)
      })
      .await
      .map_err(|err| StoreError::Lmdb(format!("collect_garbage task panicked: {err}")))?
  }
}

fn lease_expiration(lease_time: Duration) -> u64 {
  let now = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or(Duration::ZERO);
  (now + lease_time).as_secs()
}
