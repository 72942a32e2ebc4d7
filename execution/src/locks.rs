use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Named mutexes keyed by path (§5: `locks` on rules). Two rules declaring the same lock
/// name serialize against each other; a rule holds every lock it declares for the
/// duration of its action, acquired in the order the rule listed them.
#[derive(Clone, Default)]
pub struct LockTable {
  locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Holds every lock a rule's `locks` list named, releasing them all when dropped.
pub struct LockGuard {
  _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockTable {
  pub fn new() -> LockTable {
    LockTable::default()
  }

  async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
    let mut locks = self.locks.lock().await;
    locks
      .entry(name.to_string())
      .or_insert_with(|| Arc::new(Mutex::new(())))
      .clone()
  }

  /// Acquires every named lock, in list order, holding each until the returned guard is
  /// dropped.
  pub async fn acquire(&self, names: &[String]) -> LockGuard {
    let mut guards = Vec::with_capacity(names.len());
    for name in names {
      let mutex = self.lock_for(name).await;
      guards.push(mutex.lock_owned().await);
    }
    LockGuard { _guards: guards }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn same_named_lock_serializes() {
    let table = LockTable::new();
    let concurrent = Arc::new(AtomicU32::new(0));
    let max_concurrent = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
      let table = table.clone();
      let concurrent = concurrent.clone();
      let max_concurrent = max_concurrent.clone();
      handles.push(tokio::spawn(async move {
        let _guard = table.acquire(&["build".to_string()]).await;
        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        max_concurrent.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        concurrent.fetch_sub(1, Ordering::SeqCst);
      }));
    }
    for handle in handles {
      handle.await.unwrap();
    }

    assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn distinct_locks_do_not_serialize() {
    let table = LockTable::new();
    let _a = table.acquire(&["a".to_string()]).await;
    let _b = table.acquire(&["b".to_string()]).await;
  }
}
