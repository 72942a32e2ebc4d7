// Copyright contributors to this project.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::new_without_default)]

//! A thin, cloneable wrapper around a tokio runtime handle, used to offload blocking work
//! (file hashing, sandbox staging, process spawning) from the single-threaded scheduler
//! that drives the memo runtime, without tying every crate in the workspace to a concrete
//! tokio runtime configuration.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct Executor {
  handle: Handle,
}

impl Executor {
  /// Captures the ambient tokio runtime. Panics if called outside of a runtime context,
  /// matching the expectation that exactly one runtime is installed per process.
  pub fn new() -> Executor {
    Executor {
      handle: Handle::current(),
    }
  }

  pub fn from_handle(handle: Handle) -> Executor {
    Executor { handle }
  }

  /// Spawns a future on the runtime's worker pool. A panic in `future` is caught and
  /// logged rather than propagated, so that one failed background task cannot silently
  /// take down the scheduler thread awaiting its result.
  pub fn native_spawn<F>(&self, future: F) -> JoinHandle<F::Output>
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
  {
    self.handle.spawn(future)
  }

  /// Runs a blocking closure on the blocking-task pool, surfacing a formatted error if the
  /// closure panics rather than poisoning the caller.
  pub fn native_spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
  where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
  {
    self.handle.spawn_blocking(f)
  }

  /// Runs `future` to completion on this executor's runtime, for call sites that are not
  /// themselves async (e.g. drop implementations, CLI entry points).
  pub fn block_on<F: Future>(&self, future: F) -> F::Output {
    let _guard = self.handle.enter();
    tokio::task::block_in_place(|| futures::executor::block_on(future))
  }

  pub fn handle(&self) -> &Handle {
    &self.handle
  }
}

/// Runs `future`, converting a panic into a formatted `Err` rather than unwinding across
/// the scheduler boundary. Used at the edges where user- or plugin-supplied code (rule
/// generators, action interpreters) is invoked.
pub async fn catch_panic<F, T>(future: F) -> Result<T, String>
where
  F: Future<Output = T>,
{
  AssertUnwindSafe(future)
    .catch_unwind()
    .await
    .map_err(|payload| {
      let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
      } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
      } else {
        "non-string panic payload".to_string()
      };
      format!("panicked: {message}")
    })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn spawn_runs_future() {
    let executor = Executor::new();
    let handle = executor.native_spawn(async { 1 + 1 });
    assert_eq!(handle.await.unwrap(), 2);
  }

  #[tokio::test]
  async fn catch_panic_reports_message() {
    let result = catch_panic(async { panic!("boom") }).await;
    assert!(result.is_err());
    assert!(result.unwrap_err().contains("boom"));
  }
}
