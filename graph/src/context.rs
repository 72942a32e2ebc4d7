use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::node::Node;
use crate::{EntryId, Graph, RunId};

/// Bookkeeping accumulated over the lifetime of a `Context`: primarily used by tests and
/// diagnostics to confirm that memoization is behaving (a node re-run when it should have
/// been a cache hit shows up here as a discrepancy).
#[derive(Clone, Copy, Default, Debug, Eq, PartialEq)]
pub struct Stats {
  pub ran: usize,
}

struct InnerContext<N: Node> {
  graph: Graph<N>,
  session: N::SessionContext,
  run_id: RunId,
  stats: Mutex<Stats>,
}

/// The handle a `Node::run` implementation uses to recurse into the graph for its
/// dependencies, and to reach session-scoped data (via `Deref` to `N::SessionContext`).
pub struct Context<N: Node> {
  inner: Arc<InnerContext<N>>,
  /// The entry currently executing under this context, if any. Used to record a
  /// dependency edge when `get` is called from within a running node, and left `None`
  /// for contexts handed to top-level build requests.
  entry_id: Option<EntryId>,
}

impl<N: Node> Clone for Context<N> {
  fn clone(&self) -> Self {
    Context {
      inner: self.inner.clone(),
      entry_id: self.entry_id,
    }
  }
}

impl<N: Node> Context<N> {
  pub fn new(graph: Graph<N>, session: N::SessionContext, run_id: RunId) -> Context<N> {
    Context {
      inner: Arc::new(InnerContext {
        graph,
        session,
        run_id,
        stats: Mutex::new(Stats::default()),
      }),
      entry_id: None,
    }
  }

  /// Returns a context for a different run id, sharing the same graph and session data.
  /// Used when a node needs to recurse on behalf of a run other than its own (rare: most
  /// recursion stays within the current run).
  pub fn clone_for(&self, run_id: RunId) -> Context<N> {
    Context {
      inner: Arc::new(InnerContext {
        graph: self.inner.graph.clone(),
        session: self.inner.session.clone(),
        run_id,
        stats: Mutex::new(Stats::default()),
      }),
      entry_id: None,
    }
  }

  /// Returns a copy of this context tagged as executing on behalf of `entry_id`, so that
  /// a subsequent `get` records a dependency edge from that entry.
  pub(crate) fn with_entry_id(&self, entry_id: EntryId) -> Context<N> {
    Context {
      inner: self.inner.clone(),
      entry_id: Some(entry_id),
    }
  }

  pub fn run_id(&self) -> RunId {
    self.inner.run_id
  }

  pub fn graph(&self) -> &Graph<N> {
    &self.inner.graph
  }

  /// Requests the value of `node`, recording a dependency edge from the currently running
  /// node (if any) to `node`. This is the sole entry point through which `Node::run`
  /// implementations should reach their dependencies.
  pub async fn get(&self, node: N) -> Result<N::Item, N::Error> {
    self.inner.graph.get(self, self.entry_id, node).await
  }

  pub fn stats(&self) -> Stats {
    *self.inner.stats.lock()
  }

  pub(crate) fn record_ran(&self) {
    self.inner.stats.lock().ran += 1;
  }
}

impl<N: Node> Deref for Context<N> {
  type Target = N::SessionContext;

  fn deref(&self) -> &N::SessionContext {
    &self.inner.session
  }
}
