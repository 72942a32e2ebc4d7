use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;

use crate::context::Context;

/// A unit of memoized work. `Node` values are the keys of the memo graph: equal nodes
/// (by `Eq`/`Hash`) share a cache entry, and `run` is invoked at most once per node per
/// invalidation generation (subject to cutoff, see `EntryResult`).
#[async_trait]
pub trait Node: Clone + Eq + Hash + Debug + Send + Sync + 'static {
  /// Arbitrary data threaded through every node run in a session: handles to the rule
  /// generator, loaded configuration, etc. Not part of the node's identity.
  type SessionContext: Clone + Send + Sync + 'static;
  type Item: NodeOutput;
  type Error: NodeError;

  async fn run(self, context: Context<Self>) -> Result<Self::Item, Self::Error>;

  /// Nodes that should never be treated as cacheable across runs (for example, a node
  /// wrapping an explicit "rerun every time" marker) override this to `false`.
  fn cacheable(&self) -> bool {
    true
  }

  /// A short, human-meaningful label used in cycle-error messages and graph visualizations.
  fn display_info(&self) -> String {
    format!("{self:?}")
  }
}

pub trait NodeOutput: Clone + Debug + Eq + Send + Sync + 'static {}
impl<T: Clone + Debug + Eq + Send + Sync + 'static> NodeOutput for T {}

/// Errors produced while running a `Node`. The graph needs to be able to synthesize a
/// cycle error and an "invalidated mid-flight" error without the concrete error type in
/// each crate knowing about the graph's internals.
pub trait NodeError: Clone + Debug + Eq + Send + Sync + 'static {
  /// The node was cancelled because its result was invalidated while it was still running.
  fn invalidated() -> Self;

  /// A dependency cycle was detected; `path` names the nodes in the cycle, in order.
  fn cyclic(path: Vec<String>) -> Self;

  /// Wraps an arbitrary engine-internal failure (e.g. a poisoned lock, a channel close).
  fn generic(message: String) -> Self;
}
