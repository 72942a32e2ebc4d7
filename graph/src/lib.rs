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

//! A generic incremental memoization graph.
//!
//! `Graph<N>` memoizes the result of running `N::run` for each distinct `N` it is asked
//! to produce, tracks the dependency edges recorded while a node runs (via `Context::get`),
//! detects cycles among in-flight nodes, and supports invalidating a subset of previously
//! computed nodes (and everything that transitively depended on them) when their inputs
//! change.

pub mod context;
pub mod entry;
pub mod node;

pub use crate::context::Context;
pub use crate::entry::{Entry, Generation, RunToken};
pub use crate::node::{Node, NodeError, NodeOutput};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;
use petgraph::graph::DiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use task_executor::Executor;

pub type EntryId = petgraph::graph::NodeIndex<u32>;
type PGraph<N> = DiGraph<Entry<N>, (), u32>;

/// Identifies one build run. Every node execution started within a run shares the same
/// `RunId`; `Node::cacheable() == false` results are only valid for the run they were
/// produced in (see `EntryResult::Uncacheable`).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct RunId(u64);

#[derive(Default)]
pub struct RunIdGenerator(AtomicU64);

impl RunIdGenerator {
  pub fn new() -> RunIdGenerator {
    RunIdGenerator(AtomicU64::new(0))
  }

  pub fn next(&self) -> RunId {
    RunId(self.0.fetch_add(1, Ordering::SeqCst))
  }
}

/// The outcome of invalidating a set of nodes: how many were evicted entirely (no longer
/// reachable from any live root) versus merely marked dirty (still reachable, will re-run
/// on next request).
#[derive(Debug, Default, Eq, PartialEq)]
pub struct InvalidationResult {
  pub cleared: usize,
  pub dirtied: usize,
}

struct InnerGraph<N: Node> {
  nodes: HashMap<N, EntryId>,
  pg: PGraph<N>,
}

impl<N: Node> InnerGraph<N> {
  fn entry_id(&self, node: &N) -> Option<EntryId> {
    self.nodes.get(node).copied()
  }

  fn ensure_entry(&mut self, node: N) -> EntryId {
    if let Some(&id) = self.nodes.get(&node) {
      return id;
    }
    let entry = Entry::new(node.clone());
    let id = self.pg.add_node(entry);
    self.nodes.insert(node, id);
    id
  }

  fn add_edge(&mut self, src: EntryId, dst: EntryId) {
    if src != dst && self.pg.find_edge(src, dst).is_none() {
      self.pg.add_edge(src, dst, ());
    }
  }

  /// True if adding an edge `src -> dst` would close a cycle, i.e. `dst` can already reach
  /// `src`. Used before recording a dependency edge so that a cyclic request can be turned
  /// into a `Node::Error` rather than deadlocking two entries awaiting each other forever.
  fn would_cycle(&self, src: EntryId, dst: EntryId) -> bool {
    if src == dst {
      return true;
    }
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(dst);
    while let Some(current) = queue.pop_front() {
      if current == src {
        return true;
      }
      if !visited.insert(current) {
        continue;
      }
      for succ in self.pg.neighbors_directed(current, Direction::Outgoing) {
        queue.push_back(succ);
      }
    }
    false
  }

  /// Names the path `src -> ... -> dst` for use in a cycle error message, given that
  /// `would_cycle(src, dst)` returned true (so `dst` can reach `src`).
  fn cycle_path(&self, src: EntryId, dst: EntryId) -> Vec<String> {
    let mut parents: HashMap<EntryId, EntryId> = HashMap::new();
    let mut queue = VecDeque::new();
    queue.push_back(dst);
    let mut visited = HashSet::new();
    visited.insert(dst);
    while let Some(current) = queue.pop_front() {
      if current == src {
        break;
      }
      for succ in self.pg.neighbors_directed(current, Direction::Outgoing) {
        if visited.insert(succ) {
          parents.insert(succ, current);
          queue.push_back(succ);
        }
      }
    }
    let mut path = vec![src];
    let mut current = src;
    while current != dst {
      match parents.get(&current) {
        Some(&parent) => {
          path.push(parent);
          current = parent;
        }
        None => break,
      }
    }
    path
      .into_iter()
      .map(|id| self.pg[id].node().display_info())
      .collect()
  }

  /// Marks `roots` and everything that transitively depends on them as dirty. Nodes with
  /// no remaining live dependents beyond the invalidated set are cleared entirely.
  fn invalidate_from_roots<P: Fn(&N) -> bool>(&mut self, predicate: P) -> InvalidationResult {
    let roots: Vec<EntryId> = self
      .pg
      .node_indices()
      .filter(|&id| predicate(self.pg[id].node()))
      .collect();

    let mut to_dirty = HashSet::new();
    let mut queue = VecDeque::from(roots);
    while let Some(id) = queue.pop_front() {
      if !to_dirty.insert(id) {
        continue;
      }
      for dependent in self.pg.neighbors_directed(id, Direction::Incoming) {
        queue.push_back(dependent);
      }
    }

    let mut cleared = 0;
    let mut dirtied = 0;
    for &id in &to_dirty {
      let entry = &self.pg[id];
      entry.dirty();
      dirtied += 1;
    }
    for &id in &to_dirty {
      if self.pg.neighbors_directed(id, Direction::Incoming).count() == 0
        && self.pg.neighbors_directed(id, Direction::Outgoing).count() == 0
      {
        self.pg[id].clear();
        cleared += 1;
      }
    }
    InvalidationResult { cleared, dirtied }
  }

  fn live_reachable(&self, roots: &[EntryId]) -> Vec<EntryId> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from(roots.to_vec());
    while let Some(id) = queue.pop_front() {
      if !visited.insert(id) {
        continue;
      }
      for succ in self.pg.neighbors_directed(id, Direction::Outgoing) {
        queue.push_back(succ);
      }
    }
    visited.into_iter().collect()
  }

  fn visualize(&self) -> String {
    let mut out = String::from("digraph plans {\n");
    for id in self.pg.node_indices() {
      out.push_str(&format!(
        "  \"{}\" [label=\"{}\"]\n",
        id.index(),
        self.pg[id].format().replace('"', "'")
      ));
    }
    for edge in self.pg.edge_references() {
      out.push_str(&format!(
        "  \"{}\" -> \"{}\"\n",
        edge.source().index(),
        edge.target().index()
      ));
    }
    out.push_str("}\n");
    out
  }
}

/// A generic memoization graph over `Node` values. Cloning a `Graph` is cheap and shares
/// the underlying storage: clone it freely to hand copies to concurrently running nodes.
pub struct Graph<N: Node> {
  inner: Arc<Mutex<InnerGraph<N>>>,
  executor: Executor,
}

impl<N: Node> Clone for Graph<N> {
  fn clone(&self) -> Self {
    Graph {
      inner: self.inner.clone(),
      executor: self.executor.clone(),
    }
  }
}

impl<N: Node> Graph<N> {
  pub fn new(executor: Executor) -> Graph<N> {
    Graph {
      inner: Arc::new(Mutex::new(InnerGraph {
        nodes: HashMap::new(),
        pg: DiGraph::new(),
      })),
      executor,
    }
  }

  pub fn executor(&self) -> &Executor {
    &self.executor
  }

  pub fn get_inner(&self, node: &N) -> Option<Entry<N>> {
    let inner = self.inner.lock();
    inner.entry_id(node).map(|id| inner.pg[id].clone())
  }

  /// Requests the value of `node`, recording a dependency edge from `parent` (the entry
  /// currently executing, if any). Detects cycles before spawning: if `node`'s entry can
  /// already reach `parent`'s entry, returns a cycle error instead of recursing.
  pub async fn get(
    &self,
    context: &Context<N>,
    parent: Option<EntryId>,
    node: N,
  ) -> Result<N::Item, N::Error> {
    let (entry, entry_id) = {
      let mut inner = self.inner.lock();
      let entry_id = inner.ensure_entry(node);
      if let Some(parent_id) = parent {
        if inner.would_cycle(parent_id, entry_id) {
          let path = inner.cycle_path(parent_id, entry_id);
          trace!("cycle detected: {:?}", path);
          return Err(N::Error::cyclic(path));
        }
        inner.add_edge(parent_id, entry_id);
      }
      (inner.pg[entry_id].clone(), entry_id)
    };
    entry.poll(context, entry_id).await
  }

  /// Creates a top-level context (no running parent) scoped to `run_id`, for use by
  /// callers outside of any node (a CLI build request, for example).
  pub fn context_for(&self, session: N::SessionContext, run_id: RunId) -> Context<N> {
    Context::new(self.clone(), session, run_id)
  }

  pub fn invalidate_from_roots<P: Fn(&N) -> bool>(&self, predicate: P) -> InvalidationResult {
    self.inner.lock().invalidate_from_roots(predicate)
  }

  pub fn len(&self) -> usize {
    self.inner.lock().pg.node_count()
  }

  pub fn visualize(&self) -> String {
    self.inner.lock().visualize()
  }

  /// Returns the ids of every node currently reachable from at least one node matching
  /// `roots`, for diagnostics (e.g. "what is still live after this build").
  pub fn visit_live_reachable<P: Fn(&N) -> bool>(&self, roots: P) -> usize {
    let inner = self.inner.lock();
    let root_ids: Vec<EntryId> = inner
      .pg
      .node_indices()
      .filter(|&id| roots(inner.pg[id].node()))
      .collect();
    inner.live_reachable(&root_ids).len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;

  #[derive(Clone, Eq, PartialEq, Hash, Debug)]
  struct TestNode(u32);

  #[derive(Clone)]
  struct Session;

  #[derive(Clone, Eq, PartialEq, Debug)]
  enum TestError {
    Cyclic(Vec<String>),
    Invalidated,
    Generic(String),
  }

  impl NodeError for TestError {
    fn invalidated() -> Self {
      TestError::Invalidated
    }
    fn cyclic(path: Vec<String>) -> Self {
      TestError::Cyclic(path)
    }
    fn generic(message: String) -> Self {
      TestError::Generic(message)
    }
  }

  #[async_trait]
  impl Node for TestNode {
    type SessionContext = Session;
    type Item = u32;
    type Error = TestError;

    async fn run(self, _context: Context<Self>) -> Result<u32, TestError> {
      Ok(self.0 * 2)
    }
  }

  #[tokio::test]
  async fn get_memoizes() {
    let executor = Executor::new();
    let graph: Graph<TestNode> = Graph::new(executor);
    let run_id = RunId(0);
    let context = graph.context_for(Session, run_id);

    let result_a = context.get(TestNode(21)).await.unwrap();
    let result_b = context.get(TestNode(21)).await.unwrap();
    assert_eq!(result_a, 42);
    assert_eq!(result_b, 42);
    assert_eq!(graph.len(), 1);
  }

  #[tokio::test]
  async fn direct_self_cycle_is_detected() {
    let inner = InnerGraph::<TestNode> {
      nodes: HashMap::new(),
      pg: DiGraph::new(),
    };
    let mut inner = inner;
    let id = inner.ensure_entry(TestNode(1));
    assert!(inner.would_cycle(id, id));
  }

  #[test]
  fn invalidate_from_roots_dirties_dependents() {
    let mut inner = InnerGraph::<TestNode> {
      nodes: HashMap::new(),
      pg: DiGraph::new(),
    };
    let a = inner.ensure_entry(TestNode(1));
    let b = inner.ensure_entry(TestNode(2));
    inner.add_edge(b, a); // b depends on a
    let result = inner.invalidate_from_roots(|n| n.0 == 1);
    assert_eq!(result.dirtied, 2);
  }
}
