use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::trace;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::context::Context;
use crate::node::Node;
use crate::{EntryId, RunId};

/// Distinguishes successive attempts to run the same `Entry`: bumped every time a node
/// transitions from `NotStarted`/dirtied back into `Running`, so that a late-arriving
/// result from a since-cancelled run can be recognized as stale and discarded.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RunToken(u32);

impl RunToken {
  pub fn initial() -> RunToken {
    RunToken(0)
  }

  fn next(self) -> RunToken {
    RunToken(self.0 + 1)
  }
}

/// Versions an `Entry`'s *output value*. Unlike `RunToken`, this only advances when the
/// node is re-run and produces a value unequal to its previous one (the "cutoff" policy),
/// so that dependents of a node whose value didn't actually change are not themselves
/// considered dirtied.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Generation(u32);

impl Generation {
  pub fn initial() -> Generation {
    Generation(0)
  }

  fn next(self) -> Generation {
    Generation(self.0 + 1)
  }
}

/// The result of having run a `Node`, tagged with how trustworthy it is for reuse.
#[derive(Clone)]
pub enum EntryResult<N: Node> {
  /// Produced in the current run, and safe to treat as a cache hit by later callers in
  /// this run (and, if the node is persistent, across future runs).
  Clean(Result<N::Item, N::Error>),
  /// Produced in a previous run; has not yet been confirmed current by a dependency
  /// check, but may be presented speculatively.
  Dirty(Result<N::Item, N::Error>),
  /// The node declared itself non-cacheable (`Node::cacheable() == false`, e.g. it reads
  /// an always-rerun marker): only valid within the run it was produced in.
  Uncacheable(Result<N::Item, N::Error>, RunId),
  /// The node is cacheable, but one of its dependencies was `Uncacheable`: also only valid
  /// within the run it was produced in, but distinguished from `Uncacheable` for
  /// diagnostics.
  UncacheableDependencies(Result<N::Item, N::Error>, RunId),
}

impl<N: Node> EntryResult<N> {
  pub fn as_result(&self) -> &Result<N::Item, N::Error> {
    match self {
      EntryResult::Clean(r)
      | EntryResult::Dirty(r)
      | EntryResult::Uncacheable(r, _)
      | EntryResult::UncacheableDependencies(r, _) => r,
    }
  }

  pub fn into_result(self) -> Result<N::Item, N::Error> {
    match self {
      EntryResult::Clean(r)
      | EntryResult::Dirty(r)
      | EntryResult::Uncacheable(r, _)
      | EntryResult::UncacheableDependencies(r, _) => r,
    }
  }

  fn dirtied(self) -> EntryResult<N> {
    match self {
      EntryResult::Clean(r) => EntryResult::Dirty(r),
      other @ EntryResult::Dirty(_) => other,
      EntryResult::Uncacheable(r, run_id) | EntryResult::UncacheableDependencies(r, run_id) => {
        EntryResult::UncacheableDependencies(r, run_id)
      }
    }
  }

  /// Whether this result may be handed to a caller in `run_id` without re-running the
  /// node.
  fn valid_for(&self, run_id: RunId) -> bool {
    match self {
      EntryResult::Clean(..) => true,
      EntryResult::Dirty(..) => false,
      EntryResult::Uncacheable(_, produced_in) | EntryResult::UncacheableDependencies(_, produced_in) => {
        *produced_in == run_id
      }
    }
  }
}

enum EntryState<N: Node> {
  NotStarted {
    run_token: RunToken,
    generation: Generation,
    previous_result: Option<EntryResult<N>>,
  },
  Running {
    run_token: RunToken,
    generation: Generation,
    start_time: Instant,
    abort: AbortHandle,
    receiver: watch::Receiver<Option<EntryResult<N>>>,
    previous_result: Option<EntryResult<N>>,
  },
  Completed {
    result: EntryResult<N>,
    generation: Generation,
    run_token: RunToken,
  },
}

/// A single cell of the memo graph: one `Node` plus its current execution/result state.
/// `Entry` is cheaply `Clone`-able (an `Arc` around a mutex) so that the graph's petgraph
/// storage and in-flight callers can share the same cell.
pub struct Entry<N: Node> {
  node: N,
  state: Arc<Mutex<EntryState<N>>>,
}

impl<N: Node> Clone for Entry<N> {
  fn clone(&self) -> Self {
    Entry {
      node: self.node.clone(),
      state: self.state.clone(),
    }
  }
}

impl<N: Node> Entry<N> {
  pub fn new(node: N) -> Entry<N> {
    Entry {
      node,
      state: Arc::new(Mutex::new(EntryState::NotStarted {
        run_token: RunToken::initial(),
        generation: Generation::initial(),
        previous_result: None,
      })),
    }
  }

  pub fn node(&self) -> &N {
    &self.node
  }

  pub fn is_started(&self) -> bool {
    !matches!(&*self.state.lock(), EntryState::NotStarted { .. })
  }

  pub fn is_running(&self) -> bool {
    matches!(&*self.state.lock(), EntryState::Running { .. })
  }

  /// Returns the completed result without triggering execution, if one is available and
  /// trustworthy for `run_id`. Used for introspection (`Graph::peek`) rather than for
  /// driving a build.
  pub fn peek(&self, run_id: RunId) -> Option<Result<N::Item, N::Error>> {
    match &*self.state.lock() {
      EntryState::Completed { result, .. } if result.valid_for(run_id) => {
        Some(result.as_result().clone())
      }
      _ => None,
    }
  }

  /// Ensures the node is running (spawning it if necessary) and returns a future that
  /// resolves to its result. Multiple concurrent callers for the same `Entry` share a
  /// single execution.
  pub async fn poll(&self, context: &Context<N>, entry_id: EntryId) -> Result<N::Item, N::Error> {
    let run_id = context.run_id();
    enum Action<N: Node> {
      Ready(Result<N::Item, N::Error>),
      Await(watch::Receiver<Option<EntryResult<N>>>),
      Spawn(RunToken, Generation, Option<EntryResult<N>>),
    }

    let action = {
      let mut state = self.state.lock();
      match &*state {
        EntryState::Completed { result, .. } if result.valid_for(run_id) => {
          Action::Ready(result.as_result().clone())
        }
        EntryState::Completed {
          result,
          generation,
          run_token,
        } => {
          let previous = Some(result.clone().dirtied());
          *state = EntryState::NotStarted {
            run_token: run_token.next(),
            generation: *generation,
            previous_result: previous,
          };
          match &*state {
            EntryState::NotStarted {
              run_token,
              generation,
              previous_result,
            } => Action::Spawn(*run_token, *generation, previous_result.clone()),
            _ => unreachable!(),
          }
        }
        EntryState::Running { receiver, .. } => Action::Await(receiver.clone()),
        EntryState::NotStarted {
          run_token,
          generation,
          previous_result,
        } => Action::Spawn(*run_token, *generation, previous_result.clone()),
      }
    };

    match action {
      Action::Ready(result) => result,
      Action::Await(mut receiver) => self.await_result(&mut receiver).await,
      Action::Spawn(run_token, generation, previous_result) => {
        self
          .spawn_node_execution(context, entry_id, run_token, generation, previous_result)
          .await
      }
    }
  }

  async fn await_result(
    &self,
    receiver: &mut watch::Receiver<Option<EntryResult<N>>>,
  ) -> Result<N::Item, N::Error> {
    loop {
      if let Some(result) = receiver.borrow().clone() {
        return result.into_result();
      }
      if receiver.changed().await.is_err() {
        return Err(N::Error::generic(
          "node execution was dropped without completing".to_owned(),
        ));
      }
    }
  }

  async fn spawn_node_execution(
    &self,
    context: &Context<N>,
    entry_id: EntryId,
    run_token: RunToken,
    generation: Generation,
    previous_result: Option<EntryResult<N>>,
  ) -> Result<N::Item, N::Error> {
    let (sender, receiver) = watch::channel(None);
    let node = self.node.clone();
    let run_context = context.with_entry_id(entry_id);
    let entry_state = self.state.clone();
    let cacheable = node.cacheable();
    let run_id = context.run_id();

    let join_handle = context.graph().executor().native_spawn(async move {
      run_context.record_ran();
      let result = node.run(run_context.clone()).await;
      let wrapped = if !cacheable {
        EntryResult::Uncacheable(result, run_id)
      } else {
        EntryResult::Clean(result)
      };

      let new_generation = {
        let mut state = entry_state.lock();
        match &*state {
          EntryState::Running {
            run_token: current_token,
            ..
          } if *current_token == run_token => {
            let next_generation = generation.next();
            *state = EntryState::Completed {
              result: wrapped.clone(),
              generation: next_generation,
              run_token,
            };
            next_generation
          }
          // A newer run superseded this one (the entry was dirtied and restarted) while
          // we were executing: our result is stale, discard it without storing.
          _ => generation,
        }
      };
      let _ = new_generation;
      let _ = sender.send(Some(wrapped));
    });

    {
      let mut state = self.state.lock();
      *state = EntryState::Running {
        run_token,
        generation,
        start_time: Instant::now(),
        abort: join_handle.abort_handle(),
        receiver: receiver.clone(),
        previous_result,
      };
    }

    let mut receiver = receiver;
    self.await_result(&mut receiver).await
  }

  /// Cancels an in-flight run, reverting the entry to `NotStarted` so the next `poll`
  /// spawns a fresh execution. Used when a node's result is no longer needed (e.g. the
  /// requesting build was itself cancelled).
  pub fn cancel(&self) {
    let mut state = self.state.lock();
    if let EntryState::Running {
      run_token,
      generation,
      abort,
      previous_result,
      ..
    } = &*state
    {
      abort.abort();
      trace!("cancelled in-flight node");
      *state = EntryState::NotStarted {
        run_token: run_token.next(),
        generation: *generation,
        previous_result: previous_result.clone(),
      };
    }
  }

  /// Marks a completed entry as dirty: its cached value may still be served speculatively
  /// via `previous_result`, but the next `poll` will re-run the node.
  pub fn dirty(&self) {
    let mut state = self.state.lock();
    match &*state {
      EntryState::Completed {
        result,
        generation,
        run_token,
      } => {
        *state = EntryState::NotStarted {
          run_token: run_token.next(),
          generation: *generation,
          previous_result: Some(result.clone().dirtied()),
        };
      }
      EntryState::Running { .. } => {
        // Already re-running (or about to be observed as stale on completion); nothing to
        // do. The in-flight run's result will be stored as Completed regardless, and a
        // subsequent `dirty` call (or invalidation pass) will catch it then.
      }
      EntryState::NotStarted { .. } => {}
    }
  }

  /// Drops any stored result entirely, as though the entry had never run. Used when a
  /// node is removed from the graph's live set (e.g. in `clear`/`invalidate_from_roots`
  /// for nodes tied to a path that no longer exists).
  pub fn clear(&self) {
    let mut state = self.state.lock();
    if let EntryState::Running { abort, .. } = &*state {
      abort.abort();
    }
    *state = EntryState::NotStarted {
      run_token: RunToken::initial(),
      generation: Generation::initial(),
      previous_result: None,
    };
  }

  pub fn format(&self) -> String {
    let state = match &*self.state.lock() {
      EntryState::NotStarted { .. } => "NotStarted",
      EntryState::Running { .. } => "Running",
      EntryState::Completed { .. } => "Completed",
    };
    format!("{:?} [{}]", self.node, state)
  }
}

impl<N: Node> fmt::Debug for Entry<N> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.format())
  }
}
