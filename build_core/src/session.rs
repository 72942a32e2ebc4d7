use std::collections::BTreeMap;
use std::sync::Arc;

use action::{Alias, BuildContext, Path};
use engine_fs::{DefaultAliasTarget, Disk, RealDisk, RootPaths, RuleGenerator};
use execution::{ExecutionPolicy, RuleExecutor};
use graph::{Graph, RunId, RunIdGenerator};
use hashing::{CachedDigest, Digest};
use rules::RuleIdGenerator;

use crate::error::BuildError;
use crate::node::BuildNode;

/// Data threaded through every `BuildNode::run` call for the lifetime of a `Session`: the
/// rule generator, the two physical roots, and the collaborators `execution`/`engine_fs`
/// need. Distinct from a node's identity (two `BuildFile` nodes for the same path are the
/// same graph entry regardless of which `SessionContext` asked), which is what lets the
/// graph memoize across an entire session rather than per-request.
#[derive(Clone)]
pub struct SessionContext {
  pub generator: Arc<dyn RuleGenerator>,
  pub disk: Arc<dyn Disk>,
  pub roots: Arc<RootPaths>,
  pub known_contexts: Arc<Vec<BuildContext>>,
  pub default_alias_target: DefaultAliasTarget,
  pub id_gen: Arc<RuleIdGenerator>,
  pub rule_executor: Arc<RuleExecutor>,
  pub cached_digest: Arc<CachedDigest>,
  pub env_vars: Arc<BTreeMap<String, String>>,
  /// Set by `--force`-style callers (see the executor's `force_rerun` parameter); threaded
  /// from the session rather than recomputed per rule, since it is a whole-build flag
  /// rather than a per-rule fact.
  pub force_rerun: bool,
}

/// Everything needed to stand up a `Session` that isn't already implied by the rule
/// generator and the physical roots.
pub struct SessionConfig {
  pub roots: RootPaths,
  pub generator: Arc<dyn RuleGenerator>,
  pub known_contexts: Vec<BuildContext>,
  pub default_alias_target: DefaultAliasTarget,
  pub policy: ExecutionPolicy,
  pub store: Option<sharded_store::ShardedStore>,
  pub interpreter: Arc<dyn execution::ActionInterpreter>,
  pub env_vars: BTreeMap<String, String>,
  pub force_rerun: bool,
}

/// The top-level handle a build tool holds for the lifetime of one invocation: a
/// memoized graph of `BuildNode`s plus the run-id bookkeeping needed to request fresh
/// values after `reset`. Building the same file or alias twice within a `Session`'s
/// lifetime (without an intervening `reset`) is always served from the graph's cache.
pub struct Session {
  graph: Graph<BuildNode>,
  session_context: SessionContext,
  run_ids: RunIdGenerator,
  current_run: RunId,
}

impl Session {
  pub fn new(executor: task_executor::Executor, config: SessionConfig) -> Session {
    let roots = Arc::new(config.roots);
    let rule_executor = Arc::new(RuleExecutor::new(
      RootPaths {
        source_root: roots.source_root.clone(),
        build_root: roots.build_root.clone(),
      },
      Arc::new(RealDisk) as Arc<dyn Disk>,
      config.interpreter,
      config.store,
      config.policy,
    ));
    let session_context = SessionContext {
      generator: config.generator,
      disk: Arc::new(RealDisk),
      roots,
      known_contexts: Arc::new(config.known_contexts),
      default_alias_target: config.default_alias_target,
      id_gen: Arc::new(RuleIdGenerator::new()),
      rule_executor,
      cached_digest: Arc::new(CachedDigest::new()),
      env_vars: Arc::new(config.env_vars),
      force_rerun: config.force_rerun,
    };
    let graph = Graph::new(executor);
    let run_ids = RunIdGenerator::new();
    let current_run = run_ids.next();
    Session {
      graph,
      session_context,
      run_ids,
      current_run,
    }
  }

  /// Builds `path`, returning the digest of its content once it (and everything it
  /// depends on) has been brought up to date.
  pub async fn build_file(&self, path: Path) -> Result<Digest, BuildError> {
    let context = self
      .graph
      .context_for(self.session_context.clone(), self.current_run);
    context
      .get(BuildNode::BuildFile(path))
      .await?
      .into_file_digest()
  }

  /// Builds every file `alias` (declared in `dir` under `ctx`) transitively expands to.
  pub async fn build_alias(
    &self,
    ctx: BuildContext,
    alias: Alias,
  ) -> Result<BTreeMap<Path, Digest>, BuildError> {
    let context = self
      .graph
      .context_for(self.session_context.clone(), self.current_run);
    context
      .get(BuildNode::Alias(ctx, alias))
      .await?
      .into_path_map()
  }

  /// Persists the rule executor's trace database and promoted-to-delete set (§3:
  /// "dumped at end-of-build"). Callers should invoke this once after a batch of builds,
  /// not per-file: the trace DB only needs to survive process exit, not individual
  /// `build_file` calls.
  pub async fn flush(&self) -> std::io::Result<()> {
    self.session_context.rule_executor.flush().await
  }

  /// Invalidates every node whose path lies under `changed_source_path` (or that
  /// transitively depended on one that does), and starts a new run id so that the next
  /// `build_file`/`build_alias` call re-validates rather than trusting stale completions.
  /// This is the session-level entry point a file-watcher-driven build loop calls on
  /// every detected source change.
  pub fn invalidate(&self, changed_source_path: &std::path::Path) -> graph::InvalidationResult {
    self.session_context.cached_digest.invalidate(changed_source_path);
    let source_root = &self.session_context.roots.source_root;
    self.graph.invalidate_from_roots(|node| match node {
      BuildNode::BuildFile(Path::Source(p)) => source_root.join(p) == changed_source_path,
      BuildNode::BuildFile(Path::External(p)) => p == changed_source_path,
      _ => false,
    })
  }

  /// Starts a fresh run id without invalidating any cached results, for a caller that
  /// wants uncacheable (`Node::cacheable() == false`) nodes to be eligible to re-run even
  /// though nothing has actually changed.
  pub fn reset(&mut self) {
    self.current_run = self.run_ids.next();
  }

  pub fn visualize(&self) -> String {
    self.graph.visualize()
  }
}
