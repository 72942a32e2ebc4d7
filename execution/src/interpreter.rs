use std::collections::BTreeMap;
use std::path::Path as StdPath;

use action::{ActionFull, Dep, Facts};
use async_trait::async_trait;
use hashing::Digest;

/// One round of dynamically-discovered dependencies an action interpreter asked about
/// mid-execution (§6: "`build_deps` is a callback the interpreter invokes for dynamically
/// discovered deps... each such call produces a stage"). `facts` is whatever the
/// callback's resolution recorded, folded into the stage's comparison digest by the
/// caller.
#[derive(Clone, Debug)]
pub struct DynamicDepsRequest {
  pub deps: Vec<Dep>,
}

/// The outcome of running an action to completion: the facts observed while resolving any
/// dynamically-requested deps, and the raw content of every target the action produced
/// (keyed by the sandbox-relative or absolute path the interpreter wrote to).
#[derive(Clone, Debug, Default)]
pub struct ExecResult {
  pub dynamic_deps_stages: Vec<(Vec<Dep>, Facts)>,
  pub produced: BTreeMap<std::path::PathBuf, Vec<u8>>,
}

#[derive(Clone, Debug, thiserror::Error, Eq, PartialEq)]
pub enum InterpretError {
  #[error("action exited with a failure: {0}")]
  Failed(String),
  #[error("action interpreter error: {0}")]
  Internal(String),
}

/// The external collaborator that actually interprets an `ActionDesc` (§1: "the concrete
/// action interpreter... is described abstractly"; §6 "Action interpreter (consumed)").
/// The core never runs a process or a shell itself; it hands a fully-resolved
/// `ActionFull` to whatever implementation of this trait the embedding build tool
/// supplies, inside the sandbox directory it has already prepared.
#[async_trait]
pub trait ActionInterpreter: Send + Sync {
  async fn exec(
    &self,
    workdir: &StdPath,
    action: &ActionFull,
    rule_digest: Digest,
  ) -> Result<ExecResult, InterpretError>;
}

/// Re-resolves a dynamically-discovered dep set to a comparison digest, so a trace hit
/// can replay each of a prior run's dynamic-deps stages (§4.F step 7) without re-running
/// the action itself. Implemented by `build_core`, which alone has the machinery (the
/// memoized graph and a `DepResolver`) to answer "what would this dep resolve to right
/// now".
#[async_trait]
pub trait DynamicDepsResolver: Send + Sync {
  async fn resolve_digest(&self, deps: &[Dep]) -> Result<Digest, crate::error::ExecutionError>;
}
