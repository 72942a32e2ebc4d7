use std::collections::BTreeMap;

use crate::path::Path;

/// An abstract description of a concrete action. The engine core never interprets this
/// itself (§1: "the concrete action interpreter... is described abstractly"); it is opaque
/// payload that the executor hands to an external `ActionInterpreter` once a rule's
/// dependencies have all been resolved.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ActionDesc {
  Run { program: String, args: Vec<String> },
  Copy { src: Path, dst: Path },
  WithStdoutTo { target: Path, inner: Box<ActionDesc> },
  Progn(Vec<ActionDesc>),
}

impl ActionDesc {
  /// Actions whose effect is entirely captured by their declared deps and have no
  /// meaningful sandboxing concern (e.g. a single in-process file copy) are candidates for
  /// skipping sandbox setup even when a sandbox is otherwise preferred; see
  /// `clearly_not_useful_to_sandbox` in the executor (§4.F step 4).
  pub fn clearly_not_useful_to_sandbox(&self) -> bool {
    matches!(self, ActionDesc::Copy { .. })
  }
}

/// The fully-resolved description of a rule's action, as produced by running its
/// `ActionBuilder`: the concrete action to run, environment variables to set, named locks
/// to hold while running it, and whether its result is eligible for the shared cache.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ActionFull {
  pub action: ActionDesc,
  pub env: BTreeMap<String, String>,
  pub locks: Vec<String>,
  /// False for actions that are inherently non-reproducible or whose dependencies were
  /// discovered dynamically in a way the executor cannot fully capture in the rule digest
  /// (see §4.F step 8b).
  pub can_go_in_shared_cache: bool,
}

impl ActionFull {
  pub fn new(action: ActionDesc) -> ActionFull {
    ActionFull {
      action,
      env: BTreeMap::new(),
      locks: Vec::new(),
      can_go_in_shared_cache: true,
    }
  }

  pub fn with_env(mut self, env: BTreeMap<String, String>) -> ActionFull {
    self.env = env;
    self
  }

  pub fn with_locks(mut self, locks: Vec<String>) -> ActionFull {
    self.locks = locks;
    self
  }

  pub fn not_cacheable(mut self) -> ActionFull {
    self.can_go_in_shared_cache = false;
    self
  }
}
