use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use action::{ActionBuilder, ActionFull, BuildContext, Path, SandboxConfig};

use crate::RulesError;

/// Identifies one `Rule` instance, unique for the lifetime of the process. Two `Rule`
/// values describing the same targets but produced by separate calls to the rule
/// generator are intentionally distinct ids: the directory loader relies on id identity,
/// not structural equality, to detect "the same rule reloaded" vs. "a genuine conflict".
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RuleId(u64);

impl RuleId {
  #[cfg(test)]
  pub fn for_test(id: u64) -> RuleId {
    RuleId(id)
  }
}

#[derive(Default)]
pub struct RuleIdGenerator(AtomicU64);

impl RuleIdGenerator {
  pub fn new() -> RuleIdGenerator {
    RuleIdGenerator(AtomicU64::new(0))
  }

  pub fn next(&self) -> RuleId {
    RuleId(self.0.fetch_add(1, Ordering::SeqCst))
  }
}

/// A source location a rule or alias contribution was declared at, for diagnostics (§7:
/// user errors "carry a location and a list of message paragraphs").
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Loc {
  pub file: PathBuf,
  pub line: u32,
}

impl std::fmt::Display for Loc {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}", self.file.display(), self.line)
  }
}

/// Provenance of a rule, used in diagnostics and to distinguish synthesized rules (source
/// copies) from user-declared ones.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Info {
  /// Declared by the external rule generator at `Loc`.
  FromGenerator(Loc),
  /// Synthesized by the engine itself (e.g. to materialize an anonymous action).
  Internal,
  /// Synthesized by `engine_fs::load_dir` to copy a source file into the build tree.
  SourceFileCopy(Path),
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum PromoteLifetime {
  /// Removed from the source tree the next time `clean` runs.
  UntilClean,
  /// Never automatically removed once promoted.
  Unlimited,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Promote {
  pub lifetime: PromoteLifetime,
  /// Destination directory in the source tree, if different from the rule's own `dir`.
  pub into: Option<PathBuf>,
  /// Only targets whose basename matches this predicate are promoted.
  pub only: Option<action::Predicate>,
}

/// How a rule's targets relate to the source tree (§3 `Rule.mode`).
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Mode {
  /// The common case: targets live only in the build tree.
  Standard,
  /// Skipped entirely if all of the rule's targets are already present as source files in
  /// this directory (§4.E step 5).
  Fallback,
  /// After a successful build, copy (a subset of) targets back into the source tree.
  Promote(Promote),
  /// This rule's targets must never be shadowed by a source-file copy rule, even though a
  /// source file of the same name exists (§4.E step 3).
  IgnoreSourceFiles,
}

/// The directory all of a rule's targets are produced into: a build context plus the
/// relative sub-path within that context's tree.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BuildDir {
  pub context: BuildContext,
  pub sub_dir: PathBuf,
}

impl BuildDir {
  pub fn key(&self) -> String {
    format!("{}/{}", self.context, self.sub_dir.display())
  }
}

/// Re-invokable producer of a rule's fully-resolved action. An `ActionBuilder` consumes
/// itself when run (`ActionBuilder::run` takes `self`), but a `Rule` may need to be
/// re-evaluated across build attempts (a trace miss re-runs the builder to rediscover
/// deps), so rules hold a factory rather than a single builder instance.
pub type ActionFactory = Arc<dyn Fn() -> ActionBuilder<ActionFull> + Send + Sync>;

/// An immutable declaration of targets + action + mode in a specific build directory
/// (§3). Once constructed, a `Rule`'s fields never change; re-building only re-runs its
/// `action` factory.
#[derive(Clone)]
pub struct Rule {
  pub id: RuleId,
  pub dir: BuildDir,
  /// Non-empty; every element's `parent_dir()` must equal `dir`.
  pub targets: Vec<Path>,
  pub action: ActionFactory,
  pub mode: Mode,
  pub info: Info,
  pub context: Option<BuildContext>,
  pub sandbox: SandboxConfig,
}

impl Rule {
  pub fn check_invariants(&self) -> Result<(), RulesError> {
    let Some(first) = self.targets.first() else {
      return Err(RulesError::EmptyTargets(self.id));
    };
    let expected = self.dir.key();
    for target in &self.targets {
      let target_dir = match target.parent_dir() {
        Some(p) => p.display().to_string(),
        None => String::new(),
      };
      if target_dir != self.dir.sub_dir.display().to_string() {
        return Err(RulesError::TargetsSpanMultipleDirs {
          id: self.id,
          dir_a: expected.clone(),
          dir_b: format!("{target_dir} (from target {first})"),
        });
      }
    }
    Ok(())
  }

  pub fn has_target(&self, path: &Path) -> bool {
    self.targets.iter().any(|t| t == path)
  }
}

impl std::fmt::Debug for Rule {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Rule")
      .field("id", &self.id)
      .field("dir", &self.dir)
      .field("targets", &self.targets)
      .field("mode", &self.mode)
      .field("info", &self.info)
      .finish()
  }
}
