use std::collections::HashSet;

use action::{BuildContext, Path};
use async_trait::async_trait;
use rules::Rules;

/// Which top-level tree a context build directory belongs to: an ordinary per-context
/// build tree, or that context's install root (§4.E triage).
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum CtxOrInstall {
  Context(BuildContext),
  Install(BuildContext),
}

/// The single plugin seam this crate consumes (§6 "Rule generator"): given a directory,
/// produce the rules that apply to it. Returning `None` for a directory the loader asked
/// about is a contract violation by the generator, not a recoverable error — callers
/// should treat it as a bug in the generator, per §6.
#[async_trait]
pub trait RuleGenerator: Send + Sync {
  /// `sub_path_components` is `sub_dir` split on `/`, provided as a convenience since
  /// generators commonly dispatch on the leading component (e.g. a language plugin keyed
  /// off the first path segment).
  async fn gen_rules(
    &self,
    ctx_or_install: &CtxOrInstall,
    dir: &Path,
    sub_path_components: &[String],
  ) -> Option<(HashSet<String>, Rules)>;

  /// Rules contributed regardless of which directory is being loaded (e.g. rules that
  /// attach to a fixed, well-known alias from every directory that opts in). Evaluated
  /// once per build run and unioned into every context directory's rule set.
  fn global_rules(&self) -> Rules {
    Rules::new()
  }
}
