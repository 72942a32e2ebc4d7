use std::collections::BTreeMap;

use action::{Alias, BuildContext, Dep, DepResolver, Fact, Facts, Path, Predicate};
use async_trait::async_trait;
use execution::DynamicDepsResolver;
use graph::Context;
use hashing::Digest;

use crate::error::{to_builder_error, to_execution_error, BuildError};
use crate::node::BuildNode;

/// The `action`/`execution` crates' shared-seam implementation: the only piece of this
/// workspace that actually knows how to answer "what does this dep resolve to", because
/// it alone holds both a memoized `graph::Context` and the rule/alias data model. Bound
/// to one `BuildContext` — the context of whichever rule's `ActionBuilder` is currently
/// running — since an `Alias` itself carries no context (see `action::Alias`), only a
/// directory and a name; the ambient context of the running rule is what supplies the
/// rest of an alias's identity when a dependency is declared on it.
pub struct GraphDepResolver {
  context: Context<BuildNode>,
  current_context: BuildContext,
}

impl GraphDepResolver {
  pub fn new(context: Context<BuildNode>, current_context: BuildContext) -> GraphDepResolver {
    GraphDepResolver {
      context,
      current_context,
    }
  }
}

#[async_trait]
impl DepResolver for GraphDepResolver {
  async fn resolve_file(&self, path: &Path) -> Result<Digest, BuilderErrorAlias> {
    self
      .context
      .get(BuildNode::BuildFile(path.clone()))
      .await
      .map_err(to_builder_error)?
      .into_file_digest()
      .map_err(to_builder_error)
  }

  async fn resolve_alias(&self, alias: &Alias) -> Result<BTreeMap<Path, Digest>, BuilderErrorAlias> {
    self
      .context
      .get(BuildNode::Alias(self.current_context.clone(), alias.clone()))
      .await
      .map_err(to_builder_error)?
      .into_path_map()
      .map_err(to_builder_error)
  }

  async fn resolve_file_selector(
    &self,
    dir: &Path,
    predicate: &Predicate,
  ) -> Result<BTreeMap<Path, Digest>, BuilderErrorAlias> {
    self
      .context
      .get(BuildNode::FileSelector(dir.clone(), predicate.clone()))
      .await
      .map_err(to_builder_error)?
      .into_path_map()
      .map_err(to_builder_error)
  }

  fn resolve_env(&self, var: &str) -> Option<String> {
    self.context.env_vars.get(var).cloned()
  }
}

/// `action::BuilderError`, aliased locally only so the trait-impl signatures above read
/// the same width as the other methods; there is no behavioral difference from using the
/// real name.
type BuilderErrorAlias = action::BuilderError;

#[async_trait]
impl DynamicDepsResolver for GraphDepResolver {
  /// Re-resolves a previously-recorded dynamic-deps stage's dep list to a comparison
  /// digest, so a trace hit can replay it without re-running the action (§4.F step 7).
  /// This is exactly the general `Dep -> Fact` resolution `action::ActionBuilder`
  /// performs while an action runs, just driven directly instead of through a builder,
  /// since there's no builder in flight to attach the facts to.
  async fn resolve_digest(&self, deps: &[Dep]) -> Result<Digest, execution::ExecutionError> {
    let mut facts = Facts::new();
    for dep in deps {
      let fact = match dep {
        Dep::File(path) => Fact::File(
          self
            .resolve_file(path)
            .await
            .map_err(BuildError::Builder)
            .map_err(to_execution_error)?,
        ),
        Dep::Alias(alias) => Fact::Alias(
          self
            .resolve_alias(alias)
            .await
            .map_err(BuildError::Builder)
            .map_err(to_execution_error)?,
        ),
        Dep::FileSelector(dir, predicate) => Fact::FileSelector(
          self
            .resolve_file_selector(dir, predicate)
            .await
            .map_err(BuildError::Builder)
            .map_err(to_execution_error)?,
        ),
        Dep::Env(name) => Fact::Env(self.resolve_env(name)),
        Dep::Universe => Fact::Universe,
        Dep::SandboxConfig(_) => Fact::SandboxConfig,
      };
      facts.insert(dep.clone(), fact);
    }
    Ok(facts.digest())
  }
}
