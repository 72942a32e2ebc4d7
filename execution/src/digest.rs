use std::collections::BTreeMap;

use action::{ActionDesc, Facts, Path, SandboxMode};
use hashing::Digest;

/// The current rule-digest version. Bumping this invalidates every trace entry in the
/// fleet at once, which is the blunt tool used when the meaning of an existing fact
/// changes (e.g. a new field folded into the digest below).
pub const RULE_DIGEST_VERSION: u32 = 1;

/// Everything §4.F step 6 folds into a rule's digest, besides the `Facts` already
/// captured while `rule.action` ran. Kept as a struct (rather than a long parameter list)
/// so call sites read as "here is everything that must match for a trace hit".
pub struct RuleDigestInputs<'a> {
  pub facts: &'a Facts,
  pub sandbox_mode: SandboxMode,
  pub targets: &'a [Path],
  pub context_name: &'a str,
  pub action: &'a ActionDesc,
  pub can_go_in_shared_cache: bool,
  pub locks: &'a [String],
  pub env: &'a BTreeMap<String, String>,
}

/// Computes the digest that identifies a rule invocation for trace-hit and shared-cache
/// purposes: two invocations with the same digest are expected (modulo non-determinism,
/// which the shared cache separately guards against) to produce identical targets.
pub fn compute_rule_digest(inputs: &RuleDigestInputs<'_>) -> Digest {
  let mut targets: Vec<String> = inputs.targets.iter().map(|t| t.to_string()).collect();
  targets.sort();

  let mut locks = inputs.locks.to_vec();
  locks.sort();

  let rendered = format!(
    "v{}|facts={}|sandbox={:?}|targets={:?}|context={}|action={:?}|shared_cache={}|locks={:?}|env={:?}",
    RULE_DIGEST_VERSION,
    inputs.facts.digest().hash,
    inputs.sandbox_mode,
    targets,
    inputs.context_name,
    inputs.action,
    inputs.can_go_in_shared_cache,
    locks,
    inputs.env,
  );
  Digest::of_bytes(rendered.as_bytes())
}

/// A single digest summarizing an entire target set, used for the trace DB's
/// `targets_digest` (§4.F step 7/8f): stable under insertion order, sensitive to any
/// change in which targets exist or what they contain.
pub fn targets_digest(targets: &BTreeMap<Path, Digest>) -> Digest {
  let mut rendered = String::new();
  for (path, digest) in targets {
    rendered.push_str(&format!("{path}=>{};", digest.hash));
  }
  Digest::of_bytes(rendered.as_bytes())
}

#[cfg(test)]
mod tests {
  use super::*;
  use action::{ActionDesc, Facts};

  fn inputs<'a>(
    facts: &'a Facts,
    targets: &'a [Path],
    env: &'a BTreeMap<String, String>,
  ) -> RuleDigestInputs<'a> {
    RuleDigestInputs {
      facts,
      sandbox_mode: SandboxMode::None,
      targets,
      context_name: "default",
      action: &ActionDesc::Progn(vec![]),
      can_go_in_shared_cache: true,
      locks: &[],
      env,
    }
  }

  #[test]
  fn same_inputs_same_digest() {
    let facts = Facts::new();
    let targets = vec![Path::Source("a".into())];
    let env = BTreeMap::new();
    let a = compute_rule_digest(&inputs(&facts, &targets, &env));
    let b = compute_rule_digest(&inputs(&facts, &targets, &env));
    assert_eq!(a, b);
  }

  #[test]
  fn target_order_does_not_matter() {
    let facts = Facts::new();
    let forward = vec![Path::Source("a".into()), Path::Source("b".into())];
    let backward = vec![Path::Source("b".into()), Path::Source("a".into())];
    let env = BTreeMap::new();
    assert_eq!(
      compute_rule_digest(&inputs(&facts, &forward, &env)),
      compute_rule_digest(&inputs(&facts, &backward, &env))
    );
  }

  #[test]
  fn different_sandbox_mode_changes_digest() {
    let facts = Facts::new();
    let targets = vec![Path::Source("a".into())];
    let env = BTreeMap::new();
    let mut symlink_inputs = inputs(&facts, &targets, &env);
    symlink_inputs.sandbox_mode = SandboxMode::Symlink;
    assert_ne!(
      compute_rule_digest(&inputs(&facts, &targets, &env)),
      compute_rule_digest(&symlink_inputs)
    );
  }

  #[test]
  fn different_env_changes_digest() {
    let facts = Facts::new();
    let targets = vec![Path::Source("a".into())];
    let mut gcc_env = BTreeMap::new();
    gcc_env.insert("CC".to_string(), "gcc".to_string());
    let mut clang_env = BTreeMap::new();
    clang_env.insert("CC".to_string(), "clang".to_string());
    assert_ne!(
      compute_rule_digest(&inputs(&facts, &targets, &gcc_env)),
      compute_rule_digest(&inputs(&facts, &targets, &clang_env))
    );
  }
}
