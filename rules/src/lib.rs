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

//! The data model for rules and aliases (§4.D): an immutable `Rule` (targets + action +
//! mode), an `Alias` contribution, and the append-only `Rules` container that rule
//! generators build up as their return value.
//!
//! A generator function is not given a mutable "context" to push rules into; instead it
//! *returns* a `Rules` value, and the directory loader (`engine_fs`) unions it with
//! whatever the same directory's other contributors (the project-wide `global_rules`,
//! source-file-copy synthesis) produced. This is the explicit-builder rendering of §4.B's
//! "implicit output" effect described in the design notes: a `Rules` value is the thing a
//! generator's `collect` scope would have snapshotted.

mod dir_rules;
mod rule;

pub use dir_rules::{ConsumedRules, DirRules};
pub use rule::{
  ActionFactory, BuildDir, Info, Loc, Mode, Promote, PromoteLifetime, Rule, RuleId,
  RuleIdGenerator,
};

use std::collections::BTreeMap;

use action::Alias;
use thiserror::Error;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RulesError {
  #[error("rule {0:?} has no targets")]
  EmptyTargets(RuleId),
  #[error("rule {id:?}'s targets span more than one directory: {dir_a} and {dir_b}")]
  TargetsSpanMultipleDirs {
    id: RuleId,
    dir_a: String,
    dir_b: String,
  },
  #[error("rule id {0:?} was produced by two different rules/aliases")]
  DuplicateRuleId(RuleId),
}

/// One contribution to a `Rules` value: either a plain rule, or one expansion appended to
/// a named alias. Contributions are append-only and keyed by `RuleId` so that two
/// generators (or the same generator called twice for memoization purposes, see
/// `engine_fs::load_dir`) can be unioned without either clobbering the other.
#[derive(Clone)]
pub enum Contribution {
  Rule(Rule),
  Alias(Alias, Loc, ActionFactory),
}

/// The aggregate of every rule and alias contribution produced so far, keyed by the build
/// directory each contribution belongs to. `union` is the only way to combine two `Rules`
/// values; it is a checked merge (duplicate ids are an error) rather than a silent
/// overwrite, matching the data model's invariant that rule ids are unique per instance.
#[derive(Clone, Default)]
pub struct Rules {
  by_dir: BTreeMap<String, Vec<(RuleId, Contribution)>>,
}

impl Rules {
  pub fn new() -> Rules {
    Rules::default()
  }

  pub fn of_rule(rule: Rule) -> Result<Rules, RulesError> {
    rule.check_invariants()?;
    let mut rules = Rules::new();
    let key = rule.dir.key();
    rules
      .by_dir
      .entry(key)
      .or_default()
      .push((rule.id, Contribution::Rule(rule)));
    Ok(rules)
  }

  /// Contributes one expansion to `alias`. `dir` positions this contribution in the
  /// same `by_dir` bucket a plain rule in that directory would use (`BuildDir::key()`),
  /// which is what lets `engine_fs::load_dir` find it again: `Alias` itself carries only
  /// `(dir, name)` with no context, since that's the identity a dependent uses to name
  /// the alias it wants, but *storage* has to be keyed the same way rules are (by the
  /// concrete context-qualified directory the generator was contributing into) or two
  /// contexts' same-named subdirectories would collide.
  pub fn of_alias_contribution(
    id: RuleId,
    dir: BuildDir,
    alias: Alias,
    loc: Loc,
    action: ActionFactory,
  ) -> Rules {
    let mut rules = Rules::new();
    let key = dir.key();
    rules
      .by_dir
      .entry(key)
      .or_default()
      .push((id, Contribution::Alias(alias, loc, action)));
    rules
  }

  /// Merges `other` into `self`. Errors if any `RuleId` appears in both (the invariant
  /// that ids are unique per rule/alias-contribution instance would otherwise be
  /// violated).
  pub fn union(mut self, other: Rules) -> Result<Rules, RulesError> {
    for (dir, contributions) in other.by_dir {
      let existing = self.by_dir.entry(dir).or_default();
      let mut seen: std::collections::HashSet<RuleId> =
        existing.iter().map(|(id, _)| *id).collect();
      for (id, contribution) in contributions {
        if !seen.insert(id) {
          return Err(RulesError::DuplicateRuleId(id));
        }
        existing.push((id, contribution));
      }
    }
    Ok(self)
  }

  pub fn union_all(rules: impl IntoIterator<Item = Rules>) -> Result<Rules, RulesError> {
    rules.into_iter().try_fold(Rules::new(), Rules::union)
  }

  /// All contributions recorded for `dir_key` (see `BuildDir::key`), in insertion order.
  pub fn for_dir(&self, dir_key: &str) -> &[(RuleId, Contribution)] {
    self
      .by_dir
      .get(dir_key)
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }

  pub fn is_empty(&self) -> bool {
    self.by_dir.values().all(Vec::is_empty)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use action::{ActionBuilder, ActionFull, BuildContext, Path};
  use std::sync::Arc;

  fn rule(id: u64, dir: BuildDir, basename: &str) -> Rule {
    let target = Path::Build(dir.context.clone(), dir.sub_dir.join(basename));
    Rule {
      id: RuleId::for_test(id),
      dir,
      targets: vec![target],
      action: Arc::new(|| {
        ActionBuilder::pure(ActionFull::new(action::ActionDesc::Progn(vec![])))
      }),
      mode: Mode::Standard,
      info: Info::Internal,
      context: None,
      sandbox: action::SandboxConfig::default(),
    }
  }

  #[test]
  fn union_merges_distinct_ids() {
    let dir = BuildDir {
      context: BuildContext("default".to_owned()),
      sub_dir: "lib".into(),
    };
    let a = Rules::of_rule(rule(1, dir.clone(), "a")).unwrap();
    let b = Rules::of_rule(rule(2, dir.clone(), "b")).unwrap();
    let merged = a.union(b).unwrap();
    assert_eq!(merged.for_dir(&dir.key()).len(), 2);
  }

  #[test]
  fn union_rejects_duplicate_ids() {
    let dir = BuildDir {
      context: BuildContext("default".to_owned()),
      sub_dir: "lib".into(),
    };
    let a = Rules::of_rule(rule(1, dir.clone(), "a")).unwrap();
    let b = Rules::of_rule(rule(1, dir.clone(), "b")).unwrap();
    assert!(matches!(a.union(b), Err(RulesError::DuplicateRuleId(_))));
  }

  #[test]
  fn empty_targets_is_rejected() {
    let dir = BuildDir {
      context: BuildContext("default".to_owned()),
      sub_dir: "lib".into(),
    };
    let mut r = rule(1, dir, "x");
    r.targets.clear();
    assert!(matches!(
      Rules::of_rule(r),
      Err(RulesError::EmptyTargets(_))
    ));
  }
}
