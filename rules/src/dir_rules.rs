use std::collections::BTreeMap;

use action::Alias;

use crate::rule::{ActionFactory, Loc, Rule};
use crate::{Contribution, Rules};

/// The result of partitioning one directory's contributions (§4.D `Dir_rules.consume`):
/// the plain rule list, plus an alias-name-indexed map of appendable expansions, each
/// retaining the order contributions were unioned in.
#[derive(Clone, Default)]
pub struct ConsumedRules {
  pub rules: Vec<Rule>,
  pub aliases: BTreeMap<String, Vec<(Loc, ActionFactory)>>,
}

impl ConsumedRules {
  pub fn alias_contributions(&self, name: &str) -> &[(Loc, ActionFactory)] {
    self
      .aliases
      .get(name)
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }
}

/// A view over one directory's raw contributions within a `Rules` value, prior to
/// partitioning.
pub struct DirRules<'a> {
  dir_key: String,
  rules: &'a Rules,
}

impl<'a> DirRules<'a> {
  pub fn new(rules: &'a Rules, dir_key: String) -> DirRules<'a> {
    DirRules { dir_key, rules }
  }

  /// Splits this directory's contributions into plain rules and alias expansions.
  /// Multiple contributions to the same alias append in the order they were unioned, so
  /// that expansion order is insertion order (§4.D: "Alias definitions are append-only").
  pub fn consume(self) -> ConsumedRules {
    let mut out = ConsumedRules::default();
    for (_, contribution) in self.rules.for_dir(&self.dir_key) {
      match contribution {
        Contribution::Rule(rule) => out.rules.push(rule.clone()),
        Contribution::Alias(alias, loc, action) => {
          out
            .aliases
            .entry(alias_key(alias))
            .or_default()
            .push((loc.clone(), action.clone()));
        }
      }
    }
    out
  }
}

fn alias_key(alias: &Alias) -> String {
  alias.name.clone()
}
