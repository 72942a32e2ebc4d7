use std::collections::BTreeMap;
use std::fmt;

use hashing::Digest;
use indexmap::IndexMap;

use crate::alias::Alias;
use crate::path::Path;

/// Which sandbox modes a rule is willing, or required, to run under. `required` is a
/// non-empty subset of `permitted`; if the executor cannot honor any mode in `required`
/// (e.g. `hardlink` requested on a filesystem without hardlink support) the build fails
/// rather than silently relaxing the constraint.
#[derive(Clone, Eq, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
pub struct SandboxConfig {
  pub permitted: Vec<SandboxMode>,
  pub required: Vec<SandboxMode>,
}

impl Default for SandboxConfig {
  fn default() -> Self {
    SandboxConfig {
      permitted: vec![
        SandboxMode::None,
        SandboxMode::Symlink,
        SandboxMode::Hardlink,
        SandboxMode::Copy,
      ],
      required: Vec::new(),
    }
  }
}

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize, serde::Deserialize)]
pub enum SandboxMode {
  None,
  Symlink,
  Hardlink,
  Copy,
  PatchBackSourceTree,
}

/// A single thing an action (or an alias) can depend on. `Dep` values are declared while
/// an `ActionBuilder` runs; each is resolved to a `Fact` before the rule digest (see the
/// executor) is computed, so that the digest captures exactly what the action observed.
#[derive(Clone, Eq, PartialEq, Hash, Debug, serde::Serialize, serde::Deserialize)]
pub enum Dep {
  /// The target must exist (and be built) after its producer runs.
  File(Path),
  /// All files that `alias` transitively expands to.
  Alias(Alias),
  /// Every file directly inside `dir` whose name matches `predicate`.
  FileSelector(Path, Predicate),
  /// The value of an environment variable, opted into the rule digest explicitly.
  Env(String),
  /// An opaque "always considered different" marker: any dependent is never trace-hit.
  Universe,
  /// A constraint on which sandbox modes may satisfy this action.
  SandboxConfig(SandboxConfig),
}

impl Dep {
  pub fn file(path: Path) -> Dep {
    Dep::File(path)
  }
}

/// A glob-like predicate over file basenames, used by `Dep::FileSelector`. Kept narrow and
/// serializable rather than an opaque closure so that it can participate in the rule
/// digest.
#[derive(Clone, Eq, PartialEq, Hash, Debug, serde::Serialize, serde::Deserialize)]
pub struct Predicate(pub String);

impl Predicate {
  pub fn matches(&self, basename: &str) -> bool {
    // A single `*` wildcard is supported, matching the common "*.o"/"lib*.a" shapes;
    // anything more elaborate is expected to be narrowed by the rule generator before it
    // reaches the core.
    match self.0.split_once('*') {
      Some((prefix, suffix)) => {
        basename.len() >= prefix.len() + suffix.len()
          && basename.starts_with(prefix)
          && basename.ends_with(suffix)
      }
      None => basename == self.0,
    }
  }
}

/// The resolved value of a `Dep`, computed once and then folded into the rule digest.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Fact {
  File(Digest),
  Alias(BTreeMap<Path, Digest>),
  FileSelector(BTreeMap<Path, Digest>),
  Env(Option<String>),
  Universe,
  SandboxConfig,
}

/// An ordered map of every `Dep` an `ActionBuilder` run touched, to its resolved `Fact`.
/// Order is insertion order (the order deps were first declared), which matters for
/// replaying dynamic-dependency stages against the trace database.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Facts(IndexMap<Dep, Fact>);

impl Facts {
  pub fn new() -> Facts {
    Facts(IndexMap::new())
  }

  pub fn insert(&mut self, dep: Dep, fact: Fact) {
    self.0.insert(dep, fact);
  }

  pub fn get(&self, dep: &Dep) -> Option<&Fact> {
    self.0.get(dep)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&Dep, &Fact)> {
    self.0.iter()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn merge(&mut self, other: Facts) {
    for (dep, fact) in other.0 {
      self.0.insert(dep, fact);
    }
  }

  /// A digest of the entire fact set, used as an input to the rule digest. Stable given
  /// the same set of deps resolved to the same facts, regardless of the order new deps
  /// happened to be discovered on *this* run (the map is sorted before hashing).
  pub fn digest(&self) -> Digest {
    let mut rendered = String::new();
    let mut entries: Vec<(String, String)> = self
      .0
      .iter()
      .map(|(dep, fact)| (format!("{dep:?}"), format!("{fact:?}")))
      .collect();
    entries.sort();
    for (dep, fact) in entries {
      fmt::Write::write_fmt(&mut rendered, format_args!("{dep}=>{fact};")).unwrap();
    }
    Digest::of_bytes(rendered.as_bytes())
  }
}
