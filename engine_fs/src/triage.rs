use std::collections::HashSet;
use std::path::PathBuf;

use action::BuildContext;

use crate::generator::CtxOrInstall;

/// A directory the loader may be asked to load. Distinct from `action::Path` (which
/// addresses build *targets*, not necessarily directories) so that the root-of-the-build
/// and root-of-the-install-tree cases — which have no single context — have a home.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Dir {
  Source(PathBuf),
  External(PathBuf),
  /// The build root itself (`_build/`), before any context has been chosen.
  BuildRoot,
  /// The install root (`_build/install/`).
  InstallRoot,
  Context(BuildContext, PathBuf),
  InstallContext(BuildContext, PathBuf),
  /// A directory that does not correspond to any addressable build concept (e.g. a
  /// malformed anonymous-action path); loading it is always a programming error.
  Invalid,
}

/// The outcome of triaging a `Dir`, before step 2 of §4.E runs for context directories.
pub enum Triage {
  Source(PathBuf),
  External(PathBuf),
  NoRules { allowed_subdirs: HashSet<String> },
  Go {
    ctx_or_install: CtxOrInstall,
    sub_dir: PathBuf,
  },
  Invalid,
}

/// Step 1 of §4.E: classify `dir` before deciding whether the rule generator needs to run
/// at all. `known_contexts` names every context the build knows about, used to compute
/// the allowed-subdirs set at the build/install root (only a context's own subtree may
/// exist there).
pub fn triage(dir: &Dir, known_contexts: &[BuildContext]) -> Triage {
  match dir {
    Dir::Source(p) => Triage::Source(p.clone()),
    Dir::External(p) => Triage::External(p.clone()),
    Dir::BuildRoot | Dir::InstallRoot => Triage::NoRules {
      allowed_subdirs: known_contexts.iter().map(|c| c.0.clone()).collect(),
    },
    Dir::Context(ctx, sub) => Triage::Go {
      ctx_or_install: CtxOrInstall::Context(ctx.clone()),
      sub_dir: sub.clone(),
    },
    Dir::InstallContext(ctx, sub) => Triage::Go {
      ctx_or_install: CtxOrInstall::Install(ctx.clone()),
      sub_dir: sub.clone(),
    },
    Dir::Invalid => Triage::Invalid,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn root_allows_known_context_subdirs() {
    let contexts = vec![BuildContext("default".to_owned())];
    match triage(&Dir::BuildRoot, &contexts) {
      Triage::NoRules { allowed_subdirs } => {
        assert!(allowed_subdirs.contains("default"));
      }
      _ => panic!("expected NoRules"),
    }
  }

  #[test]
  fn context_dir_triages_to_go() {
    let contexts = vec![BuildContext("default".to_owned())];
    match triage(
      &Dir::Context(BuildContext("default".to_owned()), "lib".into()),
      &contexts,
    ) {
      Triage::Go { sub_dir, .. } => assert_eq!(sub_dir, PathBuf::from("lib")),
      _ => panic!("expected Go"),
    }
  }
}
