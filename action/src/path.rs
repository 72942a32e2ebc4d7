use std::fmt;
use std::path::{Path as StdPath, PathBuf};

/// An identifier for one of the build's named output contexts (e.g. a particular profile
/// or cross-compilation target). Distinct contexts have independent build directories.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Debug, serde::Serialize, serde::Deserialize)]
pub struct Context(pub String);

impl fmt::Display for Context {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A path tagged by which part of the build's universe it lives in. Equality and
/// ordering are derived rather than normalizing to a single namespace, so a `Source`
/// path and a `Build` path with the same textual suffix are never confused for each
/// other.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Debug, serde::Serialize, serde::Deserialize)]
pub enum Path {
  /// A read-only input under the project's source tree.
  Source(PathBuf),
  /// An output location under a context's build directory.
  Build(Context, PathBuf),
  /// A target of an install-root rule, distinct from a regular build output so that
  /// install rules can be filtered independently of ordinary build rules.
  Install(Context, PathBuf),
  /// A synthetic target for an anonymous action, keyed by the action's own digest rather
  /// than a user-chosen name.
  AnonymousAction(Context, hashing::Digest),
  /// A path entirely outside the source tree and build root (an absolute path named by a
  /// rule, or a path resolved from the ambient environment).
  External(PathBuf),
}

impl Path {
  pub fn is_source(&self) -> bool {
    matches!(self, Path::Source(_))
  }

  pub fn is_build(&self) -> bool {
    matches!(self, Path::Build(..) | Path::Install(..) | Path::AnonymousAction(..))
  }

  pub fn context(&self) -> Option<&Context> {
    match self {
      Path::Build(ctx, _) | Path::Install(ctx, _) | Path::AnonymousAction(ctx, _) => Some(ctx),
      Path::Source(_) | Path::External(_) => None,
    }
  }

  /// The directory component of this path, within whatever namespace it belongs to.
  pub fn parent_dir(&self) -> Option<&StdPath> {
    match self {
      Path::Source(p) | Path::External(p) => p.parent(),
      Path::Build(_, p) | Path::Install(_, p) => p.parent(),
      Path::AnonymousAction(..) => None,
    }
  }
}

impl fmt::Display for Path {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Path::Source(p) => write!(f, "{}", p.display()),
      Path::Build(ctx, p) => write!(f, "_build/{}/{}", ctx, p.display()),
      Path::Install(ctx, p) => write!(f, "_build/install/{}/{}", ctx, p.display()),
      Path::AnonymousAction(ctx, digest) => {
        write!(f, "_build/{ctx}/.actions/{}", digest.hash)
      }
      Path::External(p) => write!(f, "{}", p.display()),
    }
  }
}
