use action::{Alias, BuilderError, Path};
use engine_fs::LoadError;
use thiserror::Error;

/// The engine-wide error type every `BuildNode` run can fail with. Mirrors the taxonomy
/// the lower crates already split into (a user-facing rule-declaration mistake, an
/// action that failed, an I/O failure) by wrapping each crate's own error rather than
/// re-deriving the split; `graph::NodeError`'s `cyclic`/`invalidated` cases round it out
/// with the two failure modes that only make sense at the memo-graph layer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuildError {
  #[error("no rule produces {0}")]
  MissingFile(Path),
  #[error("no alias named {0} is declared anywhere the build looked for it")]
  MissingAlias(Alias),
  #[error("{0}")]
  Load(#[from] LoadError),
  #[error("{0}")]
  Builder(#[from] BuilderError),
  #[error("running a rule's action failed: {0}")]
  Execution(String),
  #[error("Dependency cycle: {0:?}")]
  Cyclic(Vec<String>),
  #[error("build node invalidated while it was still running")]
  Invalidated,
  #[error("internal error: {0}")]
  Internal(String),
}

impl From<execution::ExecutionError> for BuildError {
  fn from(err: execution::ExecutionError) -> BuildError {
    BuildError::Execution(err.to_string())
  }
}

impl graph::NodeError for BuildError {
  fn invalidated() -> BuildError {
    BuildError::Invalidated
  }

  fn cyclic(path: Vec<String>) -> BuildError {
    BuildError::Cyclic(path)
  }

  fn generic(message: String) -> BuildError {
    BuildError::Internal(message)
  }
}

/// Renders a `BuildError` the way an `action::DepResolver` implementation must: a
/// missing file/rule becomes the specific `BuilderError::MissingFile` variant an
/// `ActionBuilder::dep_on_alias_if_exists`-style caller pattern-matches on, and anything
/// already-a-`BuilderError` passes through unchanged.
pub fn to_builder_error(err: BuildError) -> BuilderError {
  match err {
    BuildError::MissingFile(path) => BuilderError::MissingFile(path),
    BuildError::MissingAlias(alias) => {
      BuilderError::MissingFile(Path::External(std::path::PathBuf::from(format!("@{alias}"))))
    }
    BuildError::Builder(e) => e,
    other => BuilderError::Internal(other.to_string()),
  }
}

/// Renders a `BuildError` for the one seam that must report back into `execution`'s own
/// error type (`DynamicDepsResolver::resolve_digest`).
pub fn to_execution_error(err: BuildError) -> execution::ExecutionError {
  execution::ExecutionError::Internal(err.to_string())
}
