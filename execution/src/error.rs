use action::Path;
use thiserror::Error;

/// Errors the rule executor (§4.F) can surface. Mirrors the engine-wide taxonomy's split
/// between user-facing mistakes (bad rule declarations, actions that failed to produce
/// their declared targets) and internal/IO failures.
#[derive(Debug, Error)]
pub enum ExecutionError {
  #[error("rule declared target {0} but it does not exist or is unreadable after running")]
  MissingTarget(Path),
  #[error("{message}")]
  UserError { message: String },
  #[error("action interpreter failed: {0}")]
  Interpreter(String),
  #[error("shared cache error: {0}")]
  Cache(#[from] sharded_store::StoreError),
  #[error("io error at {path:?}: {source}")]
  Io {
    path: std::path::PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("internal error: {0}")]
  Internal(String),
}

impl ExecutionError {
  pub fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> ExecutionError {
    ExecutionError::Io {
      path: path.into(),
      source,
    }
  }
}
