use thiserror::Error;

/// The directory loader's error taxonomy, mirroring §7: user-caused rule conflicts carry a
/// location/hint-style message; everything else is either an I/O failure or an engine
/// invariant violation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LoadError {
  #[error("{message}")]
  UserError { message: String, hints: Vec<String> },
  #[error("I/O error at {path}: {detail}")]
  Io { path: String, detail: String },
  #[error("internal error: {0}")]
  Internal(String),
}

impl LoadError {
  pub fn user(message: impl Into<String>) -> LoadError {
    LoadError::UserError {
      message: message.into(),
      hints: Vec::new(),
    }
  }

  pub fn user_with_hints(message: impl Into<String>, hints: Vec<String>) -> LoadError {
    LoadError::UserError {
      message: message.into(),
      hints,
    }
  }

  pub fn io(path: impl Into<String>, err: &std::io::Error) -> LoadError {
    LoadError::Io {
      path: path.into(),
      detail: err.to_string(),
    }
  }
}
