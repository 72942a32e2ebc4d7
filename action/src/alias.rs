use std::fmt;
use std::path::PathBuf;

/// A named, appendable set of dependencies, scoped to a build directory. Aliases are not
/// files: `@default`, `@all`, `@install` and user-defined aliases all work this way.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Debug, serde::Serialize, serde::Deserialize)]
pub struct Alias {
  pub dir: PathBuf,
  pub name: String,
}

impl Alias {
  pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Alias {
    Alias {
      dir: dir.into(),
      name: name.into(),
    }
  }

  pub fn default_in(dir: impl Into<PathBuf>) -> Alias {
    Alias::new(dir, "default")
  }

  pub fn all_in(dir: impl Into<PathBuf>) -> Alias {
    Alias::new(dir, "all")
  }

  pub fn install_in(dir: impl Into<PathBuf>) -> Alias {
    Alias::new(dir, "install")
  }
}

impl fmt::Display for Alias {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "@{}", self.name)?;
    if !self.dir.as_os_str().is_empty() {
      write!(f, " (in {})", self.dir.display())?;
    }
    Ok(())
  }
}
