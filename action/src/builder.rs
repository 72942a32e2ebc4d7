use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use hashing::Digest;
use parking_lot::Mutex;
use thiserror::Error;

use crate::alias::Alias;
use crate::dep::{Dep, Fact, Facts, Predicate, SandboxConfig};
use crate::path::Path;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuilderError {
  #[error("no rule produces {0}")]
  MissingFile(Path),
  #[error("{0}")]
  UserError(String),
  #[error("internal error: {0}")]
  Internal(String),
}

/// The engine-provided means of turning a declared `Dep` into its `Fact`. Implemented by
/// the rule executor (`execution` crate), which knows how to recursively build files and
/// expand aliases; kept as a trait here so the action builder has no dependency on the
/// executor.
#[async_trait]
pub trait DepResolver: Send + Sync {
  async fn resolve_file(&self, path: &Path) -> Result<Digest, BuilderError>;
  async fn resolve_alias(&self, alias: &Alias) -> Result<BTreeMap<Path, Digest>, BuilderError>;
  async fn resolve_file_selector(
    &self,
    dir: &Path,
    predicate: &Predicate,
  ) -> Result<BTreeMap<Path, Digest>, BuilderError>;
  fn resolve_env(&self, var: &str) -> Option<String>;
}

/// The environment an `ActionBuilder` executes in: a resolver to answer dependency
/// queries, plus the running accumulator of every `Dep` asked about so far.
#[derive(Clone)]
pub struct Env {
  resolver: Arc<dyn DepResolver>,
  facts: Arc<Mutex<Facts>>,
}

impl Env {
  pub fn new(resolver: Arc<dyn DepResolver>) -> Env {
    Env {
      resolver,
      facts: Arc::new(Mutex::new(Facts::new())),
    }
  }

  fn record(&self, dep: Dep, fact: Fact) {
    self.facts.lock().insert(dep, fact);
  }

  /// Consumes the environment, returning every fact recorded while one or more
  /// `ActionBuilder`s ran against it.
  pub fn into_facts(self) -> Facts {
    Arc::try_unwrap(self.facts)
      .map(|m| m.into_inner())
      .unwrap_or_else(|arc| arc.lock().clone())
  }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type Thunk<T> = Box<dyn FnOnce(Env) -> BoxFuture<'static, Result<T, BuilderError>> + Send>;

/// A monadic description of "compute a `T`, declaring dependencies along the way". The
/// dependencies declared are not known until the builder actually runs (different
/// branches of an `and_then` can declare different deps), which is exactly what makes the
/// rule digest (computed from the resulting `Facts`) sound: it reflects what this
/// particular run actually touched.
pub struct ActionBuilder<T> {
  thunk: Thunk<T>,
}

impl<T: Send + 'static> ActionBuilder<T> {
  pub fn new<F>(f: F) -> ActionBuilder<T>
  where
    F: FnOnce(Env) -> BoxFuture<'static, Result<T, BuilderError>> + Send + 'static,
  {
    ActionBuilder { thunk: Box::new(f) }
  }

  pub fn pure(value: T) -> ActionBuilder<T> {
    ActionBuilder::new(move |_env| Box::pin(async move { Ok(value) }))
  }

  pub fn fail(error: BuilderError) -> ActionBuilder<T> {
    ActionBuilder::new(move |_env| Box::pin(async move { Err(error) }))
  }

  pub async fn run(self, env: Env) -> Result<T, BuilderError> {
    (self.thunk)(env).await
  }

  pub fn map<U, F>(self, f: F) -> ActionBuilder<U>
  where
    U: Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
  {
    ActionBuilder::new(move |env| Box::pin(async move { Ok(f(self.run(env).await?)) }))
  }

  pub fn and_then<U, F>(self, f: F) -> ActionBuilder<U>
  where
    U: Send + 'static,
    F: FnOnce(T) -> ActionBuilder<U> + Send + 'static,
  {
    ActionBuilder::new(move |env| {
      Box::pin(async move {
        let value = self.run(env.clone()).await?;
        f(value).run(env).await
      })
    })
  }

  /// Runs `self` and `other` in sequence, keeping both results. Unlike `and_then`, `other`
  /// is not allowed to depend on `self`'s value, which lets the executor parallelize the
  /// two by construction (see `parallel`).
  pub fn both<U>(self, other: ActionBuilder<U>) -> ActionBuilder<(T, U)>
  where
    U: Send + 'static,
  {
    ActionBuilder::new(move |env| {
      Box::pin(async move {
        let (a, b) = futures::try_join!(self.run(env.clone()), other.run(env))?;
        Ok((a, b))
      })
    })
  }

  pub fn with_error_handler<F>(self, handler: F) -> ActionBuilder<T>
  where
    F: FnOnce(BuilderError) -> Result<T, BuilderError> + Send + 'static,
  {
    ActionBuilder::new(move |env| {
      Box::pin(async move {
        match self.run(env).await {
          Ok(v) => Ok(v),
          Err(e) => handler(e),
        }
      })
    })
  }
}

impl ActionBuilder<Digest> {
  /// Declares a dependency on `path` existing (and being built), resolving to its digest.
  pub fn path(path: Path) -> ActionBuilder<Digest> {
    ActionBuilder::new(move |env| {
      Box::pin(async move {
        let digest = env.resolver.resolve_file(&path).await?;
        env.record(Dep::File(path), Fact::File(digest));
        Ok(digest)
      })
    })
  }
}

impl ActionBuilder<BTreeMap<Path, Digest>> {
  pub fn dep_on_alias(alias: Alias) -> ActionBuilder<BTreeMap<Path, Digest>> {
    ActionBuilder::new(move |env| {
      Box::pin(async move {
        let expansion = env.resolver.resolve_alias(&alias).await?;
        env.record(Dep::Alias(alias), Fact::Alias(expansion.clone()));
        Ok(expansion)
      })
    })
  }

  /// As `dep_on_alias`, but an alias with no contributions anywhere in the build resolves
  /// to an empty set instead of a missing-file error.
  pub fn dep_on_alias_if_exists(alias: Alias) -> ActionBuilder<BTreeMap<Path, Digest>> {
    ActionBuilder::new(move |env| {
      Box::pin(async move {
        match env.resolver.resolve_alias(&alias).await {
          Ok(expansion) => {
            env.record(Dep::Alias(alias), Fact::Alias(expansion.clone()));
            Ok(expansion)
          }
          Err(BuilderError::MissingFile(_)) => Ok(BTreeMap::new()),
          Err(other) => Err(other),
        }
      })
    })
  }

  pub fn file_selector(dir: Path, predicate: Predicate) -> ActionBuilder<BTreeMap<Path, Digest>> {
    ActionBuilder::new(move |env| {
      Box::pin(async move {
        let matches = env
          .resolver
          .resolve_file_selector(&dir, &predicate)
          .await?;
        env.record(
          Dep::FileSelector(dir, predicate),
          Fact::FileSelector(matches.clone()),
        );
        Ok(matches)
      })
    })
  }
}

impl ActionBuilder<Option<String>> {
  pub fn env_var(name: String) -> ActionBuilder<Option<String>> {
    ActionBuilder::new(move |env| {
      Box::pin(async move {
        let value = env.resolver.resolve_env(&name);
        env.record(Dep::Env(name), Fact::Env(value.clone()));
        Ok(value)
      })
    })
  }
}

impl ActionBuilder<()> {
  pub fn universe() -> ActionBuilder<()> {
    ActionBuilder::new(move |env| {
      Box::pin(async move {
        env.record(Dep::Universe, Fact::Universe);
        Ok(())
      })
    })
  }

  pub fn sandbox_config(config: SandboxConfig) -> ActionBuilder<()> {
    ActionBuilder::new(move |env| {
      Box::pin(async move {
        env.record(Dep::SandboxConfig(config), Fact::SandboxConfig);
        Ok(())
      })
    })
  }
}

/// Runs every builder in `builders` concurrently, collecting all of their results (and
/// merging all of their declared deps) or the first error encountered.
pub fn parallel<T: Send + 'static>(
  builders: Vec<ActionBuilder<T>>,
) -> ActionBuilder<Vec<T>> {
  ActionBuilder::new(move |env| {
    Box::pin(async move {
      let futures = builders.into_iter().map(|b| b.run(env.clone()));
      try_join_all(futures).await
    })
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;
  use std::sync::Mutex as StdMutex;

  struct FakeResolver {
    files: StdMutex<BTreeMap<Path, Digest>>,
  }

  #[async_trait]
  impl DepResolver for FakeResolver {
    async fn resolve_file(&self, path: &Path) -> Result<Digest, BuilderError> {
      self
        .files
        .lock()
        .unwrap()
        .get(path)
        .copied()
        .ok_or_else(|| BuilderError::MissingFile(path.clone()))
    }
    async fn resolve_alias(&self, _alias: &Alias) -> Result<BTreeMap<Path, Digest>, BuilderError> {
      Ok(BTreeMap::new())
    }
    async fn resolve_file_selector(
      &self,
      _dir: &Path,
      _predicate: &Predicate,
    ) -> Result<BTreeMap<Path, Digest>, BuilderError> {
      Ok(BTreeMap::new())
    }
    fn resolve_env(&self, _var: &str) -> Option<String> {
      None
    }
  }

  #[tokio::test]
  async fn path_records_a_fact() {
    let path = Path::Source("a.txt".into());
    let digest = Digest::of_bytes(b"hi");
    let mut files = BTreeMap::new();
    files.insert(path.clone(), digest);
    let resolver = Arc::new(FakeResolver {
      files: StdMutex::new(files),
    });
    let env = Env::new(resolver);

    let result = ActionBuilder::path(path.clone()).run(env.clone()).await;
    assert_eq!(result.unwrap(), digest);
    let facts = env.into_facts();
    assert_eq!(facts.len(), 1);
  }

  #[tokio::test]
  async fn missing_file_is_an_error() {
    let resolver = Arc::new(FakeResolver {
      files: StdMutex::new(BTreeMap::new()),
    });
    let env = Env::new(resolver);
    let result = ActionBuilder::path(Path::Source("missing".into()))
      .run(env)
      .await;
    assert!(matches!(result, Err(BuilderError::MissingFile(_))));
  }

  #[tokio::test]
  async fn and_then_chains_and_merges_facts() {
    let mut files = BTreeMap::new();
    let a = Path::Source("a".into());
    let b = Path::Source("b".into());
    files.insert(a.clone(), Digest::of_bytes(b"a"));
    files.insert(b.clone(), Digest::of_bytes(b"b"));
    let resolver = Arc::new(FakeResolver {
      files: StdMutex::new(files),
    });
    let env = Env::new(resolver);

    let builder = ActionBuilder::path(a).and_then(move |_| ActionBuilder::path(b));
    let result = builder.run(env.clone()).await;
    assert!(result.is_ok());
    assert_eq!(env.into_facts().len(), 2);
  }
}
