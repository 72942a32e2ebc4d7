use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use action::{Alias, BuildContext, Dep, Env as ActionEnv, Fact, Path, Predicate};
use async_trait::async_trait;
use engine_fs::{load_dir, Dir, Loaded};
use graph::{Context, Node};
use hashing::Digest;

use crate::error::BuildError;
use crate::resolver::GraphDepResolver;
use crate::session::SessionContext;

/// Wraps `engine_fs::Loaded` with the `Eq`/`Debug` a `graph::Node::Item` needs. `Loaded`
/// itself can't derive either (a `Rule`'s `ActionFactory` is a boxed closure), so equality
/// here is defined over a rendered *signature* of the directory's contents: the set of
/// targets, which rule id produces each, and which aliases exist with how many
/// contributions. Two loads with the same signature are the ones the memo graph's cutoff
/// should treat as "nothing changed" even if the `ActionFactory` closures underneath are
/// distinct `Arc` allocations.
#[derive(Clone)]
pub struct LoadedDirResult(Arc<Loaded>);

impl LoadedDirResult {
  fn new(loaded: Loaded) -> LoadedDirResult {
    LoadedDirResult(Arc::new(loaded))
  }

  pub fn loaded(&self) -> &Loaded {
    &self.0
  }

  fn signature(&self) -> String {
    match &*self.0 {
      Loaded::NonBuild { files } => format!("NonBuild{files:?}"),
      Loaded::Build {
        allowed_subdirs,
        rules_here,
        aliases,
        ..
      } => {
        let mut subdirs: Vec<&String> = allowed_subdirs.iter().collect();
        subdirs.sort();
        let mut out = format!("Build subdirs={subdirs:?} targets=[");
        for (path, rule) in rules_here {
          out.push_str(&format!("{path}=>{:?};", rule.id));
        }
        out.push_str("] aliases=[");
        let mut names: Vec<&String> = aliases.keys().collect();
        names.sort();
        for name in names {
          out.push_str(&format!("{name}:{};", aliases[name].len()));
        }
        out.push(']');
        out
      }
    }
  }
}

impl fmt::Debug for LoadedDirResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "LoadedDirResult({})", self.signature())
  }
}

impl PartialEq for LoadedDirResult {
  fn eq(&self, other: &LoadedDirResult) -> bool {
    self.signature() == other.signature()
  }
}

impl Eq for LoadedDirResult {}

/// The value produced by running a `BuildNode`. A single enum rather than an associated
/// type per variant because `graph::Node::Item` is one type for the whole node type; the
/// `into_*` accessors below are how callers narrow back to what they expect, which is
/// always knowable in advance since the node's own identity determines its item's shape.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum BuildItem {
  Loaded(LoadedDirResult),
  File(Digest),
  Alias(BTreeMap<Path, Digest>),
  FileSelector(BTreeMap<Path, Digest>),
}

impl BuildItem {
  pub fn into_loaded(self) -> Result<LoadedDirResult, BuildError> {
    match self {
      BuildItem::Loaded(l) => Ok(l),
      _ => Err(BuildError::Internal(
        "expected a loaded directory".to_owned(),
      )),
    }
  }

  pub fn into_file_digest(self) -> Result<Digest, BuildError> {
    match self {
      BuildItem::File(d) => Ok(d),
      _ => Err(BuildError::Internal("expected a file digest".to_owned())),
    }
  }

  pub fn into_path_map(self) -> Result<BTreeMap<Path, Digest>, BuildError> {
    match self {
      BuildItem::Alias(m) | BuildItem::FileSelector(m) => Ok(m),
      _ => Err(BuildError::Internal(
        "expected a path -> digest map".to_owned(),
      )),
    }
  }
}

/// A unit of memoized build work (the "fixpoint module" binding `build_file` and
/// `load_dir`'s mutual recursion described in the design notes): loading a directory's
/// rules, building a single file, expanding an alias, or evaluating a file-selector dep.
/// Each variant recurses into the others purely through `Context::get`, so there is no
/// direct call from, say, `BuildFile`'s handler back into `load_dir`'s function — only
/// through the graph, which is what gives the recursion memoization and cycle detection
/// for free.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum BuildNode {
  LoadDir(Dir),
  BuildFile(Path),
  Alias(BuildContext, Alias),
  FileSelector(Path, Predicate),
}

#[async_trait]
impl Node for BuildNode {
  type SessionContext = SessionContext;
  type Item = BuildItem;
  type Error = BuildError;

  async fn run(self, context: Context<BuildNode>) -> Result<BuildItem, BuildError> {
    match self {
      BuildNode::LoadDir(dir) => run_load_dir(dir, &context).await,
      BuildNode::BuildFile(path) => run_build_file(path, &context).await,
      BuildNode::Alias(ctx, alias) => run_alias(ctx, alias, &context).await,
      BuildNode::FileSelector(dir, predicate) => run_file_selector(dir, predicate, &context).await,
    }
  }

  fn display_info(&self) -> String {
    match self {
      BuildNode::LoadDir(dir) => format!("load {dir:?}"),
      BuildNode::BuildFile(path) => format!("build {path}"),
      BuildNode::Alias(ctx, alias) => format!("build {alias} (in {ctx})"),
      BuildNode::FileSelector(dir, predicate) => format!("select {:?} in {dir}", predicate.0),
    }
  }
}

async fn run_load_dir(dir: Dir, context: &Context<BuildNode>) -> Result<BuildItem, BuildError> {
  let loaded = load_dir(
    &dir,
    context.generator.as_ref(),
    context.disk.as_ref(),
    &context.roots,
    &context.known_contexts,
    context.default_alias_target,
    &context.id_gen,
  )
  .await?;
  Ok(BuildItem::Loaded(LoadedDirResult::new(loaded)))
}

/// The directory a build-tree path's targets are loaded from: the parent of its
/// sub-path, in whichever of the context's ordinary or install tree the path addresses.
fn containing_dir(ctx: &BuildContext, sub_path: &std::path::Path, install: bool) -> Dir {
  let parent = sub_path
    .parent()
    .map(std::path::Path::to_path_buf)
    .unwrap_or_default();
  if install {
    Dir::InstallContext(ctx.clone(), parent)
  } else {
    Dir::Context(ctx.clone(), parent)
  }
}

async fn run_build_file(path: Path, context: &Context<BuildNode>) -> Result<BuildItem, BuildError> {
  match &path {
    Path::Source(p) => {
      let digest = hash_plain_file(context, &context.roots.source_root.join(p)).await?;
      Ok(BuildItem::File(digest))
    }
    Path::External(p) => {
      let digest = hash_plain_file(context, p).await?;
      Ok(BuildItem::File(digest))
    }
    Path::Build(ctx, p) => {
      let dir = containing_dir(ctx, p, false);
      build_via_rule(&path, dir, ctx, context).await
    }
    Path::Install(ctx, p) => {
      let dir = containing_dir(ctx, p, true);
      build_via_rule(&path, dir, ctx, context).await
    }
    Path::AnonymousAction(ctx, _) => {
      // An anonymous action's target lives at the root of its context's build tree (see
      // `action::Path`'s `Display` impl: `_build/{ctx}/.actions/{digest}`).
      let dir = Dir::Context(ctx.clone(), std::path::PathBuf::new());
      build_via_rule(&path, dir, ctx, context).await
    }
  }
}

async fn hash_plain_file(
  context: &Context<BuildNode>,
  absolute: &std::path::Path,
) -> Result<Digest, BuildError> {
  context
    .cached_digest
    .refresh(absolute, false)
    .map_err(|e| BuildError::Internal(format!("reading {}: {e}", absolute.display())))
}

/// Loads the rule map for `dir`, looks `target` up in it, and runs that rule (§4.F's core
/// algorithm, via `execution::RuleExecutor`), returning the specific target's digest.
///
/// Multiple targets of the same rule are not coalesced at this layer: each target is its
/// own `BuildNode::BuildFile`, so two targets of one rule requested independently each
/// re-run the rule's `ActionBuilder` and call `execute_rule` on their own. This stays
/// cheap because `execute_rule`'s own trace database is keyed by the rule's first target
/// regardless of which target asked, so the second caller always lands a trace hit; it is
/// simply not deduplicated at the memo-graph level the way a single-target rule is.
async fn build_via_rule(
  target: &Path,
  dir: Dir,
  ctx: &BuildContext,
  context: &Context<BuildNode>,
) -> Result<BuildItem, BuildError> {
  let loaded = context
    .get(BuildNode::LoadDir(dir))
    .await?
    .into_loaded()?;
  let rule = match loaded.loaded() {
    Loaded::Build { rules_here, .. } => rules_here
      .get(target)
      .cloned()
      .ok_or_else(|| BuildError::MissingFile(target.clone()))?,
    Loaded::NonBuild { .. } => return Err(BuildError::MissingFile(target.clone())),
  };

  let resolver: Arc<GraphDepResolver> = Arc::new(GraphDepResolver::new(context.clone(), ctx.clone()));
  let env = ActionEnv::new(resolver.clone());
  let action_full = (rule.action)()
    .run(env.clone())
    .await
    .map_err(BuildError::Builder)?;
  let facts = env.into_facts();

  let digests = context
    .rule_executor
    .execute_rule(
      &rule,
      action_full,
      &facts,
      &ctx.0,
      context.force_rerun,
      resolver.as_ref(),
    )
    .await?;

  digests
    .get(target)
    .copied()
    .map(BuildItem::File)
    .ok_or_else(|| {
      BuildError::Internal(format!(
        "rule for {target} ran successfully but did not report that target's digest"
      ))
    })
}

async fn run_alias(
  ctx: BuildContext,
  alias: Alias,
  context: &Context<BuildNode>,
) -> Result<BuildItem, BuildError> {
  let dir = Dir::Context(ctx.clone(), alias.dir.clone());
  let loaded = context
    .get(BuildNode::LoadDir(dir))
    .await?
    .into_loaded()?;
  let contributions = match loaded.loaded() {
    Loaded::Build { aliases, .. } => aliases
      .get(&alias.name)
      .cloned()
      .ok_or_else(|| BuildError::MissingAlias(alias.clone()))?,
    Loaded::NonBuild { .. } => return Err(BuildError::MissingAlias(alias.clone())),
  };

  let mut expansion: BTreeMap<Path, Digest> = BTreeMap::new();
  for (_loc, factory) in contributions {
    let resolver: Arc<GraphDepResolver> =
      Arc::new(GraphDepResolver::new(context.clone(), ctx.clone()));
    let env = ActionEnv::new(resolver);
    // The alias contribution's own `ActionFull` result is discarded: what matters is the
    // dependency closure it declared while running, which is how a generated `@default`
    // that just depends on `@all` expands transitively without this crate needing to know
    // anything about alias-to-alias composition.
    let _ = factory().run(env.clone()).await.map_err(BuildError::Builder)?;
    for (dep, fact) in env.into_facts().iter() {
      match (dep, fact) {
        (Dep::File(path), Fact::File(digest)) => {
          expansion.insert(path.clone(), *digest);
        }
        (Dep::Alias(_), Fact::Alias(map)) | (Dep::FileSelector(..), Fact::FileSelector(map)) => {
          expansion.extend(map.clone());
        }
        _ => {}
      }
    }
  }
  Ok(BuildItem::Alias(expansion))
}

async fn run_file_selector(
  dir: Path,
  predicate: Predicate,
  context: &Context<BuildNode>,
) -> Result<BuildItem, BuildError> {
  let mut matches: BTreeMap<Path, Digest> = BTreeMap::new();
  match &dir {
    Path::Source(p) => {
      let entries = context
        .disk
        .read_dir(&context.roots.source_root.join(p))
        .await
        .map_err(|e| BuildError::Internal(e.to_string()))?;
      for (name, is_dir) in entries {
        if is_dir || !predicate.matches(&name) {
          continue;
        }
        let target = Path::Source(p.join(&name));
        let digest = context
          .get(BuildNode::BuildFile(target.clone()))
          .await?
          .into_file_digest()?;
        matches.insert(target, digest);
      }
    }
    Path::Build(ctx, p) | Path::Install(ctx, p) => {
      let install = matches!(dir, Path::Install(..));
      let load_target_dir = if install {
        Dir::InstallContext(ctx.clone(), p.clone())
      } else {
        Dir::Context(ctx.clone(), p.clone())
      };
      let loaded = context
        .get(BuildNode::LoadDir(load_target_dir))
        .await?
        .into_loaded()?;
      let rules_here = match loaded.loaded() {
        Loaded::Build { rules_here, .. } => rules_here,
        Loaded::NonBuild { .. } => {
          return Err(BuildError::Internal(format!(
            "{dir} is not a build directory"
          )))
        }
      };
      for target in rules_here.keys() {
        let name = match target {
          Path::Build(_, tp) | Path::Install(_, tp) => tp.file_name().map(|n| n.to_string_lossy().into_owned()),
          _ => None,
        };
        let Some(name) = name else { continue };
        if !predicate.matches(&name) {
          continue;
        }
        let digest = context
          .get(BuildNode::BuildFile(target.clone()))
          .await?
          .into_file_digest()?;
        matches.insert(target.clone(), digest);
      }
    }
    Path::External(_) | Path::AnonymousAction(..) => {
      return Err(BuildError::Internal(format!(
        "file selectors are not supported against {dir}"
      )))
    }
  }
  Ok(BuildItem::FileSelector(matches))
}
