use std::collections::{BTreeMap, HashSet};
use std::path::{Path as StdPath, PathBuf};

use action::{ActionBuilder, ActionDesc, ActionFull, BuildContext, Path};
use log::{info, trace};
use rules::{ActionFactory, ConsumedRules, DirRules, Info, Loc, Mode, Rule, RuleId, RuleIdGenerator, Rules};

use crate::disk::Disk;
use crate::error::LoadError;
use crate::generator::{CtxOrInstall, RuleGenerator};
use crate::triage::{triage, Dir, Triage};

/// The result of loading one directory (§3 "Loaded directory").
pub enum Loaded {
  /// A source or external directory: just its file listing.
  NonBuild { files: Vec<String> },
  /// A context (or install-context) build directory, fully resolved.
  Build {
    allowed_subdirs: HashSet<String>,
    rules_produced: Rules,
    rules_here: BTreeMap<Path, Rule>,
    aliases: BTreeMap<String, Vec<(Loc, ActionFactory)>>,
  },
}

/// The two physical roots everything in the build is addressed relative to.
pub struct RootPaths {
  pub source_root: PathBuf,
  pub build_root: PathBuf,
}

impl RootPaths {
  fn source_dir(&self, sub_dir: &StdPath) -> PathBuf {
    self.source_root.join(sub_dir)
  }

  fn build_dir(&self, ctx: &BuildContext, sub_dir: &StdPath, install: bool) -> PathBuf {
    if install {
      self.build_root.join("install").join(&ctx.0).join(sub_dir)
    } else {
      self.build_root.join(&ctx.0).join(sub_dir)
    }
  }

  /// Resolves any `action::Path` to its physical location on disk. Used by the rule
  /// executor, which has to read and write target content regardless of which part of
  /// the build's universe a target's path names.
  pub fn resolve(&self, path: &Path) -> PathBuf {
    match path {
      Path::Source(p) => self.source_dir(p),
      Path::Build(ctx, p) => self.build_dir(ctx, p, false),
      Path::Install(ctx, p) => self.build_dir(ctx, p, true),
      Path::AnonymousAction(ctx, digest) => self
        .build_dir(ctx, StdPath::new(""), false)
        .join(".actions")
        .join(digest.hash.to_hex()),
      Path::External(p) => p.clone(),
    }
  }
}

/// Whether an unqualified `@default` alias in a context directory expands to `@all` or to
/// `@install` when the directory declares no explicit `default` alias (§4.E step 2). The
/// source's choice is driven by a project schema version; this crate leaves that policy
/// decision to the caller.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum DefaultAliasTarget {
  All,
  Install,
}

fn basename(path: &StdPath) -> Option<String> {
  path.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn target_basename(target: &Path) -> Option<String> {
  match target {
    Path::Build(_, p) | Path::Install(_, p) => basename(p),
    _ => None,
  }
}

/// Loads one directory, per the algorithm in §4.E. `id_gen` mints ids for rules this crate
/// synthesizes itself (source-file copies, the default-alias expansion); the rule
/// generator is responsible for minting ids for the rules it produces.
pub async fn load_dir(
  dir: &Dir,
  generator: &dyn RuleGenerator,
  disk: &dyn Disk,
  roots: &RootPaths,
  known_contexts: &[BuildContext],
  default_alias_target: DefaultAliasTarget,
  id_gen: &RuleIdGenerator,
) -> Result<Loaded, LoadError> {
  match triage(dir, known_contexts) {
    Triage::Source(sub) => {
      let entries = disk
        .read_dir(&roots.source_dir(&sub))
        .await
        .map_err(|e| LoadError::io(sub.display().to_string(), &e))?;
      Ok(Loaded::NonBuild {
        files: entries
          .into_iter()
          .filter(|(_, is_dir)| !is_dir)
          .map(|(name, _)| name)
          .collect(),
      })
    }
    Triage::External(abs) => {
      let entries = disk
        .read_dir(&abs)
        .await
        .map_err(|e| LoadError::io(abs.display().to_string(), &e))?;
      Ok(Loaded::NonBuild {
        files: entries
          .into_iter()
          .filter(|(_, is_dir)| !is_dir)
          .map(|(name, _)| name)
          .collect(),
      })
    }
    Triage::NoRules { allowed_subdirs } => Ok(Loaded::Build {
      allowed_subdirs,
      rules_produced: Rules::new(),
      rules_here: BTreeMap::new(),
      aliases: BTreeMap::new(),
    }),
    Triage::Invalid => Err(LoadError::Internal(format!(
      "load_dir called on a directory with no build meaning: {dir:?}"
    ))),
    Triage::Go {
      ctx_or_install,
      sub_dir,
    } => load_context_dir(
      &ctx_or_install,
      &sub_dir,
      generator,
      disk,
      roots,
      default_alias_target,
      id_gen,
    )
    .await,
  }
}

async fn load_context_dir(
  ctx_or_install: &CtxOrInstall,
  sub_dir: &StdPath,
  generator: &dyn RuleGenerator,
  disk: &dyn Disk,
  roots: &RootPaths,
  default_alias_target: DefaultAliasTarget,
  id_gen: &RuleIdGenerator,
) -> Result<Loaded, LoadError> {
  let (ctx, is_install) = match ctx_or_install {
    CtxOrInstall::Context(ctx) => (ctx.clone(), false),
    CtxOrInstall::Install(ctx) => (ctx.clone(), true),
  };
  let dir_key = rules::BuildDir {
    context: ctx.clone(),
    sub_dir: sub_dir.to_path_buf(),
  }
  .key();

  // Step 1: the external rule generator, unioned with the project-wide global rules.
  let sub_path_components: Vec<String> = sub_dir
    .components()
    .map(|c| c.as_os_str().to_string_lossy().into_owned())
    .collect();
  let probe_target = Path::Build(ctx.clone(), sub_dir.to_path_buf());
  let (extra_subdirs_to_keep, generated) = generator
    .gen_rules(ctx_or_install, &probe_target, &sub_path_components)
    .await
    .ok_or_else(|| {
      LoadError::Internal(format!(
        "rule generator returned no answer for {}",
        dir_key
      ))
    })?;
  let combined = generated
    .union(generator.global_rules())
    .map_err(|e| LoadError::Internal(e.to_string()))?;

  // Step 2: split this directory's contributions into plain rules and raw alias
  // expansions.
  let mut consumed: ConsumedRules = DirRules::new(&combined, dir_key).consume();

  if !is_install && !consumed.aliases.contains_key("default") {
    let target_alias_name = match default_alias_target {
      DefaultAliasTarget::All => "all",
      DefaultAliasTarget::Install => "install",
    };
    let aliased = action::Alias::new(sub_dir.to_path_buf(), target_alias_name);
    let loc = Loc {
      file: sub_dir.to_path_buf(),
      line: 0,
    };
    let factory: ActionFactory = std::sync::Arc::new(move || {
      let aliased = aliased.clone();
      ActionBuilder::dep_on_alias_if_exists(aliased)
        .map(|_| ActionFull::new(ActionDesc::Progn(vec![])))
    });
    consumed
      .aliases
      .entry("default".to_owned())
      .or_default()
      .push((loc, factory));
  }

  // Step 3: targets that a source-file copy must not be synthesized for.
  let mut source_files_to_ignore: HashSet<String> = HashSet::new();
  for rule in &consumed.rules {
    match &rule.mode {
      Mode::IgnoreSourceFiles => {
        for target in &rule.targets {
          if let Some(name) = target_basename(target) {
            source_files_to_ignore.insert(name);
          }
        }
      }
      Mode::Promote(promote) => {
        for target in &rule.targets {
          if let Some(name) = target_basename(target) {
            let matches = promote
              .only
              .as_ref()
              .map(|p| p.matches(&name))
              .unwrap_or(true);
            if matches {
              source_files_to_ignore.insert(name);
            }
          }
        }
      }
      Mode::Standard | Mode::Fallback => {}
    }
  }

  // Source listing for this directory, used for copy-rule synthesis, fallback filtering,
  // and the source/target-name collision check.
  let source_entries = disk
    .read_dir(&roots.source_dir(sub_dir))
    .await
    .map_err(|e| LoadError::io(sub_dir.display().to_string(), &e))?;
  let source_files: HashSet<String> = source_entries
    .iter()
    .filter(|(_, is_dir)| !is_dir)
    .map(|(name, _)| name.clone())
    .collect();
  let source_subdirs: HashSet<String> = source_entries
    .iter()
    .filter(|(_, is_dir)| *is_dir)
    .map(|(name, _)| name.clone())
    .collect();

  // Step 4: synthesize a copy rule for every source file not otherwise claimed.
  let mut copy_rules = Vec::new();
  for name in &source_files {
    if source_files_to_ignore.contains(name) {
      continue;
    }
    let source_path = Path::Source(sub_dir.join(name));
    let target_path = Path::Build(ctx.clone(), sub_dir.join(name));
    let build_dir = rules::BuildDir {
      context: ctx.clone(),
      sub_dir: sub_dir.to_path_buf(),
    };
    let factory_src = source_path.clone();
    let factory_dst = target_path.clone();
    let factory: ActionFactory = std::sync::Arc::new(move || {
      let src = factory_src.clone();
      let dst = factory_dst.clone();
      ActionBuilder::path(src.clone()).map(move |_| ActionFull::new(ActionDesc::Copy { src, dst }))
    });
    copy_rules.push(Rule {
      id: id_gen.next(),
      dir: build_dir,
      targets: vec![target_path],
      action: factory,
      mode: Mode::Standard,
      info: Info::SourceFileCopy(source_path),
      context: Some(ctx.clone()),
      sandbox: action::SandboxConfig::default(),
    });
  }

  // Step 5: fallback filtering.
  let mut live_rules = Vec::new();
  for rule in consumed.rules {
    if rule.mode != Mode::Fallback {
      live_rules.push(rule);
      continue;
    }
    let present: Vec<bool> = rule
      .targets
      .iter()
      .map(|t| {
        target_basename(t)
          .map(|name| source_files.contains(&name))
          .unwrap_or(false)
      })
      .collect();
    let any_present = present.iter().any(|&p| p);
    let all_present = present.iter().all(|&p| p);
    if all_present {
      trace!("discarding fallback rule {:?}: shadowed by source files", rule.id);
      continue;
    }
    if any_present {
      return Err(LoadError::user(format!(
        "fallback rule {:?} has some targets present in the source tree and some not; \
         a fallback rule's targets must be all present or all not present",
        rule.id
      )));
    }
    live_rules.push(rule);
  }
  live_rules.extend(copy_rules);

  // Step 6: compile into a target -> rule map, detecting collisions.
  let mut rules_here: BTreeMap<Path, Rule> = BTreeMap::new();
  for rule in live_rules {
    for target in &rule.targets {
      if let Some(name) = target_basename(target) {
        if source_subdirs.contains(&name) {
          return Err(LoadError::user(format!(
            "target {target} collides with a source subdirectory of the same name"
          )));
        }
      }
      if let Some(existing) = rules_here.get(target) {
        return Err(LoadError::user_with_hints(
          format!("multiple rules produce {target}"),
          vec![format!("{:?}", existing.info), format!("{:?}", rule.info)],
        ));
      }
      rules_here.insert(target.clone(), rule.clone());
    }
  }

  let allowed_subdirs: HashSet<String> = extra_subdirs_to_keep
    .into_iter()
    .chain(source_subdirs.iter().cloned())
    .collect();

  // Step 8: delete stale build-directory entries.
  let build_dir_path = roots.build_dir(&ctx, sub_dir, is_install);
  let live_basenames: HashSet<String> = rules_here
    .keys()
    .filter_map(target_basename)
    .collect();
  let build_entries = disk
    .read_dir(&build_dir_path)
    .await
    .map_err(|e| LoadError::io(build_dir_path.display().to_string(), &e))?;
  for (name, is_dir) in build_entries {
    if live_basenames.contains(&name) || allowed_subdirs.contains(&name) {
      continue;
    }
    let path = build_dir_path.join(&name);
    info!("removing stale build artifact {}", path.display());
    let result = if is_dir {
      disk.remove_dir_all(&path).await
    } else {
      disk.remove_file(&path).await
    };
    result.map_err(|e| LoadError::io(path.display().to_string(), &e))?;
  }

  Ok(Loaded::Build {
    allowed_subdirs,
    rules_produced: combined,
    rules_here,
    aliases: consumed.aliases,
  })
}

/// §4.E step 7 (generated-directory restriction): a caller recursing from a parent
/// directory's `Loaded::Build` into a child directory must only do so for a child whose
/// name was declared allowed by the parent (as a generator-declared subdir or a source
/// subdir); otherwise a generator that stops claiming a subdirectory could have its
/// previously-generated content silently deleted by some *other* directory's cleanup
/// pass. Violating this is an internal error, not a user error: the generator and the
/// loader disagreeing about directory ownership is a bug in the generator.
pub fn check_generated_subdir_allowed(
  child_name: &str,
  parent_allowed_subdirs: &HashSet<String>,
) -> Result<(), LoadError> {
  if parent_allowed_subdirs.contains(child_name) {
    Ok(())
  } else {
    Err(LoadError::Internal(format!(
      "directory {child_name} is not among its parent's allowed generated subdirectories"
    )))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::disk::RealDisk;
  use async_trait::async_trait;
  use std::sync::Arc;
  use tempfile::TempDir;

  struct EmptyGenerator;

  #[async_trait]
  impl RuleGenerator for EmptyGenerator {
    async fn gen_rules(
      &self,
      _ctx_or_install: &CtxOrInstall,
      _dir: &Path,
      _sub_path_components: &[String],
    ) -> Option<(HashSet<String>, Rules)> {
      Some((HashSet::new(), Rules::new()))
    }
  }

  fn roots(tmp: &TempDir) -> RootPaths {
    let source_root = tmp.path().join("src");
    let build_root = tmp.path().join("_build");
    std::fs::create_dir_all(&source_root).unwrap();
    std::fs::create_dir_all(&build_root).unwrap();
    RootPaths {
      source_root,
      build_root,
    }
  }

  #[tokio::test]
  async fn source_files_become_copy_rules() {
    let tmp = TempDir::new().unwrap();
    let roots = roots(&tmp);
    std::fs::write(roots.source_root.join("a.txt"), "hi").unwrap();
    std::fs::create_dir_all(roots.build_root.join("default")).unwrap();

    let ctx = BuildContext("default".to_owned());
    let id_gen = RuleIdGenerator::new();
    let loaded = load_dir(
      &Dir::Context(ctx.clone(), PathBuf::new()),
      &EmptyGenerator,
      &RealDisk,
      &roots,
      &[ctx.clone()],
      DefaultAliasTarget::All,
      &id_gen,
    )
    .await
    .unwrap();

    match loaded {
      Loaded::Build { rules_here, .. } => {
        let target = Path::Build(ctx, "a.txt".into());
        assert!(rules_here.contains_key(&target));
      }
      _ => panic!("expected a build directory"),
    }
  }

  #[tokio::test]
  async fn cleanup_removes_stale_build_artifact() {
    let tmp = TempDir::new().unwrap();
    let roots = roots(&tmp);
    std::fs::create_dir_all(roots.build_root.join("default")).unwrap();
    let stale = roots.build_root.join("default").join("stale.o");
    std::fs::write(&stale, "old").unwrap();

    let ctx = BuildContext("default".to_owned());
    let id_gen = RuleIdGenerator::new();
    let _ = load_dir(
      &Dir::Context(ctx.clone(), PathBuf::new()),
      &EmptyGenerator,
      &RealDisk,
      &roots,
      &[ctx],
      DefaultAliasTarget::All,
      &id_gen,
    )
    .await
    .unwrap();

    assert!(!stale.exists());
  }

  #[tokio::test]
  async fn duplicate_targets_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let roots = roots(&tmp);
    std::fs::create_dir_all(roots.build_root.join("default")).unwrap();

    struct DupGenerator(RuleIdGenerator);
    #[async_trait]
    impl RuleGenerator for DupGenerator {
      async fn gen_rules(
        &self,
        _ctx_or_install: &CtxOrInstall,
        _dir: &Path,
        _sub_path_components: &[String],
      ) -> Option<(HashSet<String>, Rules)> {
        let ctx = BuildContext("default".to_owned());
        let build_dir = rules::BuildDir {
          context: ctx.clone(),
          sub_dir: PathBuf::new(),
        };
        let target = Path::Build(ctx.clone(), "t".into());
        let make = |id: RuleId| Rule {
          id,
          dir: build_dir.clone(),
          targets: vec![target.clone()],
          action: Arc::new(|| ActionBuilder::pure(ActionFull::new(ActionDesc::Progn(vec![])))),
          mode: Mode::Standard,
          info: Info::Internal,
          context: Some(ctx.clone()),
          sandbox: action::SandboxConfig::default(),
        };
        let a = Rules::of_rule(make(self.0.next())).unwrap();
        let b = Rules::of_rule(make(self.0.next())).unwrap();
        Some((HashSet::new(), a.union(b).unwrap()))
      }
    }

    let ctx = BuildContext("default".to_owned());
    let id_gen = RuleIdGenerator::new();
    let result = load_dir(
      &Dir::Context(ctx.clone(), PathBuf::new()),
      &DupGenerator(RuleIdGenerator::new()),
      &RealDisk,
      &roots,
      &[ctx],
      DefaultAliasTarget::All,
      &id_gen,
    )
    .await;

    assert!(matches!(result, Err(LoadError::UserError { .. })));
  }

  struct FallbackGenerator {
    ids: RuleIdGenerator,
    targets: Vec<&'static str>,
  }

  #[async_trait]
  impl RuleGenerator for FallbackGenerator {
    async fn gen_rules(
      &self,
      _ctx_or_install: &CtxOrInstall,
      _dir: &Path,
      _sub_path_components: &[String],
    ) -> Option<(HashSet<String>, Rules)> {
      let ctx = BuildContext("default".to_owned());
      let build_dir = rules::BuildDir {
        context: ctx.clone(),
        sub_dir: PathBuf::new(),
      };
      let targets: Vec<Path> = self
        .targets
        .iter()
        .map(|name| Path::Build(ctx.clone(), (*name).into()))
        .collect();
      let rule = Rule {
        id: self.ids.next(),
        dir: build_dir,
        targets,
        action: Arc::new(|| ActionBuilder::pure(ActionFull::new(ActionDesc::Progn(vec![])))),
        mode: Mode::Fallback,
        info: Info::Internal,
        context: Some(ctx),
        sandbox: action::SandboxConfig::default(),
      };
      Some((HashSet::new(), Rules::of_rule(rule).unwrap()))
    }
  }

  #[tokio::test]
  async fn fallback_rule_is_discarded_when_shadowed_by_a_source_file() {
    let tmp = TempDir::new().unwrap();
    let roots = roots(&tmp);
    std::fs::write(roots.source_root.join("gen.txt"), "from source").unwrap();
    std::fs::create_dir_all(roots.build_root.join("default")).unwrap();

    let ctx = BuildContext("default".to_owned());
    let id_gen = RuleIdGenerator::new();
    let loaded = load_dir(
      &Dir::Context(ctx.clone(), PathBuf::new()),
      &FallbackGenerator {
        ids: RuleIdGenerator::new(),
        targets: vec!["gen.txt"],
      },
      &RealDisk,
      &roots,
      &[ctx.clone()],
      DefaultAliasTarget::All,
      &id_gen,
    )
    .await
    .unwrap();

    match loaded {
      Loaded::Build { rules_here, .. } => {
        let target = Path::Build(ctx, "gen.txt".into());
        // The source-file copy rule wins; the fallback rule was discarded rather than
        // colliding with it.
        assert!(rules_here.contains_key(&target));
      }
      _ => panic!("expected a build directory"),
    }
  }

  #[tokio::test]
  async fn fallback_rule_runs_when_no_source_file_shadows_it() {
    let tmp = TempDir::new().unwrap();
    let roots = roots(&tmp);
    std::fs::create_dir_all(roots.build_root.join("default")).unwrap();

    let ctx = BuildContext("default".to_owned());
    let id_gen = RuleIdGenerator::new();
    let loaded = load_dir(
      &Dir::Context(ctx.clone(), PathBuf::new()),
      &FallbackGenerator {
        ids: RuleIdGenerator::new(),
        targets: vec!["gen.txt"],
      },
      &RealDisk,
      &roots,
      &[ctx.clone()],
      DefaultAliasTarget::All,
      &id_gen,
    )
    .await
    .unwrap();

    match loaded {
      Loaded::Build { rules_here, .. } => {
        let target = Path::Build(ctx, "gen.txt".into());
        assert!(rules_here.contains_key(&target));
      }
      _ => panic!("expected a build directory"),
    }
  }

  #[tokio::test]
  async fn fallback_rule_with_partial_source_presence_is_a_user_error() {
    let tmp = TempDir::new().unwrap();
    let roots = roots(&tmp);
    std::fs::write(roots.source_root.join("a.txt"), "present").unwrap();
    std::fs::create_dir_all(roots.build_root.join("default")).unwrap();

    let ctx = BuildContext("default".to_owned());
    let id_gen = RuleIdGenerator::new();
    let result = load_dir(
      &Dir::Context(ctx.clone(), PathBuf::new()),
      &FallbackGenerator {
        ids: RuleIdGenerator::new(),
        targets: vec!["a.txt", "b.txt"],
      },
      &RealDisk,
      &roots,
      &[ctx],
      DefaultAliasTarget::All,
      &id_gen,
    )
    .await;

    match result {
      Err(LoadError::UserError { message, .. }) => {
        assert!(message.contains("present"));
        assert!(message.contains("not"));
      }
      other => panic!("expected a user error, got {other:?}"),
    }
  }
}
