use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use action::{Alias, ActionBuilder, ActionDesc, ActionFull, BuildContext, Path};
use async_trait::async_trait;
use engine_fs::{CtxOrInstall, DefaultAliasTarget, RootPaths, RuleGenerator};
use execution::{ActionInterpreter, ExecResult, ExecutionPolicy, InterpretError};
use hashing::Digest;
use rules::{BuildDir, Info, Loc, Mode, Rule, RuleIdGenerator, Rules};
use tempfile::TempDir;

use crate::session::{Session, SessionConfig};

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

/// A `cycle.txt` rule whose own action depends on the file it produces, modeling a
/// directly self-referential build request.
struct SelfCycleGenerator {
  ids: RuleIdGenerator,
}

#[async_trait]
impl RuleGenerator for SelfCycleGenerator {
  async fn gen_rules(
    &self,
    _ctx_or_install: &CtxOrInstall,
    _dir: &Path,
    _sub_path_components: &[String],
  ) -> Option<(HashSet<String>, Rules)> {
    let ctx = BuildContext("cyc".to_owned());
    let target = Path::Build(ctx.clone(), PathBuf::from("cycle.txt"));
    let build_dir = BuildDir {
      context: ctx.clone(),
      sub_dir: PathBuf::new(),
    };
    let factory_target = target.clone();
    let rule = Rule {
      id: self.ids.next(),
      dir: build_dir,
      targets: vec![target],
      action: Arc::new(move || {
        let dep = factory_target.clone();
        ActionBuilder::path(dep).map(|_| ActionFull::new(ActionDesc::Progn(vec![])))
      }),
      mode: Mode::Standard,
      info: Info::Internal,
      context: Some(ctx),
      sandbox: action::SandboxConfig::default(),
    };
    Some((HashSet::new(), Rules::of_rule(rule).unwrap()))
  }
}

/// Interprets the one `ActionDesc` shape these tests exercise: a plain file copy,
/// resolved against the real roots rather than a sandbox (copies are never sandboxed,
/// see `execution::sandbox::choose_sandbox_mode`).
struct CopyInterpreter {
  roots: RootPaths,
}

#[async_trait]
impl ActionInterpreter for CopyInterpreter {
  async fn exec(
    &self,
    _workdir: &std::path::Path,
    action: &ActionFull,
    _rule_digest: Digest,
  ) -> Result<ExecResult, InterpretError> {
    match &action.action {
      ActionDesc::Copy { src, dst } => {
        let bytes = tokio::fs::read(self.roots.resolve(src))
          .await
          .map_err(|e| InterpretError::Internal(e.to_string()))?;
        let relative = match dst {
          Path::Build(_, p) | Path::Install(_, p) | Path::Source(p) | Path::External(p) => {
            p.clone()
          }
          Path::AnonymousAction(_, digest) => PathBuf::from(digest.hash.to_hex()),
        };
        let mut produced = BTreeMap::new();
        produced.insert(relative, bytes);
        Ok(ExecResult {
          dynamic_deps_stages: Vec::new(),
          produced,
        })
      }
      ActionDesc::Progn(_) => Ok(ExecResult::default()),
      other => Err(InterpretError::Internal(format!(
        "this test interpreter does not implement {other:?}"
      ))),
    }
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

fn session(tmp: &TempDir, ctx: BuildContext, generator: Arc<dyn RuleGenerator>) -> Session {
  let r = roots(tmp);
  let interpreter = Arc::new(CopyInterpreter { roots: clone_roots(&r) });
  Session::new(
    task_executor::Executor::new(),
    SessionConfig {
      roots: r,
      generator,
      known_contexts: vec![ctx],
      default_alias_target: DefaultAliasTarget::All,
      policy: ExecutionPolicy::default(),
      store: None,
      interpreter,
      env_vars: BTreeMap::new(),
      force_rerun: false,
    },
  )
}

fn clone_roots(r: &RootPaths) -> RootPaths {
  RootPaths {
    source_root: r.source_root.clone(),
    build_root: r.build_root.clone(),
  }
}

#[tokio::test]
async fn fresh_build_of_one_rule_produces_its_content_digest() {
  let tmp = TempDir::new().unwrap();
  std::fs::create_dir_all(tmp.path().join("src")).unwrap();
  std::fs::write(tmp.path().join("src").join("a.txt"), "v1").unwrap();
  let ctx = BuildContext("default".to_owned());
  let session = session(&tmp, ctx.clone(), Arc::new(EmptyGenerator));

  let digest = session
    .build_file(Path::Build(ctx, "a.txt".into()))
    .await
    .unwrap();

  assert_eq!(digest, Digest::of_bytes(b"v1"));
}

#[tokio::test]
async fn changing_a_source_input_and_invalidating_triggers_a_rebuild() {
  let tmp = TempDir::new().unwrap();
  let source_dir = tmp.path().join("src");
  std::fs::create_dir_all(&source_dir).unwrap();
  let source_file = source_dir.join("a.txt");
  std::fs::write(&source_file, "v1").unwrap();
  let ctx = BuildContext("default".to_owned());
  let mut session = session(&tmp, ctx.clone(), Arc::new(EmptyGenerator));

  let first = session
    .build_file(Path::Build(ctx.clone(), "a.txt".into()))
    .await
    .unwrap();
  assert_eq!(first, Digest::of_bytes(b"v1"));

  std::fs::write(&source_file, "v2").unwrap();
  session.invalidate(&source_file);
  session.reset();

  let second = session
    .build_file(Path::Build(ctx, "a.txt".into()))
    .await
    .unwrap();
  assert_eq!(second, Digest::of_bytes(b"v2"));
  assert_ne!(first, second);
}

#[tokio::test]
async fn a_rule_that_depends_on_its_own_target_is_a_dependency_cycle() {
  let tmp = TempDir::new().unwrap();
  let ctx = BuildContext("cyc".to_owned());
  let session = session(
    &tmp,
    ctx.clone(),
    Arc::new(SelfCycleGenerator {
      ids: RuleIdGenerator::new(),
    }),
  );

  let result = session
    .build_file(Path::Build(ctx, "cycle.txt".into()))
    .await;

  let err = result.expect_err("a self-dependent rule must fail");
  assert!(
    err.to_string().contains("Dependency cycle"),
    "unexpected error: {err}"
  );
}
