use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use action::{ActionFull, Dep, Fact, Facts, Path};
use engine_fs::{Disk, RootPaths};
use hashing::Digest;
use rules::Rule;
use sharded_store::{RestoreOutcome, ShardedStore, StoreOutcome, TargetEntry};
use tokio::sync::Mutex;

use crate::digest::{compute_rule_digest, targets_digest, RuleDigestInputs};
use crate::error::ExecutionError;
use crate::interpreter::{ActionInterpreter, DynamicDepsResolver, ExecResult};
use crate::locks::LockTable;
use crate::promoted::PromotedToDeleteSet;
use crate::sandbox::{choose_sandbox_mode, Sandbox, DEFAULT_SANDBOX_PREFERENCE};
use crate::trace::{DynamicDepsStage, TraceDb, TraceEntry};

/// Per-directory execution parameters (§4.F step 2: "immutable policy bundle"). Loaded
/// once by the caller and handed in; the core has no opinion on where these values come
/// from beyond threading them through to the right step of the algorithm.
#[derive(Clone, Debug)]
pub struct ExecutionPolicy {
  pub sandbox_preference: Vec<action::SandboxMode>,
  pub remove_write_permissions: bool,
  pub shared_cache_enabled: bool,
  /// Probability in `[0, 1]` of forcing a real execution (bypassing a would-be cache
  /// restore) purely to compare against what the cache holds. See the reproducibility
  /// check decision recorded alongside `EngineConfig`.
  pub reproducibility_check_probability: f64,
}

impl Default for ExecutionPolicy {
  fn default() -> ExecutionPolicy {
    ExecutionPolicy {
      sandbox_preference: DEFAULT_SANDBOX_PREFERENCE.to_vec(),
      remove_write_permissions: false,
      shared_cache_enabled: false,
      reproducibility_check_probability: 0.0,
    }
  }
}

/// Drives §4.F's per-rule algorithm: trace check, shared-cache restore, sandboxed
/// execution, storing, and promotion. One `RuleExecutor` is shared across an entire
/// build; its mutable state (trace DB, promoted-to-delete set) is internally
/// synchronized since rules may be executed concurrently.
pub struct RuleExecutor {
  roots: RootPaths,
  disk: Arc<dyn Disk>,
  interpreter: Arc<dyn ActionInterpreter>,
  store: Option<ShardedStore>,
  locks: LockTable,
  trace_db: Mutex<TraceDb>,
  promoted: Mutex<PromotedToDeleteSet>,
  policy: ExecutionPolicy,
}

impl RuleExecutor {
  pub fn new(
    roots: RootPaths,
    disk: Arc<dyn Disk>,
    interpreter: Arc<dyn ActionInterpreter>,
    store: Option<ShardedStore>,
    policy: ExecutionPolicy,
  ) -> RuleExecutor {
    let trace_path = crate::trace::default_trace_db_path(&roots.build_root);
    let promoted_path = crate::promoted::default_promoted_set_path(&roots.build_root);
    RuleExecutor {
      roots,
      disk,
      interpreter,
      store,
      locks: LockTable::new(),
      trace_db: Mutex::new(TraceDb::load(&trace_path)),
      promoted: Mutex::new(PromotedToDeleteSet::load(&promoted_path)),
      policy,
    }
  }

  /// Persists the trace DB and promoted-to-delete set if either has unsaved writes (§3:
  /// "dumped at end-of-build").
  pub async fn flush(&self) -> std::io::Result<()> {
    self
      .trace_db
      .lock()
      .await
      .save(&crate::trace::default_trace_db_path(&self.roots.build_root))?;
    self
      .promoted
      .lock()
      .await
      .save(&crate::promoted::default_promoted_set_path(&self.roots.build_root))
  }

  /// Runs a single rule to produce its targets' digests, per §4.F's core algorithm.
  /// `action_full`/`facts` are the result of having already run `rule.action` (step 1,
  /// performed by the caller since only it holds the `DepResolver`). `force_rerun` is set
  /// by the caller for an anonymous action attached to an alias while `--force` is in
  /// effect (step 5's second `always_rerun` condition).
  pub async fn execute_rule(
    &self,
    rule: &Rule,
    action_full: ActionFull,
    facts: &Facts,
    context_name: &str,
    force_rerun: bool,
    dynamic: &dyn DynamicDepsResolver,
  ) -> Result<BTreeMap<Path, Digest>, ExecutionError> {
    let sandbox_mode = choose_sandbox_mode(
      &action_full.action,
      &rule.sandbox,
      &self.policy.sandbox_preference,
    )?;
    let always_rerun =
      force_rerun || facts.iter().any(|(dep, _)| matches!(dep, Dep::Universe));

    let rule_digest = compute_rule_digest(&RuleDigestInputs {
      facts,
      sandbox_mode,
      targets: &rule.targets,
      context_name,
      action: &action_full.action,
      can_go_in_shared_cache: action_full.can_go_in_shared_cache,
      locks: &action_full.locks,
      env: &action_full.env,
    });

    let head_target = rule
      .targets
      .first()
      .expect("Rule::check_invariants guarantees at least one target")
      .to_string();

    if !always_rerun {
      if let Some(hit) = self
        .try_trace_hit(&head_target, rule_digest, rule, dynamic)
        .await?
      {
        return Ok(hit);
      }
    }

    self.delete_stale_targets(rule).await?;

    let can_go_in_shared_cache = action_full.can_go_in_shared_cache && !always_rerun;
    if self.policy.shared_cache_enabled
      && can_go_in_shared_cache
      && !self.should_skip_cache_for_reproducibility_check()
    {
      if let Some(store) = &self.store {
        let (outcome, bundle) = store.restore_artifacts(rule_digest).await?;
        if let RestoreOutcome::Restored(_) = outcome {
          let bundle = bundle.expect("RestoreOutcome::Restored always carries a bundle");
          let digests = self.write_restored_bundle(rule, &bundle).await?;
          self
            .record_trace(&head_target, rule_digest, Vec::new(), &digests)
            .await;
          self.promote(rule, &digests).await?;
          return Ok(digests);
        }
      }
    }

    let (digests, dynamic_deps_stages) = self
      .run_action(rule, &action_full, facts, sandbox_mode, rule_digest)
      .await?;

    if self.policy.remove_write_permissions {
      self.strip_write_permissions(&digests).await?;
    }

    if self.policy.shared_cache_enabled && can_go_in_shared_cache {
      if let Some(store) = &self.store {
        let targets = self.read_targets_for_store(&digests).await?;
        if let StoreOutcome::WillNotStoreNonDeterminism(reason) =
          store.store_artifacts(rule_digest, targets).await?
        {
          log::warn!("rule producing {head_target} is non-deterministic: {reason}");
        }
      }
    }

    self
      .record_trace(&head_target, rule_digest, dynamic_deps_stages, &digests)
      .await;
    self.promote(rule, &digests).await?;
    Ok(digests)
  }

  fn should_skip_cache_for_reproducibility_check(&self) -> bool {
    let p = self.policy.reproducibility_check_probability;
    p > 0.0 && rand::random::<f64>() < p
  }

  async fn try_trace_hit(
    &self,
    head_target: &str,
    rule_digest: Digest,
    rule: &Rule,
    dynamic: &dyn DynamicDepsResolver,
  ) -> Result<Option<BTreeMap<Path, Digest>>, ExecutionError> {
    let prior = {
      let db = self.trace_db.lock().await;
      db.get(head_target).cloned()
    };
    let Some(prior) = prior else {
      return Ok(None);
    };
    if prior.rule_digest != rule_digest {
      return Ok(None);
    }

    let mut digests = BTreeMap::new();
    for target in &rule.targets {
      let path = self.roots.resolve(target);
      let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(_) => return Ok(None),
      };
      digests.insert(target.clone(), Digest::of_bytes(&bytes));
    }
    if targets_digest(&digests) != prior.targets_digest {
      return Ok(None);
    }

    for stage in &prior.dynamic_deps_stages {
      match dynamic.resolve_digest(&stage.deps).await {
        Ok(current) if current == stage.resolved_digest => continue,
        _ => return Ok(None),
      }
    }

    Ok(Some(digests))
  }

  async fn delete_stale_targets(&self, rule: &Rule) -> Result<(), ExecutionError> {
    for target in &rule.targets {
      let path = self.roots.resolve(target);
      match self.disk.remove_file(&path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ExecutionError::io(path, err)),
      }
    }
    Ok(())
  }

  async fn run_action(
    &self,
    rule: &Rule,
    action_full: &ActionFull,
    facts: &Facts,
    sandbox_mode: action::SandboxMode,
    rule_digest: Digest,
  ) -> Result<(BTreeMap<Path, Digest>, Vec<DynamicDepsStage>), ExecutionError> {
    let locks_guard = self.locks.acquire(&action_full.locks).await;

    let sandbox = if sandbox_mode == action::SandboxMode::None
      || sandbox_mode == action::SandboxMode::PatchBackSourceTree
    {
      None
    } else {
      let sandbox_root = self.roots.build_root.join(".sandbox");
      let sandbox = Sandbox::create(&sandbox_root, rule_digest)
        .await
        .map_err(|e| ExecutionError::io(sandbox_root, e))?;
      self.materialize_deps(&sandbox, facts, sandbox_mode).await?;
      Some(sandbox)
    };
    let workdir = sandbox
      .as_ref()
      .map(Sandbox::path)
      .map(std::path::Path::to_path_buf)
      .unwrap_or_else(|| self.roots.build_root.clone());

    let result: ExecResult = self
      .interpreter
      .exec(&workdir, action_full, rule_digest)
      .await
      .map_err(|e| ExecutionError::Interpreter(e.to_string()))?;

    for target in &rule.targets {
      let relative = target_relative_path(target);
      if let Some(bytes) = result.produced.get(&relative) {
        let dest = self.roots.resolve(target);
        if let Some(parent) = dest.parent() {
          tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExecutionError::io(parent, e))?;
        }
        tokio::fs::write(&dest, bytes)
          .await
          .map_err(|e| ExecutionError::io(dest, e))?;
      }
    }

    if let Some(sandbox) = sandbox {
      sandbox.remove().await;
    }
    drop(locks_guard);

    let mut digests = BTreeMap::new();
    for target in &rule.targets {
      let path = self.roots.resolve(target);
      let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ExecutionError::MissingTarget(target.clone()))?;
      digests.insert(target.clone(), Digest::of_bytes(&bytes));
    }

    let stages = result
      .dynamic_deps_stages
      .into_iter()
      .map(|(deps, facts)| DynamicDepsStage {
        deps,
        resolved_digest: facts.digest(),
      })
      .collect();

    Ok((digests, stages))
  }

  /// §4.F step 8c: "materialize deps into it (or assert external-path deps exist)".
  /// Stages every file-backed dep the action's `Facts` resolved to into the sandbox at
  /// the same relative layout the rule's own targets are written to, using `mode` to pick
  /// symlink/hardlink/copy. A dep on an `External` path is never copied in (it already
  /// lives outside both the source tree and the build root and the sandbox references it
  /// by its real location); instead its existence is asserted so a missing external input
  /// fails loudly rather than silently producing a sandbox with a hole in it.
  async fn materialize_deps(
    &self,
    sandbox: &Sandbox,
    facts: &Facts,
    mode: action::SandboxMode,
  ) -> Result<(), ExecutionError> {
    for path in file_deps(facts) {
      match path {
        Path::External(ref p) => {
          tokio::fs::metadata(p)
            .await
            .map_err(|e| ExecutionError::io(p.clone(), e))?;
        }
        _ => {
          let relative = target_relative_path(&path);
          let source = self.roots.resolve(&path);
          sandbox
            .materialize(&relative, &source, mode)
            .await
            .map_err(|e| ExecutionError::io(source, e))?;
        }
      }
    }
    Ok(())
  }

  async fn write_restored_bundle(
    &self,
    rule: &Rule,
    bundle: &sharded_store::Bundle,
  ) -> Result<BTreeMap<Path, Digest>, ExecutionError> {
    let mut digests = BTreeMap::new();
    for target in &rule.targets {
      let relative = target_relative_path(target);
      let entry = bundle.targets.get(&relative).ok_or_else(|| {
        ExecutionError::Internal(format!(
          "cached bundle for {target} is missing the target's own entry"
        ))
      })?;
      let dest = self.roots.resolve(target);
      if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
          .await
          .map_err(|e| ExecutionError::io(parent, e))?;
      }
      tokio::fs::write(&dest, &entry.bytes)
        .await
        .map_err(|e| ExecutionError::io(dest, e))?;
      digests.insert(target.clone(), entry.digest);
    }
    Ok(digests)
  }

  async fn read_targets_for_store(
    &self,
    digests: &BTreeMap<Path, Digest>,
  ) -> Result<BTreeMap<PathBuf, TargetEntry>, ExecutionError> {
    let mut targets = BTreeMap::new();
    for (target, digest) in digests {
      let path = self.roots.resolve(target);
      let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ExecutionError::io(&path, e))?;
      targets.insert(
        target_relative_path(target),
        TargetEntry {
          digest: *digest,
          bytes,
        },
      );
    }
    Ok(targets)
  }

  async fn strip_write_permissions(
    &self,
    digests: &BTreeMap<Path, Digest>,
  ) -> Result<(), ExecutionError> {
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      for target in digests.keys() {
        let path = self.roots.resolve(target);
        let metadata = tokio::fs::metadata(&path)
          .await
          .map_err(|e| ExecutionError::io(&path, e))?;
        let mut perms = metadata.permissions();
        let mode = perms.mode() & !0o222;
        perms.set_mode(mode);
        tokio::fs::set_permissions(&path, perms)
          .await
          .map_err(|e| ExecutionError::io(&path, e))?;
      }
    }
    Ok(())
  }

  async fn record_trace(
    &self,
    head_target: &str,
    rule_digest: Digest,
    dynamic_deps_stages: Vec<DynamicDepsStage>,
    digests: &BTreeMap<Path, Digest>,
  ) {
    let mut db = self.trace_db.lock().await;
    db.insert(
      head_target.to_string(),
      TraceEntry {
        rule_digest,
        dynamic_deps_stages,
        targets_digest: targets_digest(digests),
      },
    );
  }

  /// §4.F step 9: copy `Promote`-mode targets back into the source tree.
  async fn promote(
    &self,
    rule: &Rule,
    digests: &BTreeMap<Path, Digest>,
  ) -> Result<(), ExecutionError> {
    let rules::Mode::Promote(promote) = &rule.mode else {
      return Ok(());
    };
    for target in &rule.targets {
      let Some(basename) = target.parent_dir().and(
        match target {
          Path::Build(_, p) => p.file_name(),
          _ => None,
        },
      ) else {
        continue;
      };
      if let Some(only) = &promote.only {
        if !only.matches(&basename.to_string_lossy()) {
          continue;
        }
      }

      let dest_dir = promote
        .into
        .clone()
        .unwrap_or_else(|| rule.dir.sub_dir.clone());
      let dest = self.roots.source_root.join(&dest_dir).join(basename);
      let source_digest = digests.get(target).copied();

      let needs_copy = match (tokio::fs::read(&dest).await, source_digest) {
        (Ok(existing), Some(digest)) => Digest::of_bytes(&existing) != digest,
        _ => true,
      };
      if needs_copy {
        let src = self.roots.resolve(target);
        if let Some(parent) = dest.parent() {
          tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExecutionError::io(parent, e))?;
        }
        tokio::fs::copy(&src, &dest)
          .await
          .map_err(|e| ExecutionError::io(&dest, e))?;
        #[cfg(unix)]
        {
          use std::os::unix::fs::PermissionsExt;
          let metadata = tokio::fs::metadata(&dest)
            .await
            .map_err(|e| ExecutionError::io(&dest, e))?;
          let mut perms = metadata.permissions();
          perms.set_mode(perms.mode() | 0o200);
          tokio::fs::set_permissions(&dest, perms)
            .await
            .map_err(|e| ExecutionError::io(&dest, e))?;
        }
      }

      if promote.lifetime == rules::PromoteLifetime::UntilClean {
        self.promoted.lock().await.insert(dest);
      }
    }
    Ok(())
  }
}

fn target_relative_path(target: &Path) -> PathBuf {
  match target {
    Path::Build(_, p) | Path::Install(_, p) | Path::Source(p) | Path::External(p) => p.clone(),
    Path::AnonymousAction(_, digest) => PathBuf::from(digest.hash.to_hex()),
  }
}

/// Flattens a resolved `Facts` map down to the set of concrete file paths it depends on:
/// a `Dep::File`'s own path, plus every path an expanded `Dep::Alias`/`Dep::FileSelector`
/// resolved to. `Env`/`Universe`/`SandboxConfig` facts name no file and are skipped.
fn file_deps(facts: &Facts) -> BTreeSet<Path> {
  let mut deps = BTreeSet::new();
  for (dep, fact) in facts.iter() {
    match (dep, fact) {
      (Dep::File(path), Fact::File(_)) => {
        deps.insert(path.clone());
      }
      (Dep::Alias(_), Fact::Alias(files)) | (Dep::FileSelector(..), Fact::FileSelector(files)) => {
        deps.extend(files.keys().cloned());
      }
      _ => {}
    }
  }
  deps
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use action::{ActionDesc, ActionFull, BuildContext, Path, SandboxConfig};
  use async_trait::async_trait;
  use engine_fs::RealDisk;
  use rules::{BuildDir, Info, Mode, Rule, RuleIdGenerator};
  use tempfile::TempDir;

  use super::*;

  struct RecordingInterpreter {
    calls: AtomicUsize,
    content: Vec<u8>,
  }

  #[async_trait]
  impl ActionInterpreter for RecordingInterpreter {
    async fn exec(
      &self,
      _workdir: &std::path::Path,
      _action: &ActionFull,
      _rule_digest: Digest,
    ) -> Result<ExecResult, crate::interpreter::InterpretError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let mut produced = BTreeMap::new();
      produced.insert(PathBuf::from("out.txt"), self.content.clone());
      Ok(ExecResult {
        dynamic_deps_stages: Vec::new(),
        produced,
      })
    }
  }

  struct NoDynamicDeps;

  #[async_trait]
  impl DynamicDepsResolver for NoDynamicDeps {
    async fn resolve_digest(&self, _deps: &[Dep]) -> Result<Digest, ExecutionError> {
      Ok(hashing::EMPTY_DIGEST)
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

  fn standard_rule(ids: &RuleIdGenerator, ctx: &BuildContext) -> Rule {
    Rule {
      id: ids.next(),
      dir: BuildDir {
        context: ctx.clone(),
        sub_dir: PathBuf::new(),
      },
      targets: vec![Path::Build(ctx.clone(), PathBuf::from("out.txt"))],
      action: std::sync::Arc::new(|| unreachable!("not invoked by execute_rule directly")),
      mode: Mode::Standard,
      info: Info::Internal,
      context: Some(ctx.clone()),
      sandbox: SandboxConfig::default(),
    }
  }

  fn executor(tmp: &TempDir, interpreter: Arc<dyn ActionInterpreter>) -> RuleExecutor {
    RuleExecutor::new(
      roots(tmp),
      Arc::new(RealDisk) as Arc<dyn Disk>,
      interpreter,
      None,
      ExecutionPolicy::default(),
    )
  }

  #[tokio::test]
  async fn fresh_rule_runs_the_interpreter_and_returns_target_digests() {
    let tmp = TempDir::new().unwrap();
    let ids = RuleIdGenerator::new();
    let ctx = BuildContext("default".to_string());
    let rule = standard_rule(&ids, &ctx);
    let interpreter = Arc::new(RecordingInterpreter {
      calls: AtomicUsize::new(0),
      content: b"hello".to_vec(),
    });
    let executor = executor(&tmp, interpreter.clone());
    let action_full = ActionFull::new(ActionDesc::Run {
      program: "noop".to_string(),
      args: Vec::new(),
    });

    let digests = executor
      .execute_rule(&rule, action_full, &Facts::new(), "default", false, &NoDynamicDeps)
      .await
      .unwrap();

    assert_eq!(interpreter.calls.load(Ordering::SeqCst), 1);
    let (path, digest) = digests.iter().next().unwrap();
    assert_eq!(*path, rule.targets[0]);
    assert_eq!(*digest, Digest::of_bytes(b"hello"));
  }

  #[tokio::test]
  async fn unchanged_rule_is_served_from_the_trace_without_rerunning_the_interpreter() {
    let tmp = TempDir::new().unwrap();
    let ids = RuleIdGenerator::new();
    let ctx = BuildContext("default".to_string());
    let rule = standard_rule(&ids, &ctx);
    let interpreter = Arc::new(RecordingInterpreter {
      calls: AtomicUsize::new(0),
      content: b"hello".to_vec(),
    });
    let executor = executor(&tmp, interpreter.clone());
    let action_full = || {
      ActionFull::new(ActionDesc::Run {
        program: "noop".to_string(),
        args: Vec::new(),
      })
    };

    executor
      .execute_rule(&rule, action_full(), &Facts::new(), "default", false, &NoDynamicDeps)
      .await
      .unwrap();
    executor
      .execute_rule(&rule, action_full(), &Facts::new(), "default", false, &NoDynamicDeps)
      .await
      .unwrap();

    assert_eq!(interpreter.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn always_rerun_bypasses_the_trace_even_with_an_unchanged_digest() {
    let tmp = TempDir::new().unwrap();
    let ids = RuleIdGenerator::new();
    let ctx = BuildContext("default".to_string());
    let rule = standard_rule(&ids, &ctx);
    let interpreter = Arc::new(RecordingInterpreter {
      calls: AtomicUsize::new(0),
      content: b"hello".to_vec(),
    });
    let executor = executor(&tmp, interpreter.clone());
    let action_full = || {
      ActionFull::new(ActionDesc::Run {
        program: "noop".to_string(),
        args: Vec::new(),
      })
    };

    executor
      .execute_rule(&rule, action_full(), &Facts::new(), "default", true, &NoDynamicDeps)
      .await
      .unwrap();
    executor
      .execute_rule(&rule, action_full(), &Facts::new(), "default", true, &NoDynamicDeps)
      .await
      .unwrap();

    assert_eq!(interpreter.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn promote_mode_copies_the_target_back_into_the_source_tree() {
    let tmp = TempDir::new().unwrap();
    let ids = RuleIdGenerator::new();
    let ctx = BuildContext("default".to_string());
    let mut rule = standard_rule(&ids, &ctx);
    rule.mode = Mode::Promote(rules::Promote {
      lifetime: rules::PromoteLifetime::UntilClean,
      into: None,
      only: None,
    });
    let interpreter = Arc::new(RecordingInterpreter {
      calls: AtomicUsize::new(0),
      content: b"promoted".to_vec(),
    });
    let executor = executor(&tmp, interpreter);
    let action_full = ActionFull::new(ActionDesc::Run {
      program: "noop".to_string(),
      args: Vec::new(),
    });

    executor
      .execute_rule(&rule, action_full, &Facts::new(), "default", false, &NoDynamicDeps)
      .await
      .unwrap();

    let promoted = tmp.path().join("src").join("out.txt");
    assert_eq!(tokio::fs::read(&promoted).await.unwrap(), b"promoted");
  }

  /// An interpreter that, instead of ignoring `workdir`, reads a single relative path out
  /// of it and records whatever it found there (or `None` if it was absent) before
  /// producing its usual output. Used to observe whether the sandbox was actually
  /// populated with a rule's declared deps before the interpreter ran.
  struct SandboxReadingInterpreter {
    relative_input: PathBuf,
    observed: tokio::sync::Mutex<Option<Vec<u8>>>,
  }

  #[async_trait]
  impl ActionInterpreter for SandboxReadingInterpreter {
    async fn exec(
      &self,
      workdir: &std::path::Path,
      _action: &ActionFull,
      _rule_digest: Digest,
    ) -> Result<ExecResult, crate::interpreter::InterpretError> {
      let found = tokio::fs::read(workdir.join(&self.relative_input)).await.ok();
      *self.observed.lock().await = found;
      let mut produced = BTreeMap::new();
      produced.insert(PathBuf::from("out.txt"), b"built".to_vec());
      Ok(ExecResult {
        dynamic_deps_stages: Vec::new(),
        produced,
      })
    }
  }

  #[tokio::test]
  async fn sandboxed_execution_materializes_declared_file_deps_before_running() {
    let tmp = TempDir::new().unwrap();
    let ids = RuleIdGenerator::new();
    let ctx = BuildContext("default".to_string());
    let rule = standard_rule(&ids, &ctx);

    let input = Path::Source(PathBuf::from("input.txt"));
    std::fs::write(tmp.path().join("src").join("input.txt"), b"dep content").unwrap();

    let mut facts = Facts::new();
    facts.insert(Dep::File(input), Fact::File(Digest::of_bytes(b"dep content")));

    let interpreter = Arc::new(SandboxReadingInterpreter {
      relative_input: PathBuf::from("input.txt"),
      observed: tokio::sync::Mutex::new(None),
    });
    let executor = executor(&tmp, interpreter.clone());
    let action_full = ActionFull::new(ActionDesc::Run {
      program: "noop".to_string(),
      args: Vec::new(),
    });

    executor
      .execute_rule(&rule, action_full, &facts, "default", false, &NoDynamicDeps)
      .await
      .unwrap();

    assert_eq!(
      interpreter.observed.lock().await.as_deref(),
      Some(b"dep content".as_slice())
    );
  }

  #[tokio::test]
  async fn missing_external_dep_fails_before_running_the_interpreter() {
    let tmp = TempDir::new().unwrap();
    let ids = RuleIdGenerator::new();
    let ctx = BuildContext("default".to_string());
    let rule = standard_rule(&ids, &ctx);

    let missing = Path::External(PathBuf::from("/nonexistent/path/for/this/test"));
    let mut facts = Facts::new();
    facts.insert(Dep::File(missing), Fact::File(hashing::EMPTY_DIGEST));

    let interpreter = Arc::new(RecordingInterpreter {
      calls: AtomicUsize::new(0),
      content: b"hello".to_vec(),
    });
    let executor = executor(&tmp, interpreter.clone());
    let action_full = ActionFull::new(ActionDesc::Run {
      program: "noop".to_string(),
      args: Vec::new(),
    });

    let result = executor
      .execute_rule(&rule, action_full, &facts, "default", false, &NoDynamicDeps)
      .await;

    assert!(result.is_err());
    assert_eq!(interpreter.calls.load(Ordering::SeqCst), 0);
  }
}
