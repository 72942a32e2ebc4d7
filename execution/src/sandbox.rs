use std::path::{Path as StdPath, PathBuf};

use action::{ActionDesc, SandboxConfig, SandboxMode};
use hashing::Digest;

use crate::error::ExecutionError;

/// The preference order the executor tries sandbox modes in, most-isolated first (§4.F
/// step 4). A configuration may narrow this (e.g. drop `hardlink` on a filesystem that
/// doesn't support it), but never reorders it.
pub const DEFAULT_SANDBOX_PREFERENCE: &[SandboxMode] = &[
  SandboxMode::Symlink,
  SandboxMode::Hardlink,
  SandboxMode::Copy,
  SandboxMode::None,
];

/// Chooses a sandbox mode for a rule (§4.F step 4): `clearly_not_useful_to_sandbox`
/// actions skip straight to `none` when permitted; otherwise the first mode in
/// `preference` that the rule's `SandboxConfig` permits wins. A rule that *requires* a
/// mode outside what `preference` would ever reach (e.g. `required = [Hardlink]` but the
/// preference list was narrowed to exclude it) is an error rather than a silent
/// downgrade.
pub fn choose_sandbox_mode(
  action: &ActionDesc,
  config: &SandboxConfig,
  preference: &[SandboxMode],
) -> Result<SandboxMode, ExecutionError> {
  if action.clearly_not_useful_to_sandbox() {
    if config.permitted.contains(&SandboxMode::None) {
      if config.required.is_empty() || config.required.contains(&SandboxMode::None) {
        return Ok(SandboxMode::None);
      }
    } else if !config.required.is_empty() {
      return Err(ExecutionError::Internal(
        "action requires sandboxing but its declared mode set excludes running unsandboxed"
          .to_string(),
      ));
    }
  }

  for mode in preference {
    if config.permitted.contains(mode) {
      return Ok(*mode);
    }
  }

  if let Some(required) = config.required.first() {
    return Err(ExecutionError::Internal(format!(
      "no sandbox mode in the configured preference list satisfies the rule's required mode {required:?}"
    )));
  }

  Ok(SandboxMode::None)
}

/// An ephemeral per-rule workspace (§6: ".sandbox/<rule_digest>/..."), populated with
/// exactly the rule's declared inputs before the action interpreter runs, and removed
/// once outputs have been moved back out.
pub struct Sandbox {
  dir: PathBuf,
}

impl Sandbox {
  pub async fn create(sandbox_root: &StdPath, rule_digest: Digest) -> std::io::Result<Sandbox> {
    let dir = sandbox_root.join(rule_digest.hash.to_hex());
    tokio::fs::create_dir_all(&dir).await?;
    Ok(Sandbox { dir })
  }

  pub fn path(&self) -> &StdPath {
    &self.dir
  }

  /// Places a single input at `relative` inside the sandbox, using `mode` to decide
  /// whether it's linked or copied in. `PatchBackSourceTree` and `None` place nothing
  /// here: the former runs directly against the source tree, the latter has no sandbox.
  pub async fn materialize(
    &self,
    relative: &StdPath,
    source: &StdPath,
    mode: SandboxMode,
  ) -> std::io::Result<()> {
    let dest = self.dir.join(relative);
    if let Some(parent) = dest.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    match mode {
      SandboxMode::Symlink => {
        #[cfg(unix)]
        tokio::fs::symlink(source, &dest).await?;
        #[cfg(not(unix))]
        tokio::fs::copy(source, &dest).await.map(|_| ())?;
      }
      SandboxMode::Hardlink => tokio::fs::hard_link(source, &dest).await?,
      SandboxMode::Copy => {
        tokio::fs::copy(source, &dest).await?;
      }
      SandboxMode::None | SandboxMode::PatchBackSourceTree => {}
    }
    Ok(())
  }

  /// Removes the sandbox directory. Called once outputs have already been moved out of
  /// it; a failure here is logged rather than propagated, since it cannot invalidate an
  /// otherwise-successful build.
  pub async fn remove(self) {
    if let Err(err) = tokio::fs::remove_dir_all(&self.dir).await {
      log::warn!("failed to remove sandbox at {:?}: {err}", self.dir);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use action::ActionDesc;

  #[test]
  fn copy_actions_skip_sandboxing_when_none_is_permitted() {
    let action = ActionDesc::Copy {
      src: action::Path::Source("a".into()),
      dst: action::Path::Build(action::BuildContext("default".into()), "b".into()),
    };
    let mode = choose_sandbox_mode(
      &action,
      &SandboxConfig::default(),
      DEFAULT_SANDBOX_PREFERENCE,
    )
    .unwrap();
    assert_eq!(mode, SandboxMode::None);
  }

  #[test]
  fn run_actions_prefer_symlink_when_permitted() {
    let action = ActionDesc::Run {
      program: "cc".to_string(),
      args: vec![],
    };
    let mode = choose_sandbox_mode(
      &action,
      &SandboxConfig::default(),
      DEFAULT_SANDBOX_PREFERENCE,
    )
    .unwrap();
    assert_eq!(mode, SandboxMode::Symlink);
  }

  #[test]
  fn narrowed_permitted_set_is_honored() {
    let action = ActionDesc::Run {
      program: "cc".to_string(),
      args: vec![],
    };
    let config = SandboxConfig {
      permitted: vec![SandboxMode::Copy],
      required: vec![],
    };
    let mode = choose_sandbox_mode(&action, &config, DEFAULT_SANDBOX_PREFERENCE).unwrap();
    assert_eq!(mode, SandboxMode::Copy);
  }

  #[test]
  fn unsatisfiable_required_mode_is_an_error() {
    let action = ActionDesc::Run {
      program: "cc".to_string(),
      args: vec![],
    };
    let config = SandboxConfig {
      permitted: vec![SandboxMode::Hardlink],
      required: vec![SandboxMode::Hardlink],
    };
    let result = choose_sandbox_mode(&action, &config, &[SandboxMode::Copy]);
    assert!(result.is_err());
  }
}
