use std::time::Duration;

use action::SandboxMode;
use execution::ExecutionPolicy;
use serde::{Deserialize, Serialize};

/// The knobs a build tool embedding this crate is expected to expose to its users,
/// collected into one `serde`-deserializable struct (loaded from a TOML config file by
/// the embedding tool, the way this workspace's other configuration-carrying crates
/// load theirs) rather than scattered across constructor arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// The order of sandbox modes to try, most-isolated first. Narrowed per-rule by that
  /// rule's own `SandboxConfig`; this list is only ever narrowed, never reordered.
  pub sandbox_preference: Vec<SandboxMode>,
  pub remove_write_permissions: bool,
  pub shared_cache_enabled: bool,
  pub shared_cache_max_size_bytes: usize,
  pub shared_cache_lease_seconds: u64,
  pub shared_cache_shard_count: u8,
  /// Probability in `[0, 1]` of forcing a real execution to compare against the shared
  /// cache's stored bundle, even on what would otherwise be a cache hit.
  pub reproducibility_check_probability: f64,
}

impl Default for EngineConfig {
  fn default() -> EngineConfig {
    EngineConfig {
      sandbox_preference: execution::DEFAULT_SANDBOX_PREFERENCE.to_vec(),
      remove_write_permissions: false,
      shared_cache_enabled: false,
      shared_cache_max_size_bytes: 16 * 1024 * 1024 * 1024,
      shared_cache_lease_seconds: sharded_store::DEFAULT_LEASE_TIME.as_secs(),
      shared_cache_shard_count: 16,
      reproducibility_check_probability: 0.0,
    }
  }
}

impl EngineConfig {
  pub fn execution_policy(&self) -> ExecutionPolicy {
    ExecutionPolicy {
      sandbox_preference: self.sandbox_preference.clone(),
      remove_write_permissions: self.remove_write_permissions,
      shared_cache_enabled: self.shared_cache_enabled,
      reproducibility_check_probability: self.reproducibility_check_probability,
    }
  }

  pub fn shared_cache_lease_time(&self) -> Duration {
    Duration::from_secs(self.shared_cache_lease_seconds)
  }

  /// Parses an `EngineConfig` from a TOML document, the format every other config the
  /// embedding tool loads also uses.
  pub fn from_toml(contents: &str) -> Result<EngineConfig, toml::de::Error> {
    toml::from_str(contents)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_the_documented_values() {
    let config = EngineConfig::default();
    assert!(!config.shared_cache_enabled);
    assert_eq!(config.reproducibility_check_probability, 0.0);
    assert_eq!(config.shared_cache_lease_time(), sharded_store::DEFAULT_LEASE_TIME);
  }

  #[test]
  fn empty_document_falls_back_to_defaults() {
    let config = EngineConfig::from_toml("").unwrap();
    assert_eq!(config.shared_cache_shard_count, 16);
  }

  #[test]
  fn overrides_one_field_without_disturbing_the_rest() {
    let config = EngineConfig::from_toml("shared_cache_enabled = true\n").unwrap();
    assert!(config.shared_cache_enabled);
    assert_eq!(config.shared_cache_shard_count, 16);
  }
}
