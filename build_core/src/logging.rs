/// Installs a global logger built from `RUST_LOG` (or `default_filter` when unset), the
/// way every binary embedding this crate is expected to initialize logging: library code
/// here only ever calls the `log` macros, never touches a logger directly.
pub fn init(default_filter: &str) {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
    .try_init();
}
