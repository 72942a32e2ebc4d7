// Copyright contributors to this project.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments,
  clippy::new_without_default,
  clippy::new_ret_no_self,
  clippy::mutex_atomic
)]

//! The directory loader (§4.E): given a directory, produces the authoritative rule map
//! for it by consulting the external rule generator, synthesizing source-file copy rules,
//! filtering fallback rules against the source tree, and deleting stale build artifacts.

mod disk;
mod error;
mod generator;
mod loader;
mod triage;

pub use disk::{Disk, RealDisk};
pub use error::LoadError;
pub use generator::{CtxOrInstall, RuleGenerator};
pub use loader::{check_generated_subdir_allowed, load_dir, DefaultAliasTarget, Loaded, RootPaths};
pub use triage::{triage, Dir, Triage};
