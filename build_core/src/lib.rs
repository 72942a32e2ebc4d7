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

//! Ties the directory loader, the rules/action data model, and the rule executor into one
//! memoized build graph. A `BuildNode` is either a directory to load, a file to build, an
//! alias to expand, or a file-selector query; running one recurses into the others purely
//! through `graph::Context::get`, so the graph's own memoization and cycle detection cover
//! the whole engine for free. `Session` is the handle a build tool holds across an
//! invocation's lifetime.

mod config;
mod error;
mod logging;
mod node;
mod resolver;
mod session;
#[cfg(test)]
mod session_tests;

pub use config::EngineConfig;
pub use error::{to_builder_error, to_execution_error, BuildError};
pub use logging::init as init_logging;
pub use node::{BuildItem, BuildNode};
pub use resolver::GraphDepResolver;
pub use session::{Session, SessionConfig, SessionContext};
