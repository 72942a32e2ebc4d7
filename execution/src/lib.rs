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

//! Runs one rule's already-built action: picks a sandbox mode, consults the trace
//! database and shared cache before touching disk, executes the action when neither
//! has an answer, and promotes `Promote`-mode outputs back into the source tree.

mod digest;
mod error;
mod executor;
mod interpreter;
mod locks;
mod promoted;
mod sandbox;
mod trace;

pub use digest::{compute_rule_digest, targets_digest, RuleDigestInputs, RULE_DIGEST_VERSION};
pub use error::ExecutionError;
pub use executor::{ExecutionPolicy, RuleExecutor};
pub use interpreter::{
  ActionInterpreter, DynamicDepsRequest, DynamicDepsResolver, ExecResult, InterpretError,
};
pub use locks::{LockGuard, LockTable};
pub use promoted::{default_promoted_set_path, PromotedToDeleteSet};
pub use sandbox::{choose_sandbox_mode, Sandbox, DEFAULT_SANDBOX_PREFERENCE};
pub use trace::{
  default_trace_db_path, DynamicDepsStage, TraceDb, TraceEntry, TRACE_DB_VERSION,
};
