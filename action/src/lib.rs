// Copyright contributors to this project.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::too_many_arguments, clippy::new_without_default)]

//! The data model and monadic builder used to describe a build action's dependencies.
//!
//! An [`ActionBuilder`] expresses "compute this value, declaring dependencies as you go"
//! without committing to an execution order between independent sub-computations; the
//! rule executor runs a rule's builder once per (re-)build to discover both its value (an
//! [`crate::builder::BuilderError`]-fallible `Action` description) and the full set of
//! [`Dep`]s it touched, which together determine the rule's cache digest.

mod alias;
mod builder;
mod dep;
mod full;
mod path;

pub use alias::Alias;
pub use builder::{parallel, ActionBuilder, BuilderError, DepResolver, Env};
pub use dep::{Dep, Fact, Facts, Predicate, SandboxConfig, SandboxMode};
pub use full::{ActionDesc, ActionFull};
pub use path::{Context as BuildContext, Path};
