//! Workflow Domain Types
//!
//! The data model shared by the synchronization layer, the reconciliation
//! engine and the controller.
//!
//! # Key Concepts
//!
//! - **Workflow**: a submitted template graph plus its mutable status,
//!   addressed by a [`WorkflowKey`] (`namespace/name`).
//! - **Template**: a named unit of work; a leaf task, sequential step
//!   groups, or a DAG of tasks.
//! - **NodeStatus**: one vertex of the execution graph. Phases only move
//!   forward; retries add sibling attempt nodes.
//! - **SynchronizationStatus**: the locks a workflow holds or waits for,
//!   persisted so the lock tables can be rebuilt after a restart.
//! - **WatchEvent**: add/update/delete notifications over the object kinds
//!   the controller watches.

#![deny(unsafe_code)]

mod errors;
mod meta;
mod status;
mod template;
mod workflow;

pub use errors::*;
pub use meta::*;
pub use status::*;
pub use template::*;
pub use workflow::*;
