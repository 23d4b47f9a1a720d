//! Workflow Controller
//!
//! Drives workflows to completion. The controller watches workflow,
//! template and config map objects, queues workflow keys, and runs one
//! reconciliation pass per key at a time on a pool of workers.
//!
//! # Components
//!
//! - [`WorkQueue`]: deduplicating queue with delayed and rate-limited adds
//! - [`WorkflowController`]: dispatch loop, event handlers, archive worker
//!   and periodic garbage collection
//! - [`RecentCompletions`]: guards against stale cache copies of workflows
//!   that have just completed
//! - [`WorkflowCache`], [`ObjectStore`], [`ArchiveStore`]: the controller's
//!   view of the cluster, with [`InMemoryCluster`] as the bundled backend
//! - [`ControllerMetrics`]: Prometheus collectors for reconciliation passes
//! - [`ControllerConfig`]: layered configuration

#![deny(unsafe_code)]

mod archive;
pub mod config;
mod controller;
pub mod error;
mod gc;
mod handlers;
pub mod metrics;
pub mod queue;
pub mod recent;
pub mod store;

pub use config::ControllerConfig;
pub use controller::{ControllerDeps, WorkflowController, POSTPONED_MESSAGE};
pub use error::{ControllerError, ControllerResult, StoreError, StoreResult};
pub use metrics::{export_metrics, ControllerMetrics, OperationOutcome};
pub use queue::WorkQueue;
pub use recent::RecentCompletions;
pub use store::{
    ArchiveStore, ConfigMapCapacityResolver, InMemoryCluster, IndexName, ObjectStore,
    WorkflowCache,
};
