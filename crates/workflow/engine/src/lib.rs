//! Workflow Reconciliation Engine
//!
//! Advances a workflow's node graph one pass at a time. A pass reads the
//! workflow, starts whatever is ready, observes what is running and writes
//! the new status back onto a working copy. Nothing blocks: a pass that
//! has to wait (for a task, a lock or a retry backoff) returns and asks to
//! be requeued.
//!
//! # Components
//!
//! - [`Engine`]: shared dependencies and the `operate` entry point
//! - [`TaskBackend`]: submits and observes leaf tasks
//! - [`TemplateGetter`]: resolves shared template resources
//! - [`ExpressionEvaluator`]: `when` guards and hook conditions
//! - [`Hydrator`]: moves large node maps to and from an [`OffloadStore`]
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use workflow_engine::{Engine, EngineConfig, InMemoryTaskBackend, StaticTemplates};
//! use workflow_sync::{reenqueue_channel, LockCapacityResolver, LockName, ResolveError, SyncManager, WorkflowExistence};
//! use workflow_types::{Template, Workflow, WorkflowKey, WorkflowPhase, WorkflowSpec};
//!
//! struct NoLimits;
//!
//! #[async_trait::async_trait]
//! impl LockCapacityResolver for NoLimits {
//!     async fn capacity(&self, _: &LockName) -> Result<usize, ResolveError> {
//!         Ok(usize::MAX)
//!     }
//! }
//!
//! impl WorkflowExistence for NoLimits {
//!     fn exists(&self, _: &WorkflowKey) -> bool {
//!         true
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let (tx, _rx) = reenqueue_channel();
//! let sync = Arc::new(SyncManager::new(Arc::new(NoLimits), Arc::new(NoLimits), tx, Duration::from_secs(1)));
//! let backend = Arc::new(InMemoryTaskBackend::auto_completing());
//! let engine = Engine::new(EngineConfig::default(), sync, backend, Arc::new(StaticTemplates::default()));
//!
//! let spec = WorkflowSpec::new("main").with_template(Template::task("main"));
//! let mut wf = Workflow::new("ns", "hello", spec);
//! for _ in 0..3 {
//!     wf = engine.operate(wf).await.unwrap().workflow;
//! }
//! assert_eq!(wf.status.phase, WorkflowPhase::Succeeded);
//! # });
//! ```

#![deny(unsafe_code)]

mod backend;
mod error;
mod exit_handler;
mod expr;
mod hydrator;
mod operator;
mod scope;
mod steps;
mod substitute;

pub use backend::{
    InMemoryTaskBackend, StaticTemplates, TaskBackend, TaskState, TaskSubmission, TemplateGetter,
};
pub use error::{EngineError, EngineResult};
pub use expr::{ExpressionEvaluator, SimpleEvaluator};
pub use hydrator::{
    offload_version, Hydrator, InMemoryOffloadStore, OffloadStore, DEFAULT_OFFLOAD_THRESHOLD,
};
pub use operator::{Engine, EngineConfig, Operation, DEFAULT_MAX_STACK_DEPTH};
pub use scope::WfScope;
pub use substitute::{replace, replace_json, Params};
