//! Workflow Concurrency Control
//!
//! Everything that arbitrates between concurrently reconciling workflows:
//!
//! - [`KeyLock`]: one reconciliation pass per workflow key at a time
//! - [`SyncManager`]: named semaphores and mutexes declared by workflows
//!   and templates, with FIFO waiters and re-enqueue notifications
//! - [`Throttler`]: global and per-namespace parallelism admission
//!
//! None of these components touch the work queue directly. Wake-ups are
//! sent as [`ReenqueueEvent`]s over an mpsc channel owned by the caller.

#![deny(unsafe_code)]

mod error;
mod events;
mod key_lock;
mod lock_name;
mod manager;
mod retry;
mod semaphore;
mod throttler;

pub use error::*;
pub use events::{reenqueue_channel, ReenqueueEvent, ReenqueueReason, ReenqueueReceiver, ReenqueueSender};
pub use key_lock::{KeyGuard, KeyLock};
pub use lock_name::{lock_names, LockKind, LockName};
pub use manager::{
    holder_workflow_key, node_holder, parse_capacity, workflow_holder, Acquisition,
    LockCapacityResolver, LockSnapshot, SyncManager, WorkflowExistence,
};
pub use retry::{retry_transient, Backoff};
pub use throttler::{ThrottleEntry, ThrottleLimits, Throttler};
