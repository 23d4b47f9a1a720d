//! Outbound re-enqueue notifications
//!
//! The lock manager and the throttler never touch the work queue. They emit
//! [`ReenqueueEvent`]s and whoever owns the queue forwards them.

use std::time::Duration;
use tokio::sync::mpsc;
use workflow_types::WorkflowKey;

/// Why a workflow should be looked at again
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReenqueueReason {
    /// A lock it waits on has free capacity
    LockAvailable,
    /// It was promoted into a free admission slot
    AdmissionSlot,
}

/// Request to put a workflow key back on the work queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReenqueueEvent {
    pub key: WorkflowKey,
    pub delay: Duration,
    pub reason: ReenqueueReason,
}

pub type ReenqueueSender = mpsc::UnboundedSender<ReenqueueEvent>;
pub type ReenqueueReceiver = mpsc::UnboundedReceiver<ReenqueueEvent>;

/// Create a re-enqueue channel.
pub fn reenqueue_channel() -> (ReenqueueSender, ReenqueueReceiver) {
    mpsc::unbounded_channel()
}

pub(crate) fn emit(tx: &ReenqueueSender, key: WorkflowKey, delay: Duration, reason: ReenqueueReason) {
    if tx
        .send(ReenqueueEvent {
            key: key.clone(),
            delay,
            reason,
        })
        .is_err()
    {
        tracing::debug!(key = %key, "Re-enqueue receiver dropped; notification discarded");
    }
}
