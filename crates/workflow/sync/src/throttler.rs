//! Admission throttling
//!
//! Bounds how many workflows run at once, globally and per namespace.
//! Candidates wait in a pending set ordered by priority (descending), then
//! creation time (ascending). Promotion is lazy: free slots are filled when
//! a worker asks to admit a key or when a running workflow is removed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};
use workflow_types::{Workflow, WorkflowKey, WorkflowPhase};

use crate::events::{emit, ReenqueueReason, ReenqueueSender};

/// A workflow waiting for admission
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThrottleEntry {
    pub key: WorkflowKey,
    pub priority: i32,
    pub creation: DateTime<Utc>,
}

impl Ord for ThrottleEntry {
    /// Best candidate sorts first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.creation.cmp(&other.creation))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for ThrottleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Parallelism limits; 0 means unlimited
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThrottleLimits {
    pub global: usize,
    pub namespace: usize,
    /// Per-namespace limits overriding `namespace`
    pub overrides: HashMap<String, usize>,
}

impl ThrottleLimits {
    pub fn new(global: usize, namespace: usize) -> Self {
        Self {
            global,
            namespace,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, namespace: impl Into<String>, limit: usize) -> Self {
        self.overrides.insert(namespace.into(), limit);
        self
    }

    fn namespace_limit(&self, namespace: &str) -> usize {
        self.overrides
            .get(namespace)
            .copied()
            .unwrap_or(self.namespace)
    }
}

#[derive(Default)]
struct ThrottleState {
    limits: ThrottleLimits,
    running: HashSet<WorkflowKey>,
    running_per_namespace: HashMap<String, usize>,
    pending: BTreeSet<ThrottleEntry>,
    pending_index: HashMap<WorkflowKey, ThrottleEntry>,
}

impl ThrottleState {
    fn remove_pending(&mut self, key: &WorkflowKey) -> bool {
        match self.pending_index.remove(key) {
            Some(entry) => self.pending.remove(&entry),
            None => false,
        }
    }

    fn mark_running(&mut self, key: WorkflowKey) {
        self.remove_pending(&key);
        *self
            .running_per_namespace
            .entry(key.namespace.clone())
            .or_default() += 1;
        self.running.insert(key);
    }

    fn remove_running(&mut self, key: &WorkflowKey) -> bool {
        if !self.running.remove(key) {
            return false;
        }
        if let Some(count) = self.running_per_namespace.get_mut(&key.namespace) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.running_per_namespace.remove(&key.namespace);
            }
        }
        true
    }

    fn namespace_full(&self, namespace: &str) -> bool {
        let limit = self.limits.namespace_limit(namespace);
        limit > 0 && self.running_per_namespace.get(namespace).copied().unwrap_or(0) >= limit
    }

    fn global_full(&self) -> bool {
        self.limits.global > 0 && self.running.len() >= self.limits.global
    }

    /// Move the best pending candidates into free slots.
    fn promote(&mut self) -> Vec<WorkflowKey> {
        let mut promoted = Vec::new();
        let candidates: Vec<ThrottleEntry> = self.pending.iter().cloned().collect();
        for entry in candidates {
            if self.global_full() {
                break;
            }
            if self.namespace_full(&entry.key.namespace) {
                continue;
            }
            self.mark_running(entry.key.clone());
            promoted.push(entry.key);
        }
        promoted
    }
}

/// Admission controller for workflow parallelism
pub struct Throttler {
    state: Mutex<ThrottleState>,
    notify: ReenqueueSender,
}

impl Throttler {
    pub fn new(limits: ThrottleLimits, notify: ReenqueueSender) -> Self {
        Self {
            state: Mutex::new(ThrottleState {
                limits,
                ..Default::default()
            }),
            notify,
        }
    }

    /// Record or refresh a pending candidate. No-op for running keys.
    pub fn add(&self, key: WorkflowKey, priority: i32, creation: DateTime<Utc>) {
        let mut state = self.state.lock();
        if state.running.contains(&key) {
            return;
        }
        state.remove_pending(&key);
        let entry = ThrottleEntry {
            key: key.clone(),
            priority,
            creation,
        };
        state.pending.insert(entry.clone());
        state.pending_index.insert(key, entry);
    }

    /// Whether `key` may run now. Fills free slots first; other keys
    /// promoted on the way are re-enqueued.
    pub fn admit(&self, key: &WorkflowKey) -> bool {
        let (admitted, promoted) = {
            let mut state = self.state.lock();
            if state.running.contains(key) {
                return true;
            }
            let promoted = state.promote();
            (state.running.contains(key), promoted)
        };
        self.wake(promoted.into_iter().filter(|k| k != key));
        if !admitted {
            debug!(key = %key, "Workflow admission postponed");
        }
        admitted
    }

    /// Forget `key` and hand its slot to the best pending candidates.
    pub fn remove(&self, key: &WorkflowKey) {
        let promoted = {
            let mut state = self.state.lock();
            let was_running = state.remove_running(key);
            let was_pending = state.remove_pending(key);
            if !was_running && !was_pending {
                return;
            }
            state.promote()
        };
        self.wake(promoted.into_iter());
    }

    /// Seed the running set from workflows that were already running
    /// before a restart. Limits are not enforced for these.
    pub fn init(&self, workflows: &[Workflow]) {
        let mut state = self.state.lock();
        for wf in workflows {
            if wf.status.phase == WorkflowPhase::Running && !state.running.contains(&wf.key()) {
                state.mark_running(wf.key());
            }
        }
        info!(running = state.running.len(), "Throttler initialized");
    }

    /// Apply new limits and promote into any newly freed slots.
    pub fn update_limits(&self, limits: ThrottleLimits) {
        let promoted = {
            let mut state = self.state.lock();
            if state.limits == limits {
                return;
            }
            info!(global = limits.global, namespace = limits.namespace, "Parallelism limits updated");
            state.limits = limits;
            state.promote()
        };
        self.wake(promoted.into_iter());
    }

    fn wake(&self, keys: impl Iterator<Item = WorkflowKey>) {
        for key in keys {
            debug!(key = %key, "Workflow promoted");
            emit(&self.notify, key, Duration::ZERO, ReenqueueReason::AdmissionSlot);
        }
    }

    pub fn is_running(&self, key: &WorkflowKey) -> bool {
        self.state.lock().running.contains(key)
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::reenqueue_channel;
    use chrono::Duration as ChronoDuration;

    fn key(name: &str) -> WorkflowKey {
        WorkflowKey::new("ns", name)
    }

    /// Adds `e0..eN` with the given priorities, one second apart.
    fn seed(throttler: &Throttler, priorities: &[i32]) {
        let base = Utc::now();
        for (i, priority) in priorities.iter().enumerate() {
            throttler.add(
                key(&format!("e{i}")),
                *priority,
                base + ChronoDuration::seconds(i as i64),
            );
        }
    }

    #[test]
    fn test_highest_priority_admitted_first() {
        let (tx, mut rx) = reenqueue_channel();
        let throttler = Throttler::new(ThrottleLimits::new(2, 0), tx);
        seed(&throttler, &[3, 1, 3, 2, 0]);

        assert!(throttler.admit(&key("e0")));
        assert!(throttler.is_running(&key("e2")));
        assert!(!throttler.admit(&key("e3")));
        assert_eq!(throttler.running_count(), 2);

        // e2 was promoted while admitting e0
        assert_eq!(rx.try_recv().unwrap().key, key("e2"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_promotion_follows_priority_then_creation() {
        let (tx, mut rx) = reenqueue_channel();
        let throttler = Throttler::new(ThrottleLimits::new(1, 0), tx);
        seed(&throttler, &[3, 1, 3, 2, 0]);

        assert!(throttler.admit(&key("e0")));
        let mut order = vec![key("e0")];
        for _ in 0..4 {
            let current = order.last().cloned().unwrap();
            throttler.remove(&current);
            order.push(rx.try_recv().unwrap().key);
        }
        assert_eq!(order, vec![key("e0"), key("e2"), key("e3"), key("e1"), key("e4")]);
    }

    #[test]
    fn test_namespace_limit_skips_full_namespace() {
        let (tx, _rx) = reenqueue_channel();
        let throttler = Throttler::new(ThrottleLimits::new(0, 1).with_override("big", 2), tx);
        let now = Utc::now();
        throttler.add(WorkflowKey::new("a", "1"), 5, now);
        throttler.add(WorkflowKey::new("a", "2"), 5, now);
        throttler.add(WorkflowKey::new("b", "1"), 0, now);
        throttler.add(WorkflowKey::new("big", "1"), 0, now);
        throttler.add(WorkflowKey::new("big", "2"), 0, now);

        assert!(throttler.admit(&WorkflowKey::new("b", "1")));
        assert!(throttler.is_running(&WorkflowKey::new("a", "1")));
        assert!(!throttler.is_running(&WorkflowKey::new("a", "2")));
        assert!(throttler.is_running(&WorkflowKey::new("big", "2")));
        assert_eq!(throttler.pending_count(), 1);
    }

    #[test]
    fn test_unlimited_admits_everything() {
        let (tx, _rx) = reenqueue_channel();
        let throttler = Throttler::new(ThrottleLimits::default(), tx);
        seed(&throttler, &[0, 0, 0]);
        assert!(throttler.admit(&key("e2")));
        assert_eq!(throttler.running_count(), 3);
    }

    #[test]
    fn test_init_and_raise_limit() {
        let (tx, mut rx) = reenqueue_channel();
        let throttler = Throttler::new(ThrottleLimits::new(1, 0), tx);
        let mut running = Workflow::new("ns", "old", Default::default());
        running.set_phase(WorkflowPhase::Running);
        throttler.init(&[running]);

        seed(&throttler, &[0]);
        assert!(!throttler.admit(&key("e0")));

        throttler.update_limits(ThrottleLimits::new(2, 0));
        assert_eq!(rx.try_recv().unwrap().key, key("e0"));
        assert!(throttler.admit(&key("e0")));
    }

    #[test]
    fn test_add_does_not_demote_running() {
        let (tx, _rx) = reenqueue_channel();
        let throttler = Throttler::new(ThrottleLimits::new(1, 0), tx);
        seed(&throttler, &[0]);
        assert!(throttler.admit(&key("e0")));
        throttler.add(key("e0"), 10, Utc::now());
        assert!(throttler.is_running(&key("e0")));
        assert_eq!(throttler.pending_count(), 0);
    }
}
