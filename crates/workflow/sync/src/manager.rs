//! Synchronization manager: named semaphores and mutexes shared by every
//! workflow the controller reconciles.
//!
//! Acquisition never blocks a worker. A workflow (or a single template
//! node) that cannot get all of its locks is queued on them and its pass
//! ends; when capacity frees up the manager emits a [`ReenqueueEvent`] so
//! the dispatch loop looks at it again.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use workflow_types::{ConfigMap, Synchronization, Workflow, WorkflowKey};

use crate::events::{emit, ReenqueueReason, ReenqueueSender};
use crate::lock_name::{lock_names, LockKind, LockName};
use crate::retry::{retry_transient, Backoff};
use crate::semaphore::Semaphore;
use crate::{ResolveError, SyncError, SyncResult};

// ── Collaborators ────────────────────────────────────────────────────

/// Looks up how many holders a semaphore admits
#[async_trait]
pub trait LockCapacityResolver: Send + Sync {
    async fn capacity(&self, lock: &LockName) -> Result<usize, ResolveError>;
}

/// Answers whether a workflow still exists in the controller's cache
pub trait WorkflowExistence: Send + Sync {
    fn exists(&self, key: &WorkflowKey) -> bool;
}

/// Parse a config-map value into a semaphore capacity.
pub fn parse_capacity(value: &str) -> Result<usize, ResolveError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ResolveError::Invalid(value.to_string()))
}

// ── Holder IDs ───────────────────────────────────────────────────────

/// Holder ID for workflow-level locks
pub fn workflow_holder(key: &WorkflowKey) -> String {
    key.to_string()
}

/// Holder ID for template-level locks taken by one node
pub fn node_holder(key: &WorkflowKey, node_id: &str) -> String {
    format!("{}/{}", key, node_id)
}

/// Workflow a holder ID belongs to.
pub fn holder_workflow_key(holder: &str) -> Option<WorkflowKey> {
    let mut parts = holder.splitn(3, '/');
    match (parts.next(), parts.next()) {
        (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() => {
            Some(WorkflowKey::new(ns, name))
        }
        _ => None,
    }
}

fn belongs_to(holder: &str, key: &str) -> bool {
    holder == key
        || holder
            .strip_prefix(key)
            .is_some_and(|rest| rest.starts_with('/'))
}

// ── Acquisition ──────────────────────────────────────────────────────

/// Outcome of [`SyncManager::try_acquire`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acquisition {
    pub acquired: bool,
    /// Human readable reason when not acquired
    pub waiting_message: Option<String>,
}

impl Acquisition {
    pub fn acquired() -> Self {
        Self {
            acquired: true,
            waiting_message: None,
        }
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        Self {
            acquired: false,
            waiting_message: Some(message.into()),
        }
    }
}

/// Point-in-time view of one lock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockSnapshot {
    pub limit: usize,
    pub holders: Vec<String>,
    pub waiters: Vec<String>,
}

// ── Manager ──────────────────────────────────────────────────────────

/// Owner of every semaphore and mutex
pub struct SyncManager {
    locks: Mutex<HashMap<String, Semaphore>>,
    resolver: Arc<dyn LockCapacityResolver>,
    existence: Arc<dyn WorkflowExistence>,
    notify: ReenqueueSender,
    notify_delay: Duration,
    backoff: Backoff,
}

impl SyncManager {
    pub fn new(
        resolver: Arc<dyn LockCapacityResolver>,
        existence: Arc<dyn WorkflowExistence>,
        notify: ReenqueueSender,
        notify_delay: Duration,
    ) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            resolver,
            existence,
            notify,
            notify_delay,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn resolve_capacity(&self, name: &LockName) -> SyncResult<usize> {
        if name.kind == LockKind::Mutex {
            return Ok(1);
        }
        let resolver = &*self.resolver;
        retry_transient(&self.backoff, ResolveError::is_transient, move || {
            resolver.capacity(name)
        })
        .await
        .map_err(|e| SyncError::from((name.encode(), e)))
    }

    /// Create the lock on first use.
    async fn ensure_lock(&self, name: &LockName) -> SyncResult<()> {
        let encoded = name.encode();
        if self.locks.lock().contains_key(&encoded) {
            return Ok(());
        }
        let limit = self.resolve_capacity(name).await?;
        debug!(lock = %encoded, limit, "Lock created");
        self.locks
            .lock()
            .entry(encoded.clone())
            .or_insert_with(|| Semaphore::new(encoded, limit));
        Ok(())
    }

    /// Try to take every lock in `requests` for `holder`, all or nothing.
    ///
    /// When any lock is unavailable the holder is queued on each lock it
    /// does not hold yet and the result carries a waiting message. Held and
    /// waiting state is mirrored into `wf.status.synchronization`.
    #[instrument(skip(self, wf, requests), fields(key = %wf.key()))]
    pub async fn try_acquire(
        &self,
        wf: &mut Workflow,
        holder: &str,
        requests: &Synchronization,
    ) -> SyncResult<Acquisition> {
        let names: Vec<String> = lock_names(requests, wf.namespace())
            .iter()
            .map(LockName::encode)
            .collect();
        if names.is_empty() {
            return Ok(Acquisition::acquired());
        }
        for name in lock_names(requests, wf.namespace()) {
            self.ensure_lock(&name).await?;
        }

        let mut locks = self.locks.lock();
        let mut blocked = None;
        for name in &names {
            match locks.get(name) {
                Some(sem) if sem.is_eligible(holder) => {}
                Some(sem) => {
                    blocked = Some(format!("Waiting for {} lock. {}", name, sem.status()));
                    break;
                }
                None => return Err(SyncError::InvalidLockName(name.clone())),
            }
        }

        let sync = wf.status.synchronization_mut();
        match blocked {
            None => {
                for name in &names {
                    if let Some(sem) = locks.get_mut(name) {
                        sem.try_acquire(holder);
                        sync.record_held(name, holder);
                    }
                }
                info!(holder, locks = ?names, "Locks acquired");
                Ok(Acquisition::acquired())
            }
            Some(message) => {
                for name in &names {
                    if let Some(sem) = locks.get_mut(name) {
                        if !sem.is_holding(holder) {
                            sem.enqueue(holder);
                            sync.record_waiting(name, holder);
                        }
                    }
                }
                debug!(holder, %message, "Lock not available");
                Ok(Acquisition::waiting(message))
            }
        }
    }

    /// Release the locks in `requests` held by `holder` and notify the
    /// waiters that can now proceed. Releasing an unheld lock is a no-op.
    pub fn release(&self, wf: &mut Workflow, holder: &str, requests: &Synchronization) {
        let names: Vec<String> = lock_names(requests, wf.namespace())
            .iter()
            .map(LockName::encode)
            .collect();
        let mut wake = Vec::new();
        {
            let mut locks = self.locks.lock();
            for name in &names {
                let Some(sem) = locks.get_mut(name) else {
                    continue;
                };
                let held = sem.release(holder);
                let queued = sem.remove_waiter(holder);
                if held || queued {
                    info!(holder, lock = %name, "Lock released");
                    wake.extend(sem.eligible_waiters());
                }
            }
        }
        if let Some(sync) = wf.status.synchronization.as_mut() {
            for name in &names {
                sync.record_released(name, holder);
            }
            if sync.is_empty() {
                wf.status.synchronization = None;
            }
        }
        self.notify_waiters(wake);
    }

    /// Release every lock held and drop every queue entry belonging to the
    /// workflow, including its node-level holders. Idempotent.
    pub fn release_all(&self, wf: &mut Workflow) -> usize {
        let released = self.release_all_for_key(&wf.key());
        wf.status.synchronization = None;
        released
    }

    /// [`Self::release_all`] for a workflow that is only known by key.
    pub fn release_all_for_key(&self, key: &WorkflowKey) -> usize {
        let key = key.to_string();
        let mut wake = Vec::new();
        let mut released = 0;
        {
            let mut locks = self.locks.lock();
            for sem in locks.values_mut() {
                let evicted = sem.evict(|h| belongs_to(h, &key));
                if evicted > 0 {
                    released += evicted;
                    wake.extend(sem.eligible_waiters());
                }
            }
        }
        if released > 0 {
            info!(key = %key, released, "Released all locks");
        }
        self.notify_waiters(wake);
        released
    }

    /// Rebuild holder and waiter state from workflows persisted before a
    /// restart. Holders are restored even when capacity has since shrunk.
    pub async fn initialize(&self, workflows: &[Workflow]) {
        let mut restored = 0usize;
        for wf in workflows {
            let Some(status) = wf.status.synchronization.as_ref() else {
                continue;
            };
            for (lock, holders) in &status.holding {
                if !self.prepare_restore(lock).await {
                    continue;
                }
                let mut locks = self.locks.lock();
                if let Some(sem) = locks.get_mut(lock) {
                    for holder in holders {
                        sem.force_hold(holder);
                        restored += 1;
                    }
                }
            }
            for (lock, waiters) in &status.waiting {
                if !self.prepare_restore(lock).await {
                    continue;
                }
                let mut locks = self.locks.lock();
                if let Some(sem) = locks.get_mut(lock) {
                    for waiter in waiters {
                        sem.enqueue(waiter);
                    }
                }
            }
        }
        info!(restored, locks = self.locks.lock().len(), "Synchronization state initialized");
    }

    async fn prepare_restore(&self, lock: &str) -> bool {
        let name = match LockName::decode(lock) {
            Ok(name) => name,
            Err(e) => {
                warn!(lock, error = %e, "Skipping persisted lock");
                return false;
            }
        };
        match self.ensure_lock(&name).await {
            Ok(()) => true,
            Err(e) => {
                warn!(lock, error = %e, "Cannot restore lock");
                false
            }
        }
    }

    /// Drop holders and waiters whose workflow has disappeared from the
    /// cache. Returns how many entries were removed.
    pub fn check_workflow_existence(&self) -> usize {
        let mut wake = Vec::new();
        let mut removed = 0;
        {
            let existence = &*self.existence;
            let mut locks = self.locks.lock();
            for sem in locks.values_mut() {
                let evicted = sem.evict(|holder| match holder_workflow_key(holder) {
                    Some(key) => !existence.exists(&key),
                    None => true,
                });
                if evicted > 0 {
                    debug!(lock = %sem.name(), evicted, "Removed stale lock entries");
                    removed += evicted;
                    wake.extend(sem.eligible_waiters());
                }
            }
        }
        if removed > 0 {
            info!(removed, "Removed lock entries of deleted workflows");
        }
        self.notify_waiters(wake);
        removed
    }

    /// Re-read capacity for every semaphore backed by `config_map`.
    /// Returns how many locks changed size.
    pub fn on_capacity_change(&self, config_map: &ConfigMap) -> usize {
        let meta = &config_map.metadata;
        let mut wake = Vec::new();
        let mut changed = 0;
        {
            let mut locks = self.locks.lock();
            for sem in locks.values_mut() {
                let Ok(name) = LockName::decode(sem.name()) else {
                    continue;
                };
                if name.kind != LockKind::Semaphore
                    || name.namespace != meta.namespace
                    || name.resource_name != meta.name
                {
                    continue;
                }
                let Some(key) = name.key.as_deref() else {
                    continue;
                };
                let limit = match config_map.data.get(key).map(|v| parse_capacity(v)) {
                    Some(Ok(limit)) => limit,
                    Some(Err(e)) => {
                        warn!(lock = %sem.name(), error = %e, "Ignoring capacity update");
                        continue;
                    }
                    None => {
                        warn!(lock = %sem.name(), "Capacity key removed; keeping previous limit");
                        continue;
                    }
                };
                if limit == sem.limit() {
                    continue;
                }
                info!(lock = %sem.name(), from = sem.limit(), to = limit, "Lock capacity changed");
                let grew = limit > sem.limit();
                sem.resize(limit);
                changed += 1;
                if grew {
                    wake.extend(sem.eligible_waiters());
                }
            }
        }
        self.notify_waiters(wake);
        changed
    }

    fn notify_waiters(&self, holders: Vec<String>) {
        let keys: BTreeSet<WorkflowKey> = holders
            .iter()
            .filter_map(|h| holder_workflow_key(h))
            .collect();
        for key in keys {
            debug!(key = %key, "Notifying lock waiter");
            emit(&self.notify, key, self.notify_delay, ReenqueueReason::LockAvailable);
        }
    }

    pub fn lock_snapshot(&self, lock: &str) -> Option<LockSnapshot> {
        let locks = self.locks.lock();
        locks.get(lock).map(|sem| LockSnapshot {
            limit: sem.limit(),
            holders: sem.holders().cloned().collect(),
            waiters: sem.waiters().cloned().collect(),
        })
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{reenqueue_channel, ReenqueueReceiver};
    use std::collections::HashSet;
    use workflow_types::{MutexRef, SemaphoreRef, WorkflowSpec};

    struct StaticCapacity(HashMap<String, Result<usize, ResolveError>>);

    #[async_trait]
    impl LockCapacityResolver for StaticCapacity {
        async fn capacity(&self, lock: &LockName) -> Result<usize, ResolveError> {
            self.0
                .get(&lock.encode())
                .cloned()
                .unwrap_or_else(|| Err(ResolveError::NotFound(lock.encode())))
        }
    }

    #[derive(Default)]
    struct Known(parking_lot::Mutex<HashSet<WorkflowKey>>);

    impl WorkflowExistence for Known {
        fn exists(&self, key: &WorkflowKey) -> bool {
            self.0.lock().contains(key)
        }
    }

    const SEM: &str = "ns/ConfigMap/limits/wf";

    fn manager(known: Arc<Known>) -> (SyncManager, ReenqueueReceiver) {
        let mut caps = HashMap::new();
        caps.insert(SEM.to_string(), Ok(1));
        let (tx, rx) = reenqueue_channel();
        let mgr = SyncManager::new(
            Arc::new(StaticCapacity(caps)),
            known,
            tx,
            Duration::from_millis(0),
        )
        .with_backoff(Backoff {
            initial: Duration::from_millis(1),
            steps: 2,
            ..Backoff::default()
        });
        (mgr, rx)
    }

    fn semaphore() -> Synchronization {
        Synchronization {
            semaphores: vec![SemaphoreRef {
                namespace: None,
                config_map: "limits".into(),
                key: "wf".into(),
            }],
            mutexes: vec![],
        }
    }

    fn mutex(name: &str) -> Synchronization {
        Synchronization {
            semaphores: vec![],
            mutexes: vec![MutexRef {
                namespace: None,
                name: name.into(),
            }],
        }
    }

    fn wf(name: &str) -> Workflow {
        Workflow::new("ns", name, WorkflowSpec::new("main"))
    }

    #[tokio::test]
    async fn test_waiter_notified_on_release() {
        let (mgr, mut rx) = manager(Arc::default());
        let mut a = wf("a");
        let mut b = wf("b");

        let got = mgr.try_acquire(&mut a, "ns/a", &semaphore()).await.unwrap();
        assert!(got.acquired);
        assert!(a.status.synchronization.as_ref().unwrap().is_holding(SEM, "ns/a"));

        let waiting = mgr.try_acquire(&mut b, "ns/b", &semaphore()).await.unwrap();
        assert!(!waiting.acquired);
        assert_eq!(
            waiting.waiting_message.as_deref(),
            Some("Waiting for ns/ConfigMap/limits/wf lock. Lock status: 1/1")
        );

        mgr.release(&mut a, "ns/a", &semaphore());
        assert!(a.status.synchronization.is_none());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, WorkflowKey::new("ns", "b"));
        assert_eq!(event.reason, ReenqueueReason::LockAvailable);

        assert!(mgr.try_acquire(&mut b, "ns/b", &semaphore()).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_all_or_nothing() {
        let (mgr, _rx) = manager(Arc::default());
        let mut a = wf("a");
        let mut b = wf("b");
        assert!(mgr.try_acquire(&mut a, "ns/a", &mutex("m2")).await.unwrap().acquired);

        let both = Synchronization {
            semaphores: vec![],
            mutexes: vec![
                MutexRef { namespace: None, name: "m1".into() },
                MutexRef { namespace: None, name: "m2".into() },
            ],
        };
        assert!(!mgr.try_acquire(&mut b, "ns/b", &both).await.unwrap().acquired);
        let m1 = mgr.lock_snapshot("ns/Mutex/m1").unwrap();
        assert!(m1.holders.is_empty());
        assert_eq!(m1.waiters, vec!["ns/b".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_capacity_is_bad_request() {
        let (mgr, _rx) = manager(Arc::default());
        let mut a = wf("a");
        let sync = Synchronization {
            semaphores: vec![SemaphoreRef {
                namespace: None,
                config_map: "missing".into(),
                key: "k".into(),
            }],
            mutexes: vec![],
        };
        let err = mgr.try_acquire(&mut a, "ns/a", &sync).await.unwrap_err();
        assert!(matches!(err, SyncError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_release_all_covers_node_holders() {
        let (mgr, mut rx) = manager(Arc::default());
        let mut a = wf("a");
        let mut b = wf("b");
        assert!(mgr.try_acquire(&mut a, "ns/a/a-123", &mutex("m")).await.unwrap().acquired);
        assert!(!mgr.try_acquire(&mut b, "ns/b", &mutex("m")).await.unwrap().acquired);

        assert_eq!(mgr.release_all(&mut a), 1);
        assert_eq!(mgr.release_all(&mut a), 0);
        assert_eq!(rx.recv().await.unwrap().key, WorkflowKey::new("ns", "b"));
    }

    #[tokio::test]
    async fn test_existence_check_frees_stale_holder() {
        let known = Arc::new(Known::default());
        known.0.lock().insert(WorkflowKey::new("ns", "b"));
        let (mgr, mut rx) = manager(known);

        let mut a = wf("a");
        let mut b = wf("b");
        assert!(mgr.try_acquire(&mut a, "ns/a", &mutex("m")).await.unwrap().acquired);
        assert!(!mgr.try_acquire(&mut b, "ns/b", &mutex("m")).await.unwrap().acquired);

        assert_eq!(mgr.check_workflow_existence(), 1);
        assert_eq!(rx.recv().await.unwrap().key, WorkflowKey::new("ns", "b"));
    }

    #[tokio::test]
    async fn test_capacity_growth_wakes_waiters() {
        let (mgr, mut rx) = manager(Arc::default());
        let mut a = wf("a");
        let mut b = wf("b");
        assert!(mgr.try_acquire(&mut a, "ns/a", &semaphore()).await.unwrap().acquired);
        assert!(!mgr.try_acquire(&mut b, "ns/b", &semaphore()).await.unwrap().acquired);

        let cm = ConfigMap::new("ns", "limits").with_entry("wf", "2");
        assert_eq!(mgr.on_capacity_change(&cm), 1);
        assert_eq!(rx.recv().await.unwrap().key, WorkflowKey::new("ns", "b"));
        assert!(mgr.try_acquire(&mut b, "ns/b", &semaphore()).await.unwrap().acquired);
        assert_eq!(mgr.lock_snapshot(SEM).unwrap().limit, 2);
    }

    #[tokio::test]
    async fn test_initialize_restores_holders() {
        let (mgr, _rx) = manager(Arc::default());
        let mut a = wf("a");
        a.status.synchronization_mut().record_held(SEM, "ns/a");
        let mut b = wf("b");
        b.status.synchronization_mut().record_waiting(SEM, "ns/b");

        mgr.initialize(&[a, b.clone()]).await;
        let snap = mgr.lock_snapshot(SEM).unwrap();
        assert_eq!(snap.holders, vec!["ns/a".to_string()]);
        assert_eq!(snap.waiters, vec!["ns/b".to_string()]);
        assert!(!mgr.try_acquire(&mut b, "ns/b", &semaphore()).await.unwrap().acquired);
    }

    #[test]
    fn test_holder_workflow_key() {
        assert_eq!(
            holder_workflow_key("ns/wf/wf-abc"),
            Some(WorkflowKey::new("ns", "wf"))
        );
        assert_eq!(holder_workflow_key("ns"), None);
        assert!(belongs_to("ns/wf/node", "ns/wf"));
        assert!(!belongs_to("ns/wf2", "ns/wf"));
    }
}
