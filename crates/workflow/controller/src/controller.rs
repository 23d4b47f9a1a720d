//! Dispatch loop
//!
//! A fixed pool of workers pulls workflow keys from the work queue and runs
//! one reconciliation pass per key. Passes for the same key never overlap:
//! the key lock is held from the cache lookup until the result has been
//! persisted. Everything else the controller runs (event handling, the
//! archive worker, periodic sweeps) only ever enqueues keys.

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, MissedTickBehavior};
use workflow_engine::{Engine, Hydrator, OffloadStore, TaskBackend, TemplateGetter};
use workflow_sync::{
    reenqueue_channel, KeyLock, ReenqueueReceiver, SyncManager, Throttler, WorkflowExistence,
};
use workflow_types::{WatchEvent, WatchedObject, Workflow, WorkflowError, WorkflowKey, WorkflowPhase};

use crate::config::ControllerConfig;
use crate::error::{ControllerError, ControllerResult};
use crate::metrics::{ControllerMetrics, OperationOutcome};
use crate::queue::WorkQueue;
use crate::recent::RecentCompletions;
use crate::store::{
    ArchiveStore, ConfigMapCapacityResolver, InMemoryCluster, ObjectStore, WorkflowCache,
};

/// Message set on a workflow whose first pass was denied admission
pub const POSTPONED_MESSAGE: &str =
    "Workflow processing has been postponed because too many workflows are already running";

// ── Dependencies ─────────────────────────────────────────────────────

/// Backends the controller talks to
#[derive(Clone)]
pub struct ControllerDeps {
    pub cache: Arc<dyn WorkflowCache>,
    pub store: Arc<dyn ObjectStore>,
    pub archive: Arc<dyn ArchiveStore>,
    pub templates: Arc<dyn TemplateGetter>,
    pub existence: Arc<dyn WorkflowExistence>,
    pub tasks: Arc<dyn TaskBackend>,
    pub offload: Arc<dyn OffloadStore>,
}

impl ControllerDeps {
    /// Wire every object-facing dependency to one in-memory cluster.
    pub fn in_memory(
        cluster: Arc<InMemoryCluster>,
        tasks: Arc<dyn TaskBackend>,
        offload: Arc<dyn OffloadStore>,
    ) -> Self {
        Self {
            cache: cluster.clone(),
            store: cluster.clone(),
            archive: cluster.clone(),
            templates: cluster.clone(),
            existence: cluster,
            tasks,
            offload,
        }
    }
}

// ── Controller ───────────────────────────────────────────────────────

/// The workflow controller
pub struct WorkflowController {
    pub(crate) config: ControllerConfig,
    pub(crate) cache: Arc<dyn WorkflowCache>,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) archive_store: Arc<dyn ArchiveStore>,
    pub(crate) engine: Engine,
    pub(crate) hydrator: Hydrator,
    pub(crate) sync: Arc<SyncManager>,
    pub(crate) throttler: Arc<Throttler>,
    pub(crate) key_lock: KeyLock,
    pub(crate) queue: Arc<WorkQueue<WorkflowKey>>,
    pub(crate) archive_queue: Arc<WorkQueue<WorkflowKey>>,
    pub(crate) recent: RecentCompletions,
    pub(crate) metrics: Arc<ControllerMetrics>,
    reenqueue_rx: Mutex<Option<ReenqueueReceiver>>,
}

impl WorkflowController {
    /// Create a controller recording into `metrics`
    pub fn new(
        config: ControllerConfig,
        deps: ControllerDeps,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        let (reenqueue_tx, reenqueue_rx) = reenqueue_channel();
        let resolver = Arc::new(ConfigMapCapacityResolver::new(deps.store.clone()));
        let sync = Arc::new(SyncManager::new(
            resolver,
            deps.existence.clone(),
            reenqueue_tx.clone(),
            config.notify_delay(),
        ));
        let throttler = Arc::new(Throttler::new(config.throttle.limits(), reenqueue_tx));
        let engine = Engine::new(config.engine_config(), sync.clone(), deps.tasks, deps.templates);
        let hydrator = Hydrator::new(deps.offload)
            .with_threshold(config.offload.threshold_bytes)
            .with_always_offload(config.offload.always_offload);

        Self {
            recent: RecentCompletions::new(config.recent_completion_window()),
            config,
            cache: deps.cache,
            store: deps.store,
            archive_store: deps.archive,
            engine,
            hydrator,
            sync,
            throttler,
            key_lock: KeyLock::new(),
            queue: WorkQueue::new("workflows"),
            archive_queue: WorkQueue::new("workflow_archive"),
            metrics,
            reenqueue_rx: Mutex::new(Some(reenqueue_rx)),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<WorkQueue<WorkflowKey>> {
        &self.queue
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn throttler(&self) -> &Arc<Throttler> {
        &self.throttler
    }

    pub fn recent_completions(&self) -> &RecentCompletions {
        &self.recent
    }

    pub fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.metrics
    }

    /// Run until `shutdown` flips to `true` or the change feed closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ControllerResult<()> {
        let reenqueue = self
            .reenqueue_rx
            .lock()
            .take()
            .ok_or_else(|| ControllerError::Config("controller is already running".to_string()))?;
        self.initialize().await?;

        let workers = self.config.dispatch.workers.max(1);
        let mut handles = Vec::with_capacity(workers + 3);
        handles.push(tokio::spawn(
            self.clone().forward_reenqueues(reenqueue, shutdown.clone()),
        ));
        for _ in 0..workers {
            let controller = self.clone();
            handles.push(tokio::spawn(async move {
                while controller.process_next_item().await {}
            }));
        }
        let controller = self.clone();
        handles.push(tokio::spawn(async move {
            while controller.process_next_archive_item().await {}
        }));
        handles.push(tokio::spawn(self.clone().run_periodic(shutdown.clone())));

        tracing::info!(workers, "Workflow controller started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        tracing::info!("Change feed closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Shutting down workflow controller");
        self.queue.shutdown();
        self.archive_queue.shutdown();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Controller task failed");
            }
        }
        tracing::info!("Workflow controller stopped");
        Ok(())
    }

    /// Rebuild lock and admission state from persisted workflows, then
    /// queue every cached workflow once.
    pub async fn initialize(&self) -> ControllerResult<()> {
        let workflows = self.store.list_workflows(None, None).await?;
        self.sync.initialize(&workflows).await;
        self.throttler.init(&workflows);
        for un in self.cache.list() {
            self.handle_event(WatchEvent::Added(WatchedObject::Workflow(un)));
        }
        tracing::info!(workflows = workflows.len(), "Controller state initialized");
        Ok(())
    }

    async fn forward_reenqueues(
        self: Arc<Self>,
        mut reenqueue: ReenqueueReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = reenqueue.recv() => match event {
                    Some(event) => {
                        tracing::debug!(key = %event.key, reason = ?event.reason, "Re-enqueueing workflow");
                        self.queue.add_after(event.key, event.delay);
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_periodic(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let every = |secs: u64| {
            let period = Duration::from_secs(secs.max(1));
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        };
        let mut existence = every(self.config.sync.existence_check_period_secs);
        let mut offload_gc = every(self.config.offload.gc_period_secs);
        let mut archive_gc = every(self.config.archive.gc_period_secs);
        let archive_ttl = self.config.archive_ttl();
        if archive_ttl.is_none() {
            tracing::info!("Archived workflow GC disabled");
        }

        loop {
            tokio::select! {
                _ = existence.tick() => {
                    self.sync.check_workflow_existence();
                }
                _ = offload_gc.tick() => {
                    if let Err(e) = self.offload_gc().await {
                        tracing::error!(error = %e, "Offload GC failed");
                    }
                }
                _ = archive_gc.tick(), if archive_ttl.is_some() => {
                    if let Some(ttl) = archive_ttl {
                        if let Err(e) = self.archived_workflow_gc(ttl).await {
                            tracing::error!(error = %e, "Archived workflow GC failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // ── Reconciliation ───────────────────────────────────────────────

    /// Take one key off the queue and reconcile it. `false` once the queue
    /// has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.metrics.set_queue_depth(self.queue.name(), self.queue.len());
        let result = AssertUnwindSafe(self.process_key(&key))
            .catch_unwind()
            .await;
        if let Err(panic) = result {
            self.metrics.record_operation(OperationOutcome::Panic);
            tracing::error!(key = %key, panic = %panic_message(panic.as_ref()), "Reconciliation panicked");
        }
        self.queue.done(&key);
        true
    }

    #[tracing::instrument(skip(self, key), fields(key = %key))]
    async fn process_key(&self, key: &WorkflowKey) {
        let _guard = self.key_lock.lock(&key.to_string()).await;

        let Some(un) = self.cache.get_by_key(key) else {
            tracing::debug!(key = %key, "Workflow no longer exists");
            return;
        };
        if !un.metadata.reconciliation_needed() {
            tracing::debug!(key = %key, "Won't process workflow since it's completed");
            return;
        }

        let wf = match un.to_workflow() {
            Ok(wf) => wf,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to unmarshal workflow");
                let reason = match e {
                    WorkflowError::Unmarshal(reason) => reason,
                    other => other.to_string(),
                };
                let op = self.engine.mark_phase(
                    un.skeleton(),
                    WorkflowPhase::Failed,
                    format!("cannot unmarshal spec: {reason}"),
                );
                self.persist_or_retry(key, op.workflow).await;
                self.throttler.remove(key);
                return;
            }
        };

        if wf.status.phase != WorkflowPhase::Unknown && self.recent.contains(key) {
            tracing::warn!(key = %key, "Rejecting recently completed workflow");
            return;
        }

        self.queue.add_after(key.clone(), self.config.resync_period());

        let latest = self.reconcile(key, wf).await;
        if !latest.reconciliation_needed() {
            self.throttler.remove(key);
        }
    }

    /// Admission, hydration and one engine pass. Returns the latest known
    /// state of the workflow.
    async fn reconcile(&self, key: &WorkflowKey, mut wf: Workflow) -> Workflow {
        if !wf.is_terminating() && !wf.is_completed() {
            self.throttler
                .add(key.clone(), wf.priority(), wf.metadata.creation_timestamp);
            if !self.throttler.admit(key) {
                tracing::info!(key = %key, "Workflow processing has been postponed due to max parallelism limit");
                if wf.status.phase == WorkflowPhase::Unknown {
                    let op = self.engine.mark_phase(wf, WorkflowPhase::Pending, POSTPONED_MESSAGE);
                    return self.persist_or_retry(key, op.workflow).await;
                }
                return wf;
            }
        }

        if let Err(e) = self.hydrator.hydrate(&mut wf).await {
            tracing::error!(key = %key, error = %e, "Hydration failed");
            let op = self.engine.mark_phase(wf, WorkflowPhase::Error, e.to_string());
            return self.persist_or_retry(key, op.workflow).await;
        }

        let before = wf.clone();
        let started = Instant::now();
        let result = self.engine.operate(wf).await;
        let elapsed = started.elapsed();
        self.metrics
            .observe_duration(result.is_ok(), elapsed.as_secs_f64());
        tracing::debug!(key = %key, elapsed_ms = elapsed.as_millis() as u64, "Workflow operated");

        match result {
            Ok(op) => {
                if let Some(delay) = op.requeue_after {
                    self.queue.add_after(key.clone(), delay);
                }
                if op.workflow == before {
                    self.metrics.record_operation(OperationOutcome::Unchanged);
                    self.queue.forget(key);
                    return op.workflow;
                }
                self.metrics.record_operation(OperationOutcome::Updated);
                self.persist_or_retry(key, op.workflow).await
            }
            Err(e) if e.is_transient() => {
                self.metrics.record_operation(OperationOutcome::Error);
                let retries = self.queue.num_requeues(key);
                if retries < self.config.dispatch.max_transient_retries {
                    tracing::warn!(key = %key, error = %e, retries, "Transient error, requeueing");
                    self.queue.add_rate_limited(key.clone());
                    return before;
                }
                tracing::error!(key = %key, error = %e, retries, "Transient error persisted, giving up");
                let op = self.engine.mark_phase(before, WorkflowPhase::Error, e.to_string());
                self.persist_or_retry(key, op.workflow).await
            }
            Err(e) => {
                self.metrics.record_operation(OperationOutcome::Error);
                tracing::error!(key = %key, error = %e, "Workflow operation failed");
                let op = self.engine.mark_phase(before, WorkflowPhase::Error, e.to_string());
                self.persist_or_retry(key, op.workflow).await
            }
        }
    }

    /// Persist and hand back the stored state. A failed write leaves the
    /// stored object alone; transient failures are retried with backoff.
    async fn persist_or_retry(&self, key: &WorkflowKey, wf: Workflow) -> Workflow {
        match self.persist(wf.clone()).await {
            Ok(persisted) => {
                self.queue.forget(key);
                persisted
            }
            Err(e) => {
                self.metrics.record_persist(false);
                tracing::warn!(key = %key, error = %e, "Failed to persist workflow");
                if matches!(&e, ControllerError::Store(s) if s.is_transient()) {
                    self.queue.add_rate_limited(key.clone());
                }
                wf
            }
        }
    }

    async fn persist(&self, wf: Workflow) -> ControllerResult<Workflow> {
        let mut out = wf.clone();
        if let Err(e) = self.hydrator.dehydrate(&mut out).await {
            if e.is_transient() {
                return Err(e.into());
            }
            tracing::error!(key = %wf.key(), error = %e, "Failed to offload node status");
            let op = self.engine.mark_phase(
                wf,
                WorkflowPhase::Error,
                format!("failed to offload node status: {e}"),
            );
            out = op.workflow;
            out.status.nodes.clear();
        }
        let patched = self.store.patch_workflow(&out).await?;
        self.metrics.record_persist(true);
        if patched.is_completed() {
            self.recent.record(patched.key());
        }
        Ok(patched)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
