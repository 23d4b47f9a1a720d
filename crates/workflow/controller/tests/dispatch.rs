//! Controller behaviour against the in-memory cluster

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use workflow_controller::{
    ControllerConfig, ControllerDeps, ControllerMetrics, ControllerResult, InMemoryCluster,
    OperationOutcome, WorkflowCache, WorkflowController, POSTPONED_MESSAGE,
};
use workflow_engine::{
    EngineResult, InMemoryOffloadStore, InMemoryTaskBackend, OffloadStore, TaskBackend,
    TaskState, TaskSubmission,
};
use workflow_types::*;

const TIMEOUT: Duration = Duration::from_secs(10);

fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.dispatch.workers = 4;
    config.sync.notify_delay_ms = 10;
    config.engine.task_poll_interval_secs = 1;
    config
}

struct Harness {
    cluster: Arc<InMemoryCluster>,
    controller: Arc<WorkflowController>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<ControllerResult<()>>,
}

fn start(
    config: ControllerConfig,
    cluster: Arc<InMemoryCluster>,
    tasks: Arc<dyn TaskBackend>,
    offload: Arc<dyn OffloadStore>,
) -> Harness {
    let events = cluster.subscribe();
    let deps = ControllerDeps::in_memory(cluster.clone(), tasks, offload);
    let metrics = Arc::new(ControllerMetrics::new(&prometheus::Registry::new()).unwrap());
    let controller = Arc::new(WorkflowController::new(config, deps, metrics));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(controller.clone().run(events, shutdown_rx));
    Harness {
        cluster,
        controller,
        shutdown,
        handle,
    }
}

impl Harness {
    async fn wait_for(&self, key: &WorkflowKey, what: &str, pred: impl Fn(&Workflow) -> bool) -> Workflow {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if let Some(wf) = self.cluster.workflow(key) {
                if pred(&wf) {
                    return wf;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {key}: {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_phase(&self, key: &WorkflowKey, phase: WorkflowPhase) -> Workflow {
        self.wait_for(key, phase.as_str(), |wf| wf.status.phase == phase).await
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(TIMEOUT, self.handle)
            .await
            .expect("controller did not stop")
            .unwrap()
            .unwrap();
    }
}

fn single_task(name: &str) -> Workflow {
    let spec = WorkflowSpec::new("main").with_template(Template::task("main"));
    Workflow::new("ns", name, spec)
}

#[tokio::test]
async fn test_workflow_runs_to_completion() {
    let cluster = Arc::new(InMemoryCluster::new());
    let spec = WorkflowSpec::new("main")
        .with_template(Template::steps(
            "main",
            vec![
                vec![WorkflowStep::new("a", "work")],
                vec![WorkflowStep::new("b", "work")],
            ],
        ))
        .with_template(Template::task("work"));
    let wf = Workflow::new("ns", "steps", spec);
    cluster.create_workflow(&wf).unwrap();

    let h = start(
        test_config(),
        cluster,
        Arc::new(InMemoryTaskBackend::auto_completing()),
        Arc::new(InMemoryOffloadStore::new()),
    );
    let done = h.wait_for_phase(&wf.key(), WorkflowPhase::Succeeded).await;
    assert_eq!(done.metadata.label(LABEL_COMPLETED), Some("true"));
    assert!(done.status.node_by_name("steps[1].b").is_some());

    let controller = h.controller.clone();
    h.stop().await;
    assert!(controller.recent_completions().contains(&wf.key()));
    assert!(controller.metrics().timed_operations() > 0);
    assert!(controller.metrics().operations(OperationOutcome::Updated) > 0);
    assert!(controller.metrics().persists(true) > 0);
    assert_eq!(controller.throttler().running_count(), 0);
}

#[tokio::test]
async fn test_semaphore_release_reenqueues_waiter() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.upsert_config_map(ConfigMap::new("ns", "limits").with_entry("workflow", "1"));
    let mut keys = Vec::new();
    for name in ["first", "second"] {
        let mut wf = single_task(name);
        wf.spec.synchronization = Some(Synchronization::semaphore(None, "limits", "workflow"));
        cluster.create_workflow(&wf).unwrap();
        keys.push(wf.key());
    }
    let tasks = Arc::new(InMemoryTaskBackend::new());
    let h = start(
        test_config(),
        cluster,
        tasks.clone(),
        Arc::new(InMemoryOffloadStore::new()),
    );

    let lock = "ns/ConfigMap/limits/workflow";
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    let (holder, waiter) = loop {
        let phases: Vec<WorkflowPhase> = keys
            .iter()
            .map(|k| h.cluster.workflow(k).map(|wf| wf.status.phase).unwrap_or_default())
            .collect();
        match phases.as_slice() {
            [WorkflowPhase::Running, WorkflowPhase::Pending] => break (keys[0].clone(), keys[1].clone()),
            [WorkflowPhase::Pending, WorkflowPhase::Running] => break (keys[1].clone(), keys[0].clone()),
            _ if tokio::time::Instant::now() > deadline => panic!("lock never settled: {phases:?}"),
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };
    let pending = h.cluster.workflow(&waiter).unwrap();
    assert!(pending.status.message.starts_with("Waiting for"), "{}", pending.status.message);
    let snapshot = h.controller.sync().lock_snapshot(lock).unwrap();
    assert_eq!(snapshot.holders, vec![holder.to_string()]);
    assert_eq!(snapshot.waiters, vec![waiter.to_string()]);

    tasks.set_state(&holder, &holder.name, TaskState::Succeeded(Outputs::default()));
    h.wait_for_phase(&holder, WorkflowPhase::Succeeded).await;
    h.wait_for_phase(&waiter, WorkflowPhase::Running).await;
    let snapshot = h.controller.sync().lock_snapshot(lock).unwrap();
    assert_eq!(snapshot.holders, vec![waiter.to_string()]);
    assert!(snapshot.waiters.is_empty());

    tasks.set_state(&waiter, &waiter.name, TaskState::Succeeded(Outputs::default()));
    h.wait_for_phase(&waiter, WorkflowPhase::Succeeded).await;
    assert!(h.controller.sync().lock_snapshot(lock).unwrap().holders.is_empty());
    h.stop().await;
}

#[tokio::test]
async fn test_deleted_holder_frees_mutex() {
    let cluster = Arc::new(InMemoryCluster::new());
    let tasks = Arc::new(InMemoryTaskBackend::new());
    let h = start(
        test_config(),
        cluster.clone(),
        tasks.clone(),
        Arc::new(InMemoryOffloadStore::new()),
    );

    let mut holder = single_task("holder");
    holder.spec.synchronization = Some(Synchronization::mutex(None, "only-one"));
    cluster.create_workflow(&holder).unwrap();
    h.wait_for_phase(&holder.key(), WorkflowPhase::Running).await;

    let mut waiter = single_task("waiter");
    waiter.spec.synchronization = Some(Synchronization::mutex(None, "only-one"));
    cluster.create_workflow(&waiter).unwrap();
    h.wait_for_phase(&waiter.key(), WorkflowPhase::Pending).await;

    cluster.delete_workflow(&holder.key()).unwrap();
    h.wait_for_phase(&waiter.key(), WorkflowPhase::Running).await;
    assert!(h.controller.recent_completions().contains(&holder.key()));
    h.stop().await;
}

#[tokio::test]
async fn test_parallelism_postpones_and_promotes() {
    let cluster = Arc::new(InMemoryCluster::new());
    let tasks = Arc::new(InMemoryTaskBackend::new());
    let mut config = test_config();
    config.throttle.parallelism = 1;
    let h = start(
        config,
        cluster.clone(),
        tasks.clone(),
        Arc::new(InMemoryOffloadStore::new()),
    );

    let first = single_task("first");
    cluster.create_workflow(&first).unwrap();
    h.wait_for_phase(&first.key(), WorkflowPhase::Running).await;

    let second = single_task("second");
    cluster.create_workflow(&second).unwrap();
    let postponed = h.wait_for_phase(&second.key(), WorkflowPhase::Pending).await;
    assert_eq!(postponed.status.message, POSTPONED_MESSAGE);

    tasks.set_state(&first.key(), "first", TaskState::Succeeded(Outputs::default()));
    h.wait_for_phase(&first.key(), WorkflowPhase::Succeeded).await;
    h.wait_for_phase(&second.key(), WorkflowPhase::Running).await;
    assert!(h.controller.throttler().is_running(&second.key()));
    h.stop().await;
}

#[tokio::test]
async fn test_terminate_bypasses_admission_but_stop_does_not() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut config = test_config();
    config.throttle.parallelism = 1;
    let h = start(
        config,
        cluster.clone(),
        Arc::new(InMemoryTaskBackend::new()),
        Arc::new(InMemoryOffloadStore::new()),
    );

    let busy = single_task("busy");
    cluster.create_workflow(&busy).unwrap();
    h.wait_for_phase(&busy.key(), WorkflowPhase::Running).await;

    let mut terminated = single_task("terminated");
    terminated.spec.shutdown = Some(ShutdownStrategy::Terminate);
    cluster.create_workflow(&terminated).unwrap();
    let done = h.wait_for_phase(&terminated.key(), WorkflowPhase::Failed).await;
    assert_eq!(done.status.message, "Stopped with strategy 'Terminate'");

    let mut stopped = single_task("stopped");
    stopped.spec.shutdown = Some(ShutdownStrategy::Stop);
    cluster.create_workflow(&stopped).unwrap();
    let postponed = h.wait_for_phase(&stopped.key(), WorkflowPhase::Pending).await;
    assert_eq!(postponed.status.message, POSTPONED_MESSAGE);
    assert!(!h.controller.throttler().is_running(&stopped.key()));
    assert!(h.controller.throttler().is_running(&busy.key()));
    h.stop().await;
}

#[tokio::test]
async fn test_controller_config_map_raises_parallelism() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut config = test_config();
    config.throttle.parallelism = 1;
    let h = start(
        config,
        cluster.clone(),
        Arc::new(InMemoryTaskBackend::new()),
        Arc::new(InMemoryOffloadStore::new()),
    );

    let first = single_task("first");
    cluster.create_workflow(&first).unwrap();
    h.wait_for_phase(&first.key(), WorkflowPhase::Running).await;
    let second = single_task("second");
    cluster.create_workflow(&second).unwrap();
    h.wait_for_phase(&second.key(), WorkflowPhase::Pending).await;

    cluster.upsert_config_map(
        ConfigMap::new("workflows", "workflow-controller-configmap").with_entry("parallelism", "2"),
    );
    h.wait_for_phase(&second.key(), WorkflowPhase::Running).await;
    h.stop().await;
}

#[tokio::test]
async fn test_unmarshal_failure_marks_workflow_failed() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut un = UnstructuredWorkflow {
        metadata: ObjectMeta::new("ns", "broken"),
        body: serde_json::json!({ "spec": { "entrypoint": 42 } }),
    };
    cluster.create_unstructured(&mut un).unwrap();
    let h = start(
        test_config(),
        cluster.clone(),
        Arc::new(InMemoryTaskBackend::auto_completing()),
        Arc::new(InMemoryOffloadStore::new()),
    );

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    let stored = loop {
        let stored = cluster.get_by_key(&un.key()).unwrap();
        if stored.phase() == WorkflowPhase::Failed {
            break stored;
        }
        assert!(tokio::time::Instant::now() < deadline, "workflow never failed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let message = stored.body["status"]["message"].as_str().unwrap_or_default();
    assert!(message.starts_with("cannot unmarshal spec:"), "{message}");
    assert_eq!(stored.metadata.label(LABEL_COMPLETED), Some("true"));
    assert_eq!(stored.body["spec"]["entrypoint"], 42);
    h.stop().await;
}

#[tokio::test]
async fn test_hydration_failure_marks_error_without_operating() {
    let cluster = Arc::new(InMemoryCluster::new());
    let tasks = Arc::new(InMemoryTaskBackend::auto_completing());
    let mut wf = single_task("offloaded");
    wf.status.offload_node_status_version = Some("blake3-0000000000000000".to_string());
    cluster.create_workflow(&wf).unwrap();
    let h = start(
        test_config(),
        cluster.clone(),
        tasks.clone(),
        Arc::new(InMemoryOffloadStore::new()),
    );

    let errored = h.wait_for_phase(&wf.key(), WorkflowPhase::Error).await;
    assert!(!errored.status.message.is_empty());
    assert!(errored.status.nodes.is_empty());
    assert_eq!(errored.metadata.label(LABEL_COMPLETED), Some("true"));
    assert!(tasks.submitted_names().is_empty());
    let metrics = h.controller.metrics().clone();
    h.stop().await;
    assert_eq!(metrics.timed_operations(), 0);
}

/// Panics while submitting tasks of one workflow
struct ExplodingBackend {
    inner: InMemoryTaskBackend,
    target: String,
}

#[async_trait]
impl TaskBackend for ExplodingBackend {
    async fn submit(&self, task: TaskSubmission) -> EngineResult<()> {
        if task.workflow.name == self.target {
            panic!("backend exploded for {}", task.workflow);
        }
        self.inner.submit(task).await
    }

    async fn observe(&self, key: &WorkflowKey, node_id: &str) -> EngineResult<TaskState> {
        self.inner.observe(key, node_id).await
    }
}

#[tokio::test]
async fn test_panicking_pass_does_not_stop_the_worker() {
    let cluster = Arc::new(InMemoryCluster::new());
    let backend = Arc::new(ExplodingBackend {
        inner: InMemoryTaskBackend::auto_completing(),
        target: "explode".to_string(),
    });
    let mut config = test_config();
    config.dispatch.workers = 1;
    let explode = single_task("explode");
    let calm = single_task("calm");
    cluster.create_workflow(&explode).unwrap();
    cluster.create_workflow(&calm).unwrap();
    let h = start(
        config,
        cluster.clone(),
        backend,
        Arc::new(InMemoryOffloadStore::new()),
    );

    h.wait_for_phase(&calm.key(), WorkflowPhase::Succeeded).await;
    let metrics = h.controller.metrics().clone();
    let panics = metrics.operations(OperationOutcome::Panic);
    assert!(panics >= 1);
    assert!(!h.controller.queue().is_processing(&explode.key()));

    // the key lock and the queue slot were both given back
    h.controller.queue().add(explode.key());
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while metrics.operations(OperationOutcome::Panic) <= panics {
        assert!(tokio::time::Instant::now() < deadline, "second pass never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        cluster.workflow(&explode.key()).unwrap().status.phase,
        WorkflowPhase::Unknown
    );
    h.stop().await;
}

#[tokio::test]
async fn test_transient_store_errors_are_retried() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.set_unavailable(true);
    let wf = single_task("flaky");
    cluster.create_workflow(&wf).unwrap();
    let h = start(
        test_config(),
        cluster.clone(),
        Arc::new(InMemoryTaskBackend::auto_completing()),
        Arc::new(InMemoryOffloadStore::new()),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.workflow(&wf.key()).unwrap().status.phase, WorkflowPhase::Unknown);
    assert!(h.controller.metrics().persists(false) > 0);

    cluster.set_unavailable(false);
    h.wait_for_phase(&wf.key(), WorkflowPhase::Succeeded).await;
    h.stop().await;
}

#[tokio::test]
async fn test_archive_worker_archives_completed_workflows() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut config = test_config();
    config.archive.enabled = true;
    let wf = single_task("archived");
    cluster.create_workflow(&wf).unwrap();
    let h = start(
        config,
        cluster.clone(),
        Arc::new(InMemoryTaskBackend::auto_completing()),
        Arc::new(InMemoryOffloadStore::new()),
    );

    h.wait_for(&wf.key(), "archived label", |wf| {
        wf.metadata.label(LABEL_ARCHIVING_STATUS) == Some("Archived")
    })
    .await;
    let archived = cluster.archived();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].status.phase, WorkflowPhase::Succeeded);

    assert_eq!(h.controller.archived_workflow_gc(Duration::from_secs(3600)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.controller.archived_workflow_gc(Duration::ZERO).await.unwrap(), 1);
    assert!(cluster.archived().is_empty());
    h.stop().await;
}

#[tokio::test]
async fn test_offload_gc_keeps_only_live_version() {
    let cluster = Arc::new(InMemoryCluster::new());
    let offload = Arc::new(InMemoryOffloadStore::new());
    let mut config = test_config();
    config.offload.always_offload = true;
    let spec = WorkflowSpec::new("main")
        .with_template(Template::steps(
            "main",
            vec![vec![WorkflowStep::new("a", "work")], vec![WorkflowStep::new("b", "work")]],
        ))
        .with_template(Template::task("work"));
    let wf = Workflow::new("ns", "offloaded", spec);
    let un = cluster.create_workflow(&wf).unwrap();
    let uid = un.metadata.uid.clone();
    let h = start(
        config,
        cluster.clone(),
        Arc::new(InMemoryTaskBackend::auto_completing()),
        offload.clone(),
    );

    let done = h.wait_for_phase(&wf.key(), WorkflowPhase::Succeeded).await;
    assert!(done.status.nodes.is_empty());
    let live = done.status.offload_node_status_version.clone().unwrap();
    assert!(offload.versions(&uid).len() > 1);

    let deleted = h.controller.offload_gc().await.unwrap();
    assert!(deleted > 0);
    assert_eq!(offload.versions(&uid), vec![live]);

    cluster.delete_workflow(&wf.key()).unwrap();
    h.controller.offload_gc().await.unwrap();
    assert!(offload.versions(&uid).is_empty());
    h.stop().await;
}

/// Backend whose observations are slow, to catch overlapping passes.
#[derive(Default)]
struct SlowBackend {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    observed: AtomicUsize,
}

#[async_trait]
impl TaskBackend for SlowBackend {
    async fn submit(&self, _: TaskSubmission) -> EngineResult<()> {
        Ok(())
    }

    async fn observe(&self, _: &WorkflowKey, _: &str) -> EngineResult<TaskState> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let observed = self.observed.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(if observed >= 5 {
            TaskState::Succeeded(Outputs::default())
        } else {
            TaskState::Running
        })
    }
}

#[tokio::test]
async fn test_passes_for_one_key_never_overlap() {
    let cluster = Arc::new(InMemoryCluster::new());
    let backend = Arc::new(SlowBackend::default());
    let mut config = test_config();
    config.dispatch.workers = 8;
    let wf = single_task("serial");
    cluster.create_workflow(&wf).unwrap();
    let h = start(
        config,
        cluster.clone(),
        backend.clone(),
        Arc::new(InMemoryOffloadStore::new()),
    );
    h.wait_for_phase(&wf.key(), WorkflowPhase::Running).await;

    for _ in 0..40 {
        h.controller.queue().add(wf.key());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.wait_for_phase(&wf.key(), WorkflowPhase::Succeeded).await;
    assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
    h.stop().await;
}
