//! Reconciliation passes
//!
//! [`Engine::operate`] runs one pass over a workflow: it takes a working
//! copy, advances whatever can be advanced without blocking, and hands the
//! result back to the caller, which decides whether anything needs to be
//! persisted. A pass never waits for work to finish; it submits, observes,
//! and returns.
//!
//! Template invocation is recursive (steps and DAG templates invoke other
//! templates). The depth is an explicit counter on the operation context,
//! so a self-referencing template fails the workflow instead of the stack.

use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use workflow_sync::{node_holder, workflow_holder, SyncError, SyncManager};
use workflow_types::{
    node_id, Arguments, LifecycleHook, NodePhase, NodeStatus, NodeType, Parameter,
    ShutdownStrategy, SynchronizationStatus, Template, TemplateKind, TemplateRef, Workflow,
    WorkflowError, WorkflowPhase, WorkflowTemplate, LABEL_ARCHIVING_STATUS,
};

use crate::backend::{TaskBackend, TaskState, TaskSubmission, TemplateGetter};
use crate::expr::{ExpressionEvaluator, SimpleEvaluator};
use crate::scope::WfScope;
use crate::substitute::{replace_json, Params};
use crate::{EngineError, EngineResult};

/// Default limit on nested template invocations
pub const DEFAULT_MAX_STACK_DEPTH: usize = 100;

// ── Engine ───────────────────────────────────────────────────────────

/// Engine settings
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub max_stack_depth: usize,
    /// Completed workflows are labelled for the archive worker
    pub archive_enabled: bool,
    /// How soon to look again at a workflow with running tasks
    pub task_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            archive_enabled: false,
            task_poll_interval: Duration::from_secs(10),
        }
    }
}

/// Shared, long-lived dependencies of every pass
pub struct Engine {
    config: EngineConfig,
    sync: Arc<SyncManager>,
    backend: Arc<dyn TaskBackend>,
    templates: Arc<dyn TemplateGetter>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

/// Result of one pass
#[derive(Clone, Debug)]
pub struct Operation {
    pub workflow: Workflow,
    /// Whether the pass changed anything
    pub updated: bool,
    /// Earliest time the workflow should be looked at again
    pub requeue_after: Option<Duration>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        sync: Arc<SyncManager>,
        backend: Arc<dyn TaskBackend>,
        templates: Arc<dyn TemplateGetter>,
    ) -> Self {
        Self {
            config,
            sync,
            backend,
            templates,
            evaluator: Arc::new(SimpleEvaluator),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// Run one reconciliation pass. The input must be hydrated.
    #[instrument(skip(self, wf), fields(key = %wf.key()))]
    pub async fn operate(&self, wf: Workflow) -> EngineResult<Operation> {
        let mut woc = OperationContext::new(self, wf);
        woc.operate().await?;
        Ok(Operation {
            workflow: woc.wf,
            updated: woc.updated,
            requeue_after: woc.requeue_after,
        })
    }

    /// Move a workflow to `phase` outside of a pass. A terminal phase
    /// finalizes the workflow the same way a pass would.
    pub fn mark_phase(
        &self,
        wf: Workflow,
        phase: WorkflowPhase,
        message: impl Into<String>,
    ) -> Operation {
        let mut woc = OperationContext::new(self, wf);
        woc.mark_workflow_phase(phase, message.into());
        Operation {
            workflow: woc.wf,
            updated: woc.updated,
            requeue_after: None,
        }
    }
}

// ── Template lookup ──────────────────────────────────────────────────

/// Where bare template names are looked up
#[derive(Clone, Debug)]
pub(crate) enum TemplateContext {
    /// The workflow's own templates
    Workflow,
    /// Siblings inside a shared template resource
    Stored(Arc<WorkflowTemplate>),
}

/// What an invocation points at
#[derive(Clone, Debug)]
pub(crate) enum TemplateTarget {
    Name(String),
    Ref(TemplateRef),
    /// Already resolved and substituted, used for retry attempts
    Resolved(Box<Template>),
}

impl TemplateTarget {
    pub(crate) fn from_invocation(
        template: Option<&String>,
        template_ref: Option<&TemplateRef>,
    ) -> Option<Self> {
        match (template, template_ref) {
            (Some(name), _) => Some(Self::Name(name.clone())),
            (None, Some(r)) => Some(Self::Ref(r.clone())),
            (None, None) => None,
        }
    }

    pub(crate) fn from_hook(hook: &LifecycleHook) -> Option<Self> {
        Self::from_invocation(hook.template.as_ref(), hook.template_ref.as_ref())
    }

    pub(crate) fn display(&self) -> String {
        match self {
            Self::Name(name) => name.clone(),
            Self::Ref(r) => format!("{}/{}", r.name, r.template),
            Self::Resolved(t) => t.name.clone(),
        }
    }
}

/// Per-invocation options
#[derive(Clone, Debug, Default)]
pub(crate) struct ExecuteOpts {
    pub boundary_id: String,
    /// Part of an exit handler; still runs under `Stop`
    pub on_exit: bool,
    /// An attempt under a retry node
    pub retry_attempt: bool,
}

fn node_type_of(tmpl: &Template) -> NodeType {
    match tmpl.kind {
        TemplateKind::Task { .. } => NodeType::Task,
        TemplateKind::Steps { .. } => NodeType::Steps,
        TemplateKind::Dag { .. } => NodeType::Dag,
    }
}

// ── Operation context ────────────────────────────────────────────────

/// State of a single pass
pub(crate) struct OperationContext<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) wf: Workflow,
    pub(crate) globals: Params,
    depth: usize,
    pub(crate) updated: bool,
    requeue_after: Option<Duration>,
    stored_templates: HashMap<(String, String, bool), Arc<WorkflowTemplate>>,
}

impl<'a> OperationContext<'a> {
    pub(crate) fn new(engine: &'a Engine, wf: Workflow) -> Self {
        Self {
            engine,
            wf,
            globals: Params::new(),
            depth: 0,
            updated: false,
            requeue_after: None,
            stored_templates: HashMap::new(),
        }
    }

    async fn operate(&mut self) -> EngineResult<()> {
        if self.wf.is_completed() {
            if self.wf.reconciliation_needed() {
                self.finalize();
            }
            return Ok(());
        }

        if matches!(
            self.wf.status.phase,
            WorkflowPhase::Unknown | WorkflowPhase::Pending
        ) {
            if let Err(reason) = self.validate() {
                self.mark_workflow_phase(WorkflowPhase::Failed, format!("invalid spec: {reason}"));
                return Ok(());
            }
        }
        self.set_globals();

        if self.wf.is_terminating() {
            self.terminate();
            return Ok(());
        }

        if !self.acquire_workflow_locks().await? {
            return Ok(());
        }

        if self.wf.status.phase != WorkflowPhase::Running {
            self.mark_workflow_phase(WorkflowPhase::Running, String::new());
        }

        let name = self.wf.name().to_string();
        let entry = TemplateTarget::Name(self.wf.spec.entrypoint.clone());
        let args = self.wf.spec.arguments.clone();
        let result = self
            .execute_template(name, entry, TemplateContext::Workflow, args, ExecuteOpts::default())
            .await;
        let Some(node) = self.absorb(result)? else {
            return Ok(());
        };
        if !node.is_completed() {
            return Ok(());
        }

        let mut exit_node = None;
        if let Some(hook) = self.wf.spec.exit_hook() {
            self.globals.insert(
                "workflow.status".to_string(),
                WorkflowPhase::from(node.phase).to_string(),
            );
            self.globals
                .insert("workflow.failures".to_string(), self.failures_json()?);
            let result = self
                .run_on_exit_node(&hook, &node, "", &TemplateContext::Workflow, "workflow", &WfScope::new())
                .await;
            match self.absorb(result)? {
                None => return Ok(()),
                Some(Some(exit)) if !exit.is_completed() => return Ok(()),
                Some(exit) => exit_node = exit,
            }
        }

        let (phase, message) = self.final_phase(&node, exit_node.as_ref());
        self.mark_workflow_phase(phase, message);
        Ok(())
    }

    /// Turn a pass-level error into a workflow phase. Transient errors are
    /// returned so the caller retries; `None` means the pass is over.
    fn absorb<T>(&mut self, result: EngineResult<T>) -> EngineResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_transient() => Err(e),
            Err(EngineError::MaxDepthExceeded) => {
                warn!(key = %self.wf.key(), "Maximum recursion depth exceeded");
                self.mark_workflow_phase(
                    WorkflowPhase::Failed,
                    EngineError::MaxDepthExceeded.to_string(),
                );
                Ok(None)
            }
            Err(e) => {
                warn!(key = %self.wf.key(), error = %e, "Workflow errored");
                self.mark_workflow_phase(WorkflowPhase::Error, e.to_string());
                Ok(None)
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        let entry = &self.wf.spec.entrypoint;
        if entry.is_empty() {
            return Err("entrypoint is required".to_string());
        }
        if self.wf.spec.get_template(entry).is_none() {
            return Err(format!("template \"{entry}\" not found"));
        }
        Ok(())
    }

    fn set_globals(&mut self) {
        let wf = &self.wf;
        let mut globals = Params::new();
        globals.insert("workflow.name".into(), wf.name().to_string());
        globals.insert("workflow.namespace".into(), wf.namespace().to_string());
        globals.insert("workflow.uid".into(), wf.uid().to_string());
        globals.insert("workflow.priority".into(), wf.priority().to_string());
        globals.insert(
            "workflow.creationTimestamp".into(),
            wf.metadata.creation_timestamp.to_rfc3339(),
        );
        for param in &wf.spec.arguments.parameters {
            if let Some(value) = param.effective_value() {
                globals.insert(format!("workflow.parameters.{}", param.name), value.to_string());
            }
        }
        self.globals = globals;
    }

    /// Take the workflow-level locks. `false` ends the pass.
    async fn acquire_workflow_locks(&mut self) -> EngineResult<bool> {
        let Some(sync) = self.wf.spec.synchronization.clone().filter(|s| !s.is_empty()) else {
            return Ok(true);
        };
        let holder = workflow_holder(&self.wf.key());
        let before = self.wf.status.synchronization.clone();
        let result = self.engine.sync.try_acquire(&mut self.wf, &holder, &sync).await;
        self.note_sync_change(before);
        match result {
            Ok(acq) if acq.acquired => Ok(true),
            Ok(acq) => {
                let message = acq.waiting_message.unwrap_or_default();
                self.mark_workflow_phase(WorkflowPhase::Pending, message);
                Ok(false)
            }
            Err(SyncError::BadRequest(reason)) => {
                self.mark_workflow_phase(WorkflowPhase::Error, reason);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn terminate(&mut self) {
        let message = "workflow shutdown with strategy: Terminate".to_string();
        let running: Vec<String> = self
            .wf
            .status
            .nodes
            .values()
            .filter(|n| !n.is_completed())
            .map(|n| n.id.clone())
            .collect();
        for id in running {
            self.set_node_phase(&id, NodePhase::Failed, Some(message.clone()));
        }
        self.mark_workflow_phase(
            WorkflowPhase::Failed,
            "Stopped with strategy 'Terminate'".to_string(),
        );
    }

    fn final_phase(&self, entry: &NodeStatus, exit: Option<&NodeStatus>) -> (WorkflowPhase, String) {
        let mut phase = WorkflowPhase::from(entry.phase);
        let mut message = entry.message.clone();
        if phase == WorkflowPhase::Succeeded
            && self.wf.spec.shutdown == Some(ShutdownStrategy::Stop)
        {
            phase = WorkflowPhase::Failed;
            message = "Stopped with strategy 'Stop'".to_string();
        }
        if let Some(exit) = exit {
            if phase == WorkflowPhase::Succeeded && !exit.phase.is_successful() {
                phase = WorkflowPhase::Failed;
                message = if exit.message.is_empty() {
                    "exit handler failed".to_string()
                } else {
                    exit.message.clone()
                };
            }
        }
        (phase, message)
    }

    fn failures_json(&self) -> EngineResult<String> {
        let failures: Vec<serde_json::Value> = self
            .wf
            .status
            .nodes
            .values()
            .filter(|n| {
                n.node_type == NodeType::Task
                    && matches!(n.phase, NodePhase::Failed | NodePhase::Error)
            })
            .map(|n| {
                serde_json::json!({
                    "displayName": n.display_name,
                    "message": n.message,
                    "templateName": n.template_name,
                    "phase": n.phase,
                    "finishedAt": n.finished_at,
                })
            })
            .collect();
        Ok(serde_json::to_string(&failures)?)
    }

    pub(crate) fn mark_workflow_phase(&mut self, phase: WorkflowPhase, message: String) {
        if self.wf.status.phase == phase && self.wf.status.message == message {
            return;
        }
        info!(key = %self.wf.key(), from = %self.wf.status.phase, to = %phase, "Workflow phase changed");
        self.wf.set_phase(phase);
        self.wf.status.message = message;
        if phase == WorkflowPhase::Running && self.wf.status.started_at.is_none() {
            self.wf.status.started_at = Some(Utc::now());
        }
        self.updated = true;
        if phase.is_completed() {
            self.wf.status.finished_at = Some(Utc::now());
            self.finalize();
        }
    }

    /// Label a completed workflow and give back every lock it holds.
    fn finalize(&mut self) {
        let labels = self.wf.metadata.labels.clone();
        self.wf.mark_completed_label();
        if self.engine.config.archive_enabled
            && self.wf.metadata.label(LABEL_ARCHIVING_STATUS).is_none()
        {
            self.wf
                .metadata
                .labels
                .insert(LABEL_ARCHIVING_STATUS.to_string(), "Pending".to_string());
        }
        let released = self.engine.sync.release_all(&mut self.wf);
        if released > 0 || self.wf.metadata.labels != labels {
            self.updated = true;
        }
    }

    fn note_sync_change(&mut self, before: Option<SynchronizationStatus>) {
        if self.wf.status.synchronization != before {
            self.updated = true;
        }
    }

    pub(crate) fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.engine.evaluator.as_ref()
    }

    pub(crate) fn requeue(&mut self, delay: Duration) {
        self.requeue_after = Some(self.requeue_after.map_or(delay, |d| d.min(delay)));
    }

    // ── Template execution ───────────────────────────────────────────

    /// Execute (or continue) the node `node_name` for `target`.
    pub(crate) fn execute_template(
        &mut self,
        node_name: String,
        target: TemplateTarget,
        tmpl_ctx: TemplateContext,
        args: Arguments,
        opts: ExecuteOpts,
    ) -> BoxFuture<'_, EngineResult<NodeStatus>> {
        Box::pin(async move {
            self.depth += 1;
            let result = self
                .execute_template_inner(node_name, target, tmpl_ctx, args, opts)
                .await;
            self.depth -= 1;
            result
        })
    }

    async fn execute_template_inner(
        &mut self,
        node_name: String,
        target: TemplateTarget,
        tmpl_ctx: TemplateContext,
        args: Arguments,
        opts: ExecuteOpts,
    ) -> EngineResult<NodeStatus> {
        if self.depth > self.engine.config.max_stack_depth {
            return Err(EngineError::MaxDepthExceeded);
        }
        let id = node_id(self.wf.name(), &node_name);
        if let Some(node) = self.node(&id) {
            if node.is_completed() {
                return Ok(node.clone());
            }
        }

        let exists = self.node(&id).is_some();
        if !exists && !ShutdownStrategy::should_execute(self.wf.spec.shutdown, opts.on_exit) {
            let strategy = self.wf.spec.shutdown.map(|s| format!("{s:?}")).unwrap_or_default();
            let node = self.init_node(&node_name, NodeType::Task, &target.display(), &opts.boundary_id);
            self.set_node_phase(
                &node.id,
                NodePhase::Skipped,
                Some(format!("workflow shutdown with strategy: {strategy}")),
            );
            return self.snapshot(&node.id);
        }

        let (tmpl, ctx) = match self.resolve_template(&tmpl_ctx, &target).await {
            Ok(found) => found,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                return self.error_node(&node_name, &target.display(), &opts.boundary_id, e.to_string())
            }
        };
        let (tmpl, inputs) = match self.process_inputs(&tmpl, &args) {
            Ok(processed) => processed,
            Err(e) => return self.error_node(&node_name, &tmpl.name, &opts.boundary_id, e.to_string()),
        };

        if !opts.retry_attempt {
            if let Some(strategy) = tmpl.retry_strategy.clone() {
                return self
                    .execute_retry(node_name, tmpl, ctx, inputs, strategy, opts)
                    .await;
            }
        }

        let sync = tmpl.synchronization.clone().filter(|s| !s.is_empty());
        let holder = node_holder(&self.wf.key(), &id);
        if let Some(sync) = &sync {
            let before = self.wf.status.synchronization.clone();
            let result = self.engine.sync.try_acquire(&mut self.wf, &holder, sync).await;
            self.note_sync_change(before);
            match result {
                Ok(acq) if acq.acquired => {}
                Ok(acq) => {
                    let node = self.init_node(&node_name, node_type_of(&tmpl), &tmpl.name, &opts.boundary_id);
                    let message = acq.waiting_message.unwrap_or_default();
                    self.update_node(&node.id, |n| n.message = message);
                    return self.snapshot(&node.id);
                }
                Err(SyncError::BadRequest(reason)) => {
                    return self.error_node(&node_name, &tmpl.name, &opts.boundary_id, reason)
                }
                Err(e) => return Err(e.into()),
            }
        }

        let node = match &tmpl.kind {
            TemplateKind::Task { payload } => {
                self.execute_task(&node_name, &tmpl, payload, inputs, &opts).await?
            }
            TemplateKind::Steps { groups } => {
                self.execute_steps(&node_name, &tmpl, groups, &ctx, &opts).await?
            }
            TemplateKind::Dag { tasks } => {
                self.execute_dag(&node_name, &tmpl, tasks, &ctx, &opts).await?
            }
        };

        if opts.retry_attempt {
            self.update_node(&node.id, |n| {
                n.node_flag.get_or_insert_with(Default::default).retried = true;
            });
        }
        if node.is_completed() {
            if let Some(sync) = &sync {
                let before = self.wf.status.synchronization.clone();
                self.engine.sync.release(&mut self.wf, &holder, sync);
                self.note_sync_change(before);
            }
        }
        self.snapshot(&node.id)
    }

    async fn resolve_template(
        &mut self,
        ctx: &TemplateContext,
        target: &TemplateTarget,
    ) -> EngineResult<(Template, TemplateContext)> {
        match target {
            TemplateTarget::Resolved(tmpl) => Ok(((**tmpl).clone(), ctx.clone())),
            TemplateTarget::Name(name) => {
                let found = match ctx {
                    TemplateContext::Workflow => self.wf.spec.get_template(name).cloned(),
                    TemplateContext::Stored(stored) => stored.get_template(name).cloned(),
                };
                found
                    .map(|t| (t, ctx.clone()))
                    .ok_or_else(|| EngineError::TemplateNotFound(name.clone()))
            }
            TemplateTarget::Ref(r) => {
                let stored = self.stored_template(r).await?;
                let tmpl = stored
                    .get_template(&r.template)
                    .cloned()
                    .ok_or_else(|| EngineError::TemplateNotFound(format!("{}/{}", r.name, r.template)))?;
                Ok((tmpl, TemplateContext::Stored(stored)))
            }
        }
    }

    async fn stored_template(&mut self, r: &TemplateRef) -> EngineResult<Arc<WorkflowTemplate>> {
        let cache_key = (self.wf.namespace().to_string(), r.name.clone(), r.cluster_scope);
        if let Some(found) = self.stored_templates.get(&cache_key) {
            return Ok(found.clone());
        }
        let fetched = self
            .engine
            .templates
            .get(self.wf.namespace(), &r.name, r.cluster_scope)
            .await?;
        let fetched = Arc::new(fetched);
        self.stored_templates.insert(cache_key, fetched.clone());
        Ok(fetched)
    }

    /// Bind arguments to the template's inputs and substitute them.
    fn process_inputs(
        &self,
        tmpl: &Template,
        args: &Arguments,
    ) -> EngineResult<(Template, Vec<Parameter>)> {
        let mut params = self.globals.clone();
        let mut inputs = Vec::with_capacity(tmpl.inputs.len());
        for input in &tmpl.inputs {
            let value = args
                .get_parameter(&input.name)
                .and_then(Parameter::effective_value)
                .or_else(|| input.effective_value())
                .ok_or_else(|| {
                    WorkflowError::ValidationError(format!(
                        "inputs.parameters.{} was not supplied",
                        input.name
                    ))
                })?;
            params.insert(format!("inputs.parameters.{}", input.name), value.to_string());
            inputs.push(Parameter::new(input.name.clone(), value));
        }
        let resolved = replace_json(tmpl, &params, true)?;
        Ok((resolved, inputs))
    }

    // ── Retries ──────────────────────────────────────────────────────

    async fn execute_retry(
        &mut self,
        node_name: String,
        tmpl: Template,
        ctx: TemplateContext,
        inputs: Vec<Parameter>,
        strategy: workflow_types::RetryStrategy,
        opts: ExecuteOpts,
    ) -> EngineResult<NodeStatus> {
        let parent = self.init_node(&node_name, NodeType::Retry, &tmpl.name, &opts.boundary_id);
        self.set_node_phase(&parent.id, NodePhase::Running, None);

        let attempts = parent.children.len();
        let last = parent.children.last().and_then(|id| self.node(id)).cloned();
        let next_attempt = match last {
            None => 0,
            Some(last) if !last.is_completed() => attempts - 1,
            Some(last) if last.phase.is_successful() => {
                self.complete_node(&parent.id, last.phase, String::new(), last.outputs.clone());
                return self.snapshot(&parent.id);
            }
            Some(last) => {
                let retryable = match strategy.retry_policy {
                    workflow_types::RetryPolicy::OnFailure => last.phase == NodePhase::Failed,
                    workflow_types::RetryPolicy::OnError => last.phase == NodePhase::Error,
                    workflow_types::RetryPolicy::Always => true,
                };
                if !retryable || attempts > strategy.limit as usize {
                    let message = if retryable {
                        format!("No more retries left ({}): {}", strategy.limit, last.message)
                    } else {
                        last.message.clone()
                    };
                    self.complete_node(&parent.id, last.phase, message, last.outputs.clone());
                    return self.snapshot(&parent.id);
                }
                if let (Some(backoff), Some(finished)) = (&strategy.backoff, last.finished_at) {
                    let delay = backoff.delay_for((attempts - 1) as u32);
                    let now = Utc::now();
                    // a deadline past the representable range is never reached
                    let ready = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|d| finished.checked_add_signed(d));
                    if ready.map_or(true, |ready| now < ready) {
                        let wait = ready
                            .and_then(|ready| (ready - now).to_std().ok())
                            .unwrap_or(delay);
                        debug!(node = %node_name, wait_ms = wait.as_millis() as u64, "Retry backoff");
                        self.update_node(&parent.id, |n| {
                            n.message = format!("Backoff for {}s", wait.as_secs())
                        });
                        self.requeue(wait);
                        return self.snapshot(&parent.id);
                    }
                }
                attempts
            }
        };

        let attempt_name = format!("{node_name}({next_attempt})");
        let args = Arguments {
            parameters: inputs,
            artifacts: Vec::new(),
        };
        let attempt_opts = ExecuteOpts {
            retry_attempt: true,
            ..opts
        };
        let attempt = self
            .execute_template(
                attempt_name,
                TemplateTarget::Resolved(Box::new(tmpl)),
                ctx,
                args,
                attempt_opts,
            )
            .await?;
        self.add_child(&parent.id, &attempt.id);

        if attempt.is_completed() {
            if attempt.phase.is_successful() {
                self.complete_node(&parent.id, attempt.phase, String::new(), attempt.outputs.clone());
            } else {
                // the next pass decides whether another attempt is due
                self.requeue(Duration::ZERO);
            }
        }
        self.snapshot(&parent.id)
    }

    // ── Tasks ────────────────────────────────────────────────────────

    async fn execute_task(
        &mut self,
        node_name: &str,
        tmpl: &Template,
        payload: &serde_json::Value,
        inputs: Vec<Parameter>,
        opts: &ExecuteOpts,
    ) -> EngineResult<NodeStatus> {
        let id = node_id(self.wf.name(), node_name);
        let key = self.wf.key();

        let submitted = self.node(&id).is_some_and(|n| n.phase != NodePhase::Pending);
        if !submitted {
            self.init_node(node_name, NodeType::Task, &tmpl.name, &opts.boundary_id);
            let task = TaskSubmission {
                workflow: key.clone(),
                node_id: id.clone(),
                node_name: node_name.to_string(),
                template_name: tmpl.name.clone(),
                payload: payload.clone(),
                inputs,
            };
            match self.engine.backend.submit(task).await {
                Ok(()) => {
                    self.update_node(&id, |n| n.message.clear());
                    self.set_node_phase(&id, NodePhase::Running, None);
                    self.requeue(self.engine.config.task_poll_interval);
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    self.set_node_phase(&id, NodePhase::Error, Some(e.to_string()));
                }
            }
            return self.snapshot(&id);
        }

        match self.engine.backend.observe(&key, &id).await? {
            TaskState::Pending | TaskState::Running => {
                self.set_node_phase(&id, NodePhase::Running, None);
                self.requeue(self.engine.config.task_poll_interval);
            }
            TaskState::Succeeded(outputs) => {
                let outputs = (!outputs.is_empty()).then_some(outputs);
                self.complete_node(&id, NodePhase::Succeeded, String::new(), outputs);
            }
            TaskState::Failed(message) => self.complete_node(&id, NodePhase::Failed, message, None),
            TaskState::Error(message) => self.complete_node(&id, NodePhase::Error, message, None),
        }
        self.snapshot(&id)
    }

    // ── Node bookkeeping ─────────────────────────────────────────────

    pub(crate) fn node(&self, id: &str) -> Option<&NodeStatus> {
        self.wf.status.nodes.get(id)
    }

    pub(crate) fn snapshot(&self, id: &str) -> EngineResult<NodeStatus> {
        self.node(id)
            .cloned()
            .ok_or_else(|| EngineError::NodeNotFound(id.to_string()))
    }

    /// Get or create a node; new nodes start `Pending`.
    pub(crate) fn init_node(
        &mut self,
        name: &str,
        node_type: NodeType,
        template_name: &str,
        boundary_id: &str,
    ) -> NodeStatus {
        let id = node_id(self.wf.name(), name);
        if let Some(node) = self.node(&id) {
            return node.clone();
        }
        let mut node = NodeStatus::new(id.clone(), name, node_type);
        node.template_name = template_name.to_string();
        node.boundary_id = boundary_id.to_string();
        debug!(key = %self.wf.key(), node = %name, id = %id, "Node initialized");
        self.wf.status.nodes.insert(id, node.clone());
        self.updated = true;
        node
    }

    /// Create the node if needed and mark it `Error`.
    pub(crate) fn error_node(
        &mut self,
        name: &str,
        template_name: &str,
        boundary_id: &str,
        message: String,
    ) -> EngineResult<NodeStatus> {
        warn!(key = %self.wf.key(), node = %name, error = %message, "Node errored");
        let node = self.init_node(name, NodeType::Task, template_name, boundary_id);
        self.set_node_phase(&node.id, NodePhase::Error, Some(message));
        self.snapshot(&node.id)
    }

    pub(crate) fn update_node(&mut self, id: &str, f: impl FnOnce(&mut NodeStatus)) {
        if let Some(node) = self.wf.status.nodes.get_mut(id) {
            let before = node.clone();
            f(node);
            if *node != before {
                self.updated = true;
            }
        }
    }

    /// Move a node to `phase` if the transition is allowed.
    pub(crate) fn set_node_phase(&mut self, id: &str, phase: NodePhase, message: Option<String>) {
        self.update_node(id, |node| {
            if node.phase == phase || !node.phase.can_transition_to(phase) {
                return;
            }
            node.phase = phase;
            if let Some(message) = message {
                node.message = message;
            }
            if phase.is_completed() && node.finished_at.is_none() {
                node.finished_at = Some(Utc::now());
            }
        });
    }

    pub(crate) fn complete_node(
        &mut self,
        id: &str,
        phase: NodePhase,
        message: String,
        outputs: Option<workflow_types::Outputs>,
    ) {
        self.update_node(id, |node| {
            if outputs.is_some() {
                node.outputs = outputs;
            }
        });
        self.set_node_phase(id, phase, Some(message));
        if let Some(node) = self.node(id) {
            info!(key = %self.wf.key(), node = %node.name, phase = ?node.phase, "Node completed");
        }
    }

    pub(crate) fn add_child(&mut self, parent_id: &str, child_id: &str) {
        self.update_node(parent_id, |parent| {
            if !parent.children.iter().any(|c| c == child_id) {
                parent.children.push(child_id.to_string());
            }
        });
    }
}
