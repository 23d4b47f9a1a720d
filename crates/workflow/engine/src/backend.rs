//! Collaborators the engine drives: the task backend that runs leaf work
//! and the getter for shared template resources.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use workflow_types::{node_id, Outputs, Parameter, WorkflowKey, WorkflowTemplate};

use crate::{EngineError, EngineResult};

// ── Task backend ─────────────────────────────────────────────────────

/// Leaf work handed to the backend
#[derive(Clone, Debug, PartialEq)]
pub struct TaskSubmission {
    pub workflow: WorkflowKey,
    pub node_id: String,
    pub node_name: String,
    pub template_name: String,
    /// Template payload after parameter substitution
    pub payload: serde_json::Value,
    pub inputs: Vec<Parameter>,
}

/// Observed state of a submitted task
#[derive(Clone, Debug, PartialEq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded(Outputs),
    Failed(String),
    Error(String),
}

/// Runs leaf tasks; the engine only submits and observes
#[async_trait]
pub trait TaskBackend: Send + Sync {
    async fn submit(&self, task: TaskSubmission) -> EngineResult<()>;

    async fn observe(&self, workflow: &WorkflowKey, node_id: &str) -> EngineResult<TaskState>;
}

/// In-memory backend used by tests and the development binary.
///
/// Tasks stay `Running` until a state is set for them, unless
/// auto-completion is enabled.
#[derive(Default)]
pub struct InMemoryTaskBackend {
    submissions: Mutex<Vec<TaskSubmission>>,
    states: Mutex<HashMap<(WorkflowKey, String), TaskState>>,
    auto_complete: bool,
}

impl InMemoryTaskBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks without an explicit state succeed as soon as they are observed.
    pub fn auto_completing() -> Self {
        Self {
            auto_complete: true,
            ..Self::default()
        }
    }

    pub fn set_state(&self, workflow: &WorkflowKey, node_name: &str, state: TaskState) {
        let id = node_id(&workflow.name, node_name);
        self.states.lock().insert((workflow.clone(), id), state);
    }

    pub fn submissions(&self) -> Vec<TaskSubmission> {
        self.submissions.lock().clone()
    }

    pub fn submitted_names(&self) -> Vec<String> {
        self.submissions
            .lock()
            .iter()
            .map(|s| s.node_name.clone())
            .collect()
    }
}

#[async_trait]
impl TaskBackend for InMemoryTaskBackend {
    async fn submit(&self, task: TaskSubmission) -> EngineResult<()> {
        tracing::debug!(node = %task.node_name, "Task submitted");
        self.submissions.lock().push(task);
        Ok(())
    }

    async fn observe(&self, workflow: &WorkflowKey, node_id: &str) -> EngineResult<TaskState> {
        let state = self
            .states
            .lock()
            .get(&(workflow.clone(), node_id.to_string()))
            .cloned();
        Ok(match state {
            Some(state) => state,
            None if self.auto_complete => TaskState::Succeeded(Outputs::default()),
            None => TaskState::Running,
        })
    }
}

// ── Template resources ───────────────────────────────────────────────

/// Looks up shared template resources referenced through `TemplateRef`
#[async_trait]
pub trait TemplateGetter: Send + Sync {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
        cluster_scope: bool,
    ) -> EngineResult<WorkflowTemplate>;
}

/// Template resources held in memory, keyed by namespace and name.
/// Cluster-scoped resources live under the empty namespace.
#[derive(Default)]
pub struct StaticTemplates {
    templates: DashMap<(String, String), WorkflowTemplate>,
}

impl StaticTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, template: WorkflowTemplate) {
        let namespace = if template.cluster_scope {
            String::new()
        } else {
            template.metadata.namespace.clone()
        };
        self.templates
            .insert((namespace, template.metadata.name.clone()), template);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.templates
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[async_trait]
impl TemplateGetter for StaticTemplates {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
        cluster_scope: bool,
    ) -> EngineResult<WorkflowTemplate> {
        let namespace = if cluster_scope { "" } else { namespace };
        self.templates
            .get(&(namespace.to_string(), name.to_string()))
            .map(|t| t.value().clone())
            .ok_or_else(|| EngineError::TemplateNotFound(format!("{namespace}/{name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::{ObjectMeta, Template};

    #[tokio::test]
    async fn test_in_memory_backend_reports_set_state() {
        let backend = InMemoryTaskBackend::new();
        let key = WorkflowKey::new("ns", "wf");
        let id = node_id("wf", "wf.a");
        assert_eq!(backend.observe(&key, &id).await.unwrap(), TaskState::Running);

        backend.set_state(&key, "wf.a", TaskState::Failed("boom".into()));
        assert_eq!(
            backend.observe(&key, &id).await.unwrap(),
            TaskState::Failed("boom".into())
        );
    }

    #[tokio::test]
    async fn test_static_templates_scope() {
        let templates = StaticTemplates::new();
        templates.insert(WorkflowTemplate {
            metadata: ObjectMeta::new("ns", "shared"),
            templates: vec![Template::task("echo")],
            cluster_scope: false,
        });
        templates.insert(WorkflowTemplate {
            metadata: ObjectMeta::new("", "global"),
            templates: vec![Template::task("echo")],
            cluster_scope: true,
        });

        assert!(templates.get("ns", "shared", false).await.is_ok());
        assert!(templates.get("other", "shared", false).await.is_err());
        assert!(templates.get("other", "global", true).await.is_ok());
    }
}
