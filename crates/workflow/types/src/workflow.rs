//! Workflow resources and the other object kinds the controller watches

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    Arguments, LifecycleHook, ObjectMeta, Synchronization, Template, WorkflowError, WorkflowKey,
    WorkflowPhase, WorkflowResult, WorkflowStatus, EXIT_HOOK, LABEL_COMPLETED, LABEL_PHASE,
};

// ── Shutdown ─────────────────────────────────────────────────────────

/// Requested early shutdown of a running workflow
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownStrategy {
    /// Stop immediately; exit handlers do not run
    Terminate,
    /// Schedule no new work but let exit handlers run
    Stop,
}

impl ShutdownStrategy {
    /// Whether a node may still be started under this strategy.
    pub fn should_execute(strategy: Option<Self>, is_on_exit: bool) -> bool {
        match strategy {
            None => true,
            Some(Self::Terminate) => false,
            Some(Self::Stop) => is_on_exit,
        }
    }
}

// ── Workflow Spec ────────────────────────────────────────────────────

/// Desired state of a workflow
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub entrypoint: String,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,
    /// Template run once the entrypoint completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<String, LifecycleHook>,
    /// Admission priority; higher runs first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<Synchronization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ShutdownStrategy>,
}

impl WorkflowSpec {
    pub fn new(entrypoint: impl Into<String>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            ..Default::default()
        }
    }

    pub fn with_template(mut self, template: Template) -> Self {
        self.templates.push(template);
        self
    }

    pub fn get_template(&self, name: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// The workflow-level exit hook: `hooks.exit` wins over `on_exit`.
    pub fn exit_hook(&self) -> Option<LifecycleHook> {
        if let Some(hook) = self.hooks.get(EXIT_HOOK) {
            return Some(hook.clone());
        }
        self.on_exit.as_ref().map(LifecycleHook::template)
    }
}

// ── Workflow ─────────────────────────────────────────────────────────

/// A submitted workflow: spec plus observed status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub metadata: ObjectMeta,
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Workflow {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: WorkflowSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: WorkflowStatus::default(),
        }
    }

    pub fn key(&self) -> WorkflowKey {
        self.metadata.key()
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority.unwrap_or(0)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.spec.priority = Some(priority);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status.phase.is_completed()
    }

    pub fn reconciliation_needed(&self) -> bool {
        self.metadata.reconciliation_needed()
    }

    /// Set the phase and keep the phase label in sync.
    pub fn set_phase(&mut self, phase: WorkflowPhase) {
        self.status.phase = phase;
        self.metadata
            .labels
            .insert(LABEL_PHASE.to_string(), phase.as_str().to_string());
    }

    pub fn mark_completed_label(&mut self) {
        self.metadata
            .labels
            .insert(LABEL_COMPLETED.to_string(), "true".to_string());
    }

    pub fn is_terminating(&self) -> bool {
        self.spec.shutdown == Some(ShutdownStrategy::Terminate)
    }

    /// Convert to the untyped form the change feed carries.
    pub fn to_unstructured(&self) -> WorkflowResult<UnstructuredWorkflow> {
        let body = serde_json::to_value(self)
            .map_err(|e| WorkflowError::Serialization(e.to_string()))?;
        Ok(UnstructuredWorkflow {
            metadata: self.metadata.clone(),
            body,
        })
    }
}

/// A workflow as delivered by the change feed, before parsing.
///
/// The metadata is always readable; the body may fail to parse when a
/// user submitted a malformed manifest.
#[derive(Clone, Debug, PartialEq)]
pub struct UnstructuredWorkflow {
    pub metadata: ObjectMeta,
    pub body: serde_json::Value,
}

impl UnstructuredWorkflow {
    pub fn key(&self) -> WorkflowKey {
        self.metadata.key()
    }

    /// Parse into a typed workflow.
    pub fn to_workflow(&self) -> WorkflowResult<Workflow> {
        let mut wf: Workflow = serde_json::from_value(self.body.clone())
            .map_err(|e| WorkflowError::Unmarshal(e.to_string()))?;
        wf.metadata = self.metadata.clone();
        Ok(wf)
    }

    /// A workflow carrying only the readable metadata, used to report
    /// parse failures on the object itself.
    pub fn skeleton(&self) -> Workflow {
        Workflow {
            metadata: self.metadata.clone(),
            spec: WorkflowSpec::default(),
            status: WorkflowStatus::default(),
        }
    }

    pub fn phase(&self) -> WorkflowPhase {
        self.body
            .get("status")
            .and_then(|s| s.get("phase"))
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default()
    }

    pub fn priority(&self) -> i32 {
        self.body
            .get("spec")
            .and_then(|s| s.get("priority"))
            .and_then(serde_json::Value::as_i64)
            .map(|p| p as i32)
            .unwrap_or(0)
    }

    /// Config maps (`namespace/name`) referenced by semaphores anywhere in
    /// the workflow, used to build the semaphore-config index.
    pub fn semaphore_config_refs(&self) -> Vec<String> {
        let Ok(wf) = self.to_workflow() else {
            return Vec::new();
        };
        let namespace = wf.namespace().to_string();
        let mut refs: Vec<String> = wf
            .spec
            .synchronization
            .iter()
            .chain(wf.spec.templates.iter().filter_map(|t| t.synchronization.as_ref()))
            .flat_map(|s| s.semaphores.iter())
            .map(|s| {
                format!(
                    "{}/{}",
                    s.namespace.as_deref().unwrap_or(&namespace),
                    s.config_map
                )
            })
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }
}

// ── Supporting objects ───────────────────────────────────────────────

/// Key/value configuration object; holds semaphore limits
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ConfigMap {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            data: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// A reusable set of templates referenced through `TemplateRef`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub templates: Vec<Template>,
    /// Cluster-scoped templates are visible from every namespace
    #[serde(default)]
    pub cluster_scope: bool,
}

impl WorkflowTemplate {
    pub fn get_template(&self, name: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.name == name)
    }
}

// ── Watch events ─────────────────────────────────────────────────────

/// Every object kind the change feed delivers
#[derive(Clone, Debug, PartialEq)]
pub enum WatchedObject {
    Workflow(UnstructuredWorkflow),
    WorkflowTemplate(WorkflowTemplate),
    ConfigMap(ConfigMap),
}

impl WatchedObject {
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Workflow(wf) => &wf.metadata,
            Self::WorkflowTemplate(t) => &t.metadata,
            Self::ConfigMap(cm) => &cm.metadata,
        }
    }
}

/// A change notification
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    Added(WatchedObject),
    Updated {
        old: WatchedObject,
        new: WatchedObject,
    },
    Deleted(WatchedObject),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SemaphoreRef;

    fn make_workflow() -> Workflow {
        let spec = WorkflowSpec::new("main").with_template(Template::task("main"));
        Workflow::new("ns", "wf", spec).with_priority(3)
    }

    #[test]
    fn test_unstructured_round_trip() {
        let wf = make_workflow();
        let un = wf.to_unstructured().unwrap();
        assert_eq!(un.priority(), 3);
        assert_eq!(un.phase(), WorkflowPhase::Unknown);
        assert_eq!(un.to_workflow().unwrap(), wf);
    }

    #[test]
    fn test_unmarshal_failure_is_reported() {
        let un = UnstructuredWorkflow {
            metadata: ObjectMeta::new("ns", "broken"),
            body: serde_json::json!({ "spec": { "entrypoint": 42 } }),
        };
        assert!(matches!(un.to_workflow(), Err(WorkflowError::Unmarshal(_))));
        assert_eq!(un.skeleton().key(), WorkflowKey::new("ns", "broken"));
    }

    #[test]
    fn test_exit_hook_prefers_hooks_map() {
        let mut spec = WorkflowSpec::new("main");
        spec.on_exit = Some("cleanup".into());
        assert_eq!(spec.exit_hook().unwrap().template.as_deref(), Some("cleanup"));

        spec.hooks
            .insert(EXIT_HOOK.into(), LifecycleHook::template("notify"));
        assert_eq!(spec.exit_hook().unwrap().template.as_deref(), Some("notify"));
    }

    #[test]
    fn test_semaphore_config_refs() {
        let mut wf = make_workflow();
        wf.spec.synchronization = Some(Synchronization {
            semaphores: vec![SemaphoreRef {
                namespace: None,
                config_map: "limits".into(),
                key: "workflow".into(),
            }],
            mutexes: vec![],
        });
        let un = wf.to_unstructured().unwrap();
        assert_eq!(un.semaphore_config_refs(), vec!["ns/limits".to_string()]);
    }

    #[test]
    fn test_shutdown_gate() {
        assert!(ShutdownStrategy::should_execute(None, false));
        assert!(!ShutdownStrategy::should_execute(
            Some(ShutdownStrategy::Terminate),
            true
        ));
        assert!(ShutdownStrategy::should_execute(Some(ShutdownStrategy::Stop), true));
        assert!(!ShutdownStrategy::should_execute(
            Some(ShutdownStrategy::Stop),
            false
        ));
    }
}
