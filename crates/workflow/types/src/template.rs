//! Templates: the named, reusable units a workflow graph is built from
//!
//! A template is either a leaf task (handed to the task backend), a list of
//! sequential step groups, or a DAG of tasks. Steps and DAG tasks invoke
//! other templates by name or through a reference to a template resource.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Parameters & Artifacts ───────────────────────────────────────────

/// A named string parameter
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            default: None,
        }
    }

    /// The effective value: explicit value, else the default.
    pub fn effective_value(&self) -> Option<&str> {
        self.value.as_deref().or(self.default.as_deref())
    }
}

/// A named artifact, either already located or referencing another
/// node's output through `from` / `from_expression`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    /// Reference such as `{{steps.produce.outputs.artifacts.result}}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_expression: Option<String>,
    /// Storage location once resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Unresolvable optional artifacts are dropped instead of failing
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl Artifact {
    pub fn located(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: Some(location.into()),
            ..Default::default()
        }
    }

    pub fn from_ref(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from: Some(reference.into()),
            ..Default::default()
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn is_reference(&self) -> bool {
        self.from.as_deref().is_some_and(|f| !f.is_empty())
            || self.from_expression.as_deref().is_some_and(|f| !f.is_empty())
    }
}

/// Arguments passed to a template invocation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arguments {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl Arguments {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.artifacts.is_empty()
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn get_parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Outputs produced by a node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outputs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl Outputs {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.artifacts.is_empty() && self.result.is_none()
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

// ── Synchronization ──────────────────────────────────────────────────

/// Reference to a key in a config map holding a semaphore limit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemaphoreRef {
    /// Namespace of the config map; defaults to the workflow's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub config_map: String,
    pub key: String,
}

/// Reference to a named mutex
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

/// Locks a workflow or template must hold before it runs
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synchronization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub semaphores: Vec<SemaphoreRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutexes: Vec<MutexRef>,
}

impl Synchronization {
    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty() && self.mutexes.is_empty()
    }

    pub fn semaphore(
        namespace: Option<&str>,
        config_map: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            semaphores: vec![SemaphoreRef {
                namespace: namespace.map(str::to_string),
                config_map: config_map.into(),
                key: key.into(),
            }],
            mutexes: Vec::new(),
        }
    }

    pub fn mutex(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            semaphores: Vec::new(),
            mutexes: vec![MutexRef {
                namespace: namespace.map(str::to_string),
                name: name.into(),
            }],
        }
    }
}

// ── Retry ────────────────────────────────────────────────────────────

/// Upper bound for any retry delay, whatever the configured backoff.
pub const MAX_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_secs(365 * 24 * 3600);

/// Delay between retry attempts
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryBackoff {
    /// Base delay in seconds
    pub duration_secs: u64,
    /// Multiplier applied per attempt (1 when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
}

impl RetryBackoff {
    /// Delay required after the `attempt`-th failure (0-based).
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = u64::from(self.factor.unwrap_or(1).max(1));
        let mut secs = self.duration_secs;
        for _ in 0..attempt {
            secs = secs.saturating_mul(factor);
        }
        if let Some(max) = self.max_duration_secs {
            secs = secs.min(max);
        }
        std::time::Duration::from_secs(secs).min(MAX_RETRY_BACKOFF)
    }
}

/// When a failed attempt is retried
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    #[default]
    OnFailure,
    OnError,
    Always,
}

/// Bounded retry policy for a template
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    /// Maximum number of retries after the first attempt
    pub limit: u32,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<RetryBackoff>,
}

impl RetryStrategy {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

// ── Invocation ───────────────────────────────────────────────────────

/// Reference to a template defined in a separate template resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    /// Name of the template resource
    pub name: String,
    /// Template inside that resource
    pub template: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cluster_scope: bool,
}

/// A hook invoked when a scope completes
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleHook {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<TemplateRef>,
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,
    /// Guard evaluated against the merged parameter scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl LifecycleHook {
    pub fn template(name: impl Into<String>) -> Self {
        Self {
            template: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }
}

/// Name of the hook that runs when its scope exits
pub const EXIT_HOOK: &str = "exit";

/// One invocation inside a steps template
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<TemplateRef>,
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,
    /// Step runs only when this evaluates to true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<String, LifecycleHook>,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: Some(template.into()),
            ..Default::default()
        }
    }

    pub fn with_template_ref(name: impl Into<String>, template_ref: TemplateRef) -> Self {
        Self {
            name: name.into(),
            template_ref: Some(template_ref),
            ..Default::default()
        }
    }

    pub fn with_arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_when(mut self, when: impl Into<String>) -> Self {
        self.when = Some(when.into());
        self
    }

    pub fn with_exit_hook(mut self, hook: LifecycleHook) -> Self {
        self.hooks.insert(EXIT_HOOK.to_string(), hook);
        self
    }

    pub fn exit_hook(&self) -> Option<&LifecycleHook> {
        self.hooks.get(EXIT_HOOK)
    }

    /// Invocation target name used for logging and messages
    pub fn target_name(&self) -> String {
        match (&self.template, &self.template_ref) {
            (Some(t), _) => t.clone(),
            (None, Some(r)) => format!("{}/{}", r.name, r.template),
            (None, None) => String::new(),
        }
    }
}

/// One task inside a DAG template
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagTask {
    #[serde(flatten)]
    pub step: WorkflowStep,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl DagTask {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            step: WorkflowStep::new(name, template),
            dependencies: Vec::new(),
        }
    }

    pub fn depends_on(mut self, task: impl Into<String>) -> Self {
        self.dependencies.push(task.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.step.name
    }
}

// ── Template ─────────────────────────────────────────────────────────

/// What a template does when invoked
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TemplateKind {
    /// Leaf work executed by the task backend; the payload is opaque here
    Task {
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// Sequential groups; steps inside a group run in parallel
    Steps { groups: Vec<Vec<WorkflowStep>> },
    /// Tasks ordered by their dependencies
    Dag { tasks: Vec<DagTask> },
}

/// A named unit of work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    #[serde(flatten)]
    pub kind: TemplateKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<Synchronization>,
}

impl Template {
    pub fn task(name: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            TemplateKind::Task {
                payload: serde_json::Value::Null,
            },
        )
    }

    pub fn steps(name: impl Into<String>, groups: Vec<Vec<WorkflowStep>>) -> Self {
        Self::with_kind(name, TemplateKind::Steps { groups })
    }

    pub fn dag(name: impl Into<String>, tasks: Vec<DagTask>) -> Self {
        Self::with_kind(name, TemplateKind::Dag { tasks })
    }

    fn with_kind(name: impl Into<String>, kind: TemplateKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            retry_strategy: None,
            synchronization: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        if let TemplateKind::Task { payload: p } = &mut self.kind {
            *p = payload;
        }
        self
    }

    pub fn with_retry(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn with_synchronization(mut self, sync: Synchronization) -> Self {
        self.synchronization = Some(sync);
        self
    }

    pub fn with_input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(Parameter {
            name: name.into(),
            value: None,
            default: None,
        });
        self
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, TemplateKind::Task { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_growth_is_capped() {
        let backoff = RetryBackoff {
            duration_secs: 2,
            factor: Some(3),
            max_duration_secs: Some(30),
        };
        assert_eq!(backoff.delay_for(0).as_secs(), 2);
        assert_eq!(backoff.delay_for(1).as_secs(), 6);
        assert_eq!(backoff.delay_for(2).as_secs(), 18);
        assert_eq!(backoff.delay_for(3).as_secs(), 30);
    }

    #[test]
    fn test_retry_backoff_never_exceeds_hard_cap() {
        let backoff = RetryBackoff {
            duration_secs: 10_000_000_000_000,
            factor: Some(2),
            max_duration_secs: None,
        };
        assert_eq!(backoff.delay_for(0), MAX_RETRY_BACKOFF);
        assert_eq!(backoff.delay_for(40), MAX_RETRY_BACKOFF);
    }

    #[test]
    fn test_template_serde_uses_kind_tag() {
        let tmpl = Template::steps(
            "main",
            vec![vec![WorkflowStep::new("a", "leaf")]],
        );
        let json = serde_json::to_value(&tmpl).unwrap();
        assert_eq!(json["kind"], "steps");
        let back: Template = serde_json::from_value(json).unwrap();
        assert_eq!(back, tmpl);
    }

    #[test]
    fn test_artifact_reference_detection() {
        assert!(Artifact::from_ref("a", "{{steps.x.outputs.artifacts.a}}").is_reference());
        assert!(!Artifact::located("a", "s3://bucket/a").is_reference());
    }
}
