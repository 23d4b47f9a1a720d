//! Output scope for a steps or DAG template
//!
//! Completed children publish their status and outputs under a prefix such
//! as `steps.build` or `tasks.build`; later siblings reference them in
//! arguments, `when` guards and exit hooks.

use std::collections::BTreeMap;
use workflow_types::{Artifact, NodeStatus, Outputs};

use crate::substitute::Params;
use crate::{EngineError, EngineResult};

#[derive(Clone, Debug, Default)]
pub struct WfScope {
    params: Params,
    artifacts: BTreeMap<String, Artifact>,
}

impl WfScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn add_artifact(&mut self, key: impl Into<String>, artifact: Artifact) {
        self.artifacts.insert(key.into(), artifact);
    }

    /// Publish `outputs` under `<prefix>.outputs.*`.
    pub fn add_outputs(&mut self, prefix: &str, outputs: &Outputs) {
        for param in &outputs.parameters {
            if let Some(value) = param.effective_value() {
                self.add_param(format!("{prefix}.outputs.parameters.{}", param.name), value);
            }
        }
        if let Some(result) = &outputs.result {
            self.add_param(format!("{prefix}.outputs.result"), result.clone());
        }
        for artifact in &outputs.artifacts {
            self.add_artifact(
                format!("{prefix}.outputs.artifacts.{}", artifact.name),
                artifact.clone(),
            );
        }
    }

    /// Publish a completed child: id, status and outputs.
    pub fn add_node(&mut self, prefix: &str, node: &NodeStatus) {
        self.add_param(format!("{prefix}.id"), node.id.clone());
        self.add_param(format!("{prefix}.status"), format!("{:?}", node.phase));
        if let Some(outputs) = &node.outputs {
            self.add_outputs(prefix, outputs);
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Parameters of this scope layered over `base`.
    pub fn merged_with(&self, base: &Params) -> Params {
        let mut merged = base.clone();
        merged.extend(self.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Resolve an artifact reference (`{{steps.a.outputs.artifacts.x}}`
    /// or the bare key).
    pub fn resolve_artifact(&self, reference: &str) -> EngineResult<Artifact> {
        let key = reference
            .trim()
            .trim_start_matches("{{")
            .trim_end_matches("}}")
            .trim();
        self.artifacts
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::UnresolvedReference(reference.to_string()))
    }
}
