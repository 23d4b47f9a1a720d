//! Observed state: workflow phase, per-node status and lock bookkeeping
//!
//! The node map is the large part of a workflow's status. It is keyed by a
//! deterministic node ID so the same logical node always lands on the same
//! entry, and it is a `BTreeMap` so its serialized form is stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::Outputs;

// ── Phases ───────────────────────────────────────────────────────────

/// Overall phase of a workflow
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WorkflowPhase {
    /// Not yet seen by the controller
    #[default]
    #[serde(rename = "")]
    Unknown,
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
}

impl WorkflowPhase {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "",
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Error => "Error",
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of a single node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NodePhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Skipped,
    Failed,
    Error,
}

impl NodePhase {
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Skipped | Self::Failed | Self::Error
        )
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            _ => 2,
        }
    }

    /// Phases only move forward; a completed node never changes phase.
    pub fn can_transition_to(&self, next: NodePhase) -> bool {
        if self.is_completed() {
            return *self == next;
        }
        next.rank() >= self.rank()
    }
}

impl From<NodePhase> for WorkflowPhase {
    fn from(phase: NodePhase) -> Self {
        match phase {
            NodePhase::Pending => WorkflowPhase::Pending,
            NodePhase::Running => WorkflowPhase::Running,
            NodePhase::Succeeded | NodePhase::Skipped => WorkflowPhase::Succeeded,
            NodePhase::Failed => WorkflowPhase::Failed,
            NodePhase::Error => WorkflowPhase::Error,
        }
    }
}

// ── Node Status ──────────────────────────────────────────────────────

/// What kind of graph vertex a node is
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Task,
    Steps,
    StepGroup,
    Dag,
    Retry,
}

/// Markers describing how a node came to exist
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlag {
    /// Created by a lifecycle hook
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hooked: bool,
    /// An attempt under a retry node
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retried: bool,
}

/// Status of one vertex of the execution DAG
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: String,
    /// Fully qualified name, e.g. `wf[0].build.onExit`
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_name: String,
    pub phase: NodePhase,
    /// ID of the enclosing steps/DAG node
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub boundary_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_flag: Option<NodeFlag>,
}

impl NodeStatus {
    pub fn new(id: impl Into<String>, name: impl Into<String>, node_type: NodeType) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            display_name: display_name_of(&name),
            name,
            node_type,
            template_name: String::new(),
            phase: NodePhase::Pending,
            boundary_id: String::new(),
            children: Vec::new(),
            outputs: None,
            message: String::new(),
            started_at: Some(Utc::now()),
            finished_at: None,
            node_flag: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.phase.is_completed()
    }

    pub fn is_hooked(&self) -> bool {
        self.node_flag.is_some_and(|f| f.hooked)
    }
}

fn display_name_of(name: &str) -> String {
    name.rsplit('.').next().unwrap_or(name).to_string()
}

/// Node map keyed by node ID
pub type Nodes = BTreeMap<String, NodeStatus>;

/// Deterministic node ID for a node name.
///
/// The root node uses the workflow name itself; every other node gets the
/// workflow name plus a short content hash of its fully qualified name.
pub fn node_id(workflow_name: &str, node_name: &str) -> String {
    if workflow_name == node_name {
        return workflow_name.to_string();
    }
    let hash = blake3::hash(node_name.as_bytes());
    format!("{}-{}", workflow_name, &hash.to_hex()[..10])
}

// ── Synchronization Status ───────────────────────────────────────────

/// Locks a workflow holds or waits for, keyed by encoded lock name
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizationStatus {
    /// lock name → holder IDs currently holding it
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub holding: BTreeMap<String, BTreeSet<String>>,
    /// lock name → holder IDs queued on it
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub waiting: BTreeMap<String, BTreeSet<String>>,
}

impl SynchronizationStatus {
    pub fn is_empty(&self) -> bool {
        self.holding.is_empty() && self.waiting.is_empty()
    }

    pub fn record_held(&mut self, lock: &str, holder: &str) {
        remove_entry(&mut self.waiting, lock, holder);
        self.holding
            .entry(lock.to_string())
            .or_default()
            .insert(holder.to_string());
    }

    pub fn record_waiting(&mut self, lock: &str, holder: &str) {
        self.waiting
            .entry(lock.to_string())
            .or_default()
            .insert(holder.to_string());
    }

    pub fn record_released(&mut self, lock: &str, holder: &str) {
        remove_entry(&mut self.holding, lock, holder);
        remove_entry(&mut self.waiting, lock, holder);
    }

    pub fn is_holding(&self, lock: &str, holder: &str) -> bool {
        self.holding
            .get(lock)
            .is_some_and(|holders| holders.contains(holder))
    }
}

fn remove_entry(map: &mut BTreeMap<String, BTreeSet<String>>, lock: &str, holder: &str) {
    if let Some(holders) = map.get_mut(lock) {
        holders.remove(holder);
        if holders.is_empty() {
            map.remove(lock);
        }
    }
}

// ── Workflow Status ──────────────────────────────────────────────────

/// Mutable status of a workflow
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default)]
    pub phase: WorkflowPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: Nodes,
    /// Set when `nodes` lives in the offload store under this version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload_node_status_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<SynchronizationStatus>,
}

impl WorkflowStatus {
    pub fn is_offloaded(&self) -> bool {
        self.offload_node_status_version
            .as_deref()
            .is_some_and(|v| !v.is_empty())
    }

    pub fn node_by_name(&self, name: &str) -> Option<&NodeStatus> {
        self.nodes.values().find(|n| n.name == name)
    }

    pub fn synchronization_mut(&mut self) -> &mut SynchronizationStatus {
        self.synchronization.get_or_insert_with(Default::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_phase_moves_forward_only() {
        assert!(NodePhase::Pending.can_transition_to(NodePhase::Running));
        assert!(NodePhase::Running.can_transition_to(NodePhase::Failed));
        assert!(NodePhase::Pending.can_transition_to(NodePhase::Succeeded));
        assert!(!NodePhase::Running.can_transition_to(NodePhase::Pending));
        assert!(!NodePhase::Succeeded.can_transition_to(NodePhase::Running));
        assert!(!NodePhase::Failed.can_transition_to(NodePhase::Succeeded));
    }

    #[test]
    fn test_node_id_is_stable() {
        assert_eq!(node_id("wf", "wf"), "wf");
        let a = node_id("wf", "wf[0].build");
        assert_eq!(a, node_id("wf", "wf[0].build"));
        assert_ne!(a, node_id("wf", "wf[0].test"));
        assert!(a.starts_with("wf-"));
    }

    #[test]
    fn test_display_name_uses_last_segment() {
        let node = NodeStatus::new("id", "wf[0].build.onExit", NodeType::Task);
        assert_eq!(node.display_name, "onExit");
    }

    #[test]
    fn test_synchronization_bookkeeping() {
        let mut sync = SynchronizationStatus::default();
        sync.record_waiting("ns/Mutex/m", "ns/wf");
        assert!(!sync.is_holding("ns/Mutex/m", "ns/wf"));

        sync.record_held("ns/Mutex/m", "ns/wf");
        assert!(sync.is_holding("ns/Mutex/m", "ns/wf"));
        assert!(sync.waiting.is_empty());

        sync.record_released("ns/Mutex/m", "ns/wf");
        sync.record_released("ns/Mutex/m", "ns/wf");
        assert!(sync.is_empty());
    }

    #[test]
    fn test_unknown_phase_serializes_empty() {
        let json = serde_json::to_string(&WorkflowPhase::Unknown).unwrap();
        assert_eq!(json, "\"\"");
    }
}
