//! Object identity: keys, metadata and the well-known labels the
//! controller reads and writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{WorkflowError, WorkflowResult};

// ── Well-known labels and finalizers ─────────────────────────────────

/// Set to `"true"` once a workflow has been finalized by the controller
pub const LABEL_COMPLETED: &str = "workflows.maple.io/completed";
/// Mirrors the workflow phase for label selectors
pub const LABEL_PHASE: &str = "workflows.maple.io/phase";
/// `Pending` while the workflow waits for the archive worker, then `Archived`
pub const LABEL_ARCHIVING_STATUS: &str = "workflows.maple.io/workflow-archiving-status";
/// Keeps a completed workflow reconcilable until artifact GC has run
pub const FINALIZER_ARTIFACT_GC: &str = "workflows.maple.io/artifact-gc";

// ── Workflow Key ─────────────────────────────────────────────────────

/// `namespace/name` key identifying a workflow in the cache and the queue
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowKey {
    pub namespace: String,
    pub name: String,
}

impl WorkflowKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `namespace/name` string.
    pub fn parse(key: &str) -> WorkflowResult<Self> {
        match key.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(WorkflowError::InvalidKey(key.to_string())),
        }
    }
}

impl std::fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for WorkflowKey {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── Object Metadata ──────────────────────────────────────────────────

/// Metadata shared by every object delivered through the change feed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    /// Stable identity across renames and re-creations
    #[serde(default)]
    pub uid: String,
    /// Changes on every write; used to drop no-op update notifications
    #[serde(default)]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uuid::Uuid::new_v4().to_string(),
            resource_version: "1".to_string(),
            labels: BTreeMap::new(),
            finalizers: Vec::new(),
            creation_timestamp: Utc::now(),
        }
    }

    pub fn key(&self) -> WorkflowKey {
        WorkflowKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.iter().any(|f| f == name)
    }

    /// Whether the controller still has work to do for this object.
    ///
    /// Completed workflows are left alone unless artifact GC still holds a
    /// finalizer on them.
    pub fn reconciliation_needed(&self) -> bool {
        self.label(LABEL_COMPLETED) != Some("true") || self.has_finalizer(FINALIZER_ARTIFACT_GC)
    }
}
