//! Storage trait definitions

use async_trait::async_trait;
use std::time::Duration;
use workflow_types::{ConfigMap, UnstructuredWorkflow, Workflow, WorkflowKey, WorkflowPhase};

use crate::error::StoreResult;

/// Secondary indexes kept over the workflow cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexName {
    /// Workflows in a namespace
    Namespace,
    /// The workflow with a given UID
    Uid,
    /// Workflows in a phase (`""` for unknown)
    Phase,
    /// Workflows with a semaphore backed by a config map (`namespace/name`)
    SemaphoreConfig,
}

/// Read side of the change feed: the locally cached objects
pub trait WorkflowCache: Send + Sync {
    /// Get a cached workflow by key
    fn get_by_key(&self, key: &WorkflowKey) -> Option<UnstructuredWorkflow>;

    /// Workflows whose index value under `index` equals `value`
    fn by_index(&self, index: IndexName, value: &str) -> Vec<UnstructuredWorkflow>;

    /// Every cached workflow
    fn list(&self) -> Vec<UnstructuredWorkflow>;
}

/// Write side: the authoritative object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List parsed workflows, optionally filtered by namespace and phase.
    /// Workflows that fail to parse are left out.
    async fn list_workflows(
        &self,
        namespace: Option<&str>,
        phase: Option<WorkflowPhase>,
    ) -> StoreResult<Vec<Workflow>>;

    /// Merge the workflow's labels, finalizers and status into the stored
    /// object. The stored spec is kept as is.
    async fn patch_workflow(&self, workflow: &Workflow) -> StoreResult<Workflow>;

    /// Get a config map
    async fn get_config_map(&self, namespace: &str, name: &str) -> StoreResult<ConfigMap>;
}

/// Long-term storage for completed workflows
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Store a completed workflow
    async fn archive(&self, workflow: &Workflow) -> StoreResult<()>;

    /// Delete archived workflows older than `ttl`. Returns how many went.
    async fn delete_expired(&self, ttl: Duration) -> StoreResult<usize>;
}
