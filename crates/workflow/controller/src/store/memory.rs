//! In-memory cluster for development and testing
//!
//! Holds workflows, config maps, template resources and the archive in
//! `DashMap`s and publishes a [`WatchEvent`] for every write, standing in
//! for both the object store and the change feed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use workflow_engine::{EngineResult, StaticTemplates, TemplateGetter};
use workflow_sync::WorkflowExistence;
use workflow_types::{
    ConfigMap, UnstructuredWorkflow, WatchEvent, WatchedObject, Workflow, WorkflowKey,
    WorkflowPhase, WorkflowTemplate,
};

use super::traits::{ArchiveStore, IndexName, ObjectStore, WorkflowCache};
use crate::error::{StoreError, StoreResult};

/// In-memory stand-in for the cluster API
pub struct InMemoryCluster {
    workflows: DashMap<WorkflowKey, UnstructuredWorkflow>,
    config_maps: DashMap<(String, String), ConfigMap>,
    templates: StaticTemplates,
    archive: DashMap<String, (Workflow, DateTime<Utc>)>,
    resource_version: AtomicU64,
    unavailable: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<WatchEvent>>>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            workflows: DashMap::new(),
            config_maps: DashMap::new(),
            templates: StaticTemplates::new(),
            archive: DashMap::new(),
            resource_version: AtomicU64::new(1),
            unavailable: AtomicBool::new(false),
            events: Mutex::new(None),
        }
    }

    /// Start receiving change notifications. Replaces any earlier subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        rx
    }

    /// Make writes and config map reads fail with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("cluster API unavailable".to_string()));
        }
        Ok(())
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, event: WatchEvent) {
        let events = self.events.lock();
        if let Some(tx) = events.as_ref() {
            // A dropped receiver just means nobody is watching.
            let _ = tx.send(event);
        }
    }

    // ── Workflows ────────────────────────────────────────────────────

    /// Submit a workflow.
    pub fn create_workflow(&self, workflow: &Workflow) -> StoreResult<UnstructuredWorkflow> {
        let mut un = workflow
            .to_unstructured()
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        self.create_unstructured(&mut un)?;
        Ok(un)
    }

    /// Submit a raw workflow object, which may not parse.
    pub fn create_unstructured(&self, un: &mut UnstructuredWorkflow) -> StoreResult<()> {
        let key = un.key();
        if self.workflows.contains_key(&key) {
            return Err(StoreError::Conflict(format!("workflow {key} already exists")));
        }
        if un.metadata.uid.is_empty() {
            un.metadata.uid = uuid::Uuid::new_v4().to_string();
        }
        un.metadata.resource_version = self.next_version();
        sync_body_metadata(un)?;
        self.workflows.insert(key.clone(), un.clone());
        debug!(key = %key, "Workflow created");
        self.publish(WatchEvent::Added(WatchedObject::Workflow(un.clone())));
        Ok(())
    }

    pub fn delete_workflow(&self, key: &WorkflowKey) -> StoreResult<()> {
        let (_, un) = self
            .workflows
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(format!("workflow {key}")))?;
        debug!(key = %key, "Workflow deleted");
        self.publish(WatchEvent::Deleted(WatchedObject::Workflow(un)));
        Ok(())
    }

    /// Parsed copy of a stored workflow.
    pub fn workflow(&self, key: &WorkflowKey) -> Option<Workflow> {
        self.workflows.get(key).and_then(|un| un.to_workflow().ok())
    }

    // ── Config maps and templates ────────────────────────────────────

    pub fn upsert_config_map(&self, mut config_map: ConfigMap) {
        config_map.metadata.resource_version = self.next_version();
        let id = (
            config_map.metadata.namespace.clone(),
            config_map.metadata.name.clone(),
        );
        let old = self.config_maps.insert(id, config_map.clone());
        let new = WatchedObject::ConfigMap(config_map);
        self.publish(match old {
            Some(old) => WatchEvent::Updated {
                old: WatchedObject::ConfigMap(old),
                new,
            },
            None => WatchEvent::Added(new),
        });
    }

    pub fn insert_template(&self, template: WorkflowTemplate) {
        self.templates.insert(template.clone());
        self.publish(WatchEvent::Added(WatchedObject::WorkflowTemplate(template)));
    }

    // ── Archive ──────────────────────────────────────────────────────

    /// Archived workflows, oldest first.
    pub fn archived(&self) -> Vec<Workflow> {
        let mut entries: Vec<(Workflow, DateTime<Utc>)> =
            self.archive.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|(_, at)| *at);
        entries.into_iter().map(|(wf, _)| wf).collect()
    }
}

/// Keep the metadata inside the body in step with the object metadata.
fn sync_body_metadata(un: &mut UnstructuredWorkflow) -> StoreResult<()> {
    let metadata =
        serde_json::to_value(&un.metadata).map_err(|e| StoreError::InvalidData(e.to_string()))?;
    match un.body.as_object_mut() {
        Some(body) => {
            body.insert("metadata".to_string(), metadata);
            Ok(())
        }
        None => Err(StoreError::InvalidData(format!(
            "workflow {} body is not an object",
            un.key()
        ))),
    }
}

impl WorkflowCache for InMemoryCluster {
    fn get_by_key(&self, key: &WorkflowKey) -> Option<UnstructuredWorkflow> {
        self.workflows.get(key).map(|un| un.value().clone())
    }

    fn by_index(&self, index: IndexName, value: &str) -> Vec<UnstructuredWorkflow> {
        self.workflows
            .iter()
            .filter(|un| match index {
                IndexName::Namespace => un.metadata.namespace == value,
                IndexName::Uid => un.metadata.uid == value,
                IndexName::Phase => un.phase().as_str() == value,
                IndexName::SemaphoreConfig => {
                    un.semaphore_config_refs().iter().any(|r| r == value)
                }
            })
            .map(|un| un.value().clone())
            .collect()
    }

    fn list(&self) -> Vec<UnstructuredWorkflow> {
        self.workflows.iter().map(|un| un.value().clone()).collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryCluster {
    async fn list_workflows(
        &self,
        namespace: Option<&str>,
        phase: Option<WorkflowPhase>,
    ) -> StoreResult<Vec<Workflow>> {
        Ok(self
            .workflows
            .iter()
            .filter(|un| namespace.map_or(true, |ns| un.metadata.namespace == ns))
            .filter_map(|un| un.to_workflow().ok())
            .filter(|wf| phase.map_or(true, |p| wf.status.phase == p))
            .collect())
    }

    async fn patch_workflow(&self, workflow: &Workflow) -> StoreResult<Workflow> {
        self.check_available()?;
        let key = workflow.key();
        let status = serde_json::to_value(&workflow.status)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        let (old, new) = {
            let mut entry = self
                .workflows
                .get_mut(&key)
                .ok_or_else(|| StoreError::NotFound(format!("workflow {key}")))?;
            let old = entry.value().clone();
            let stored = entry.value_mut();
            stored.metadata.labels.extend(
                workflow
                    .metadata
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            stored.metadata.finalizers = workflow.metadata.finalizers.clone();
            stored.metadata.resource_version = self.next_version();
            if let Some(body) = stored.body.as_object_mut() {
                body.insert("status".to_string(), status);
            }
            sync_body_metadata(stored)?;
            (old, stored.clone())
        };
        debug!(key = %key, version = %new.metadata.resource_version, "Workflow patched");
        let mut patched = workflow.clone();
        patched.metadata = new.metadata.clone();
        self.publish(WatchEvent::Updated {
            old: WatchedObject::Workflow(old),
            new: WatchedObject::Workflow(new),
        });
        Ok(patched)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> StoreResult<ConfigMap> {
        self.check_available()?;
        self.config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .map(|cm| cm.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("config map {namespace}/{name}")))
    }
}

#[async_trait]
impl ArchiveStore for InMemoryCluster {
    async fn archive(&self, workflow: &Workflow) -> StoreResult<()> {
        self.check_available()?;
        self.archive
            .insert(workflow.uid().to_string(), (workflow.clone(), Utc::now()));
        Ok(())
    }

    async fn delete_expired(&self, ttl: Duration) -> StoreResult<usize> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        let cutoff = Utc::now() - ttl;
        let before = self.archive.len();
        self.archive.retain(|_, (_, at)| *at > cutoff);
        Ok(before - self.archive.len())
    }
}

#[async_trait]
impl TemplateGetter for InMemoryCluster {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
        cluster_scope: bool,
    ) -> EngineResult<WorkflowTemplate> {
        self.templates.get(namespace, name, cluster_scope).await
    }
}

impl WorkflowExistence for InMemoryCluster {
    fn exists(&self, key: &WorkflowKey) -> bool {
        self.workflows.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::{Synchronization, Template, WorkflowSpec, LABEL_COMPLETED};

    fn workflow(name: &str) -> Workflow {
        let spec = WorkflowSpec::new("main").with_template(Template::task("main"));
        Workflow::new("ns", name, spec)
    }

    #[tokio::test]
    async fn test_patch_keeps_spec_and_merges_labels() {
        let cluster = InMemoryCluster::new();
        let mut events = cluster.subscribe();
        let wf = workflow("a");
        cluster.create_workflow(&wf).unwrap();
        assert!(matches!(events.recv().await, Some(WatchEvent::Added(_))));

        let mut update = wf.clone();
        update.spec.entrypoint = "other".to_string();
        update.set_phase(WorkflowPhase::Running);
        update.mark_completed_label();
        let patched = cluster.patch_workflow(&update).await.unwrap();
        assert_ne!(patched.metadata.resource_version, wf.metadata.resource_version);

        let stored = cluster.workflow(&wf.key()).unwrap();
        assert_eq!(stored.spec.entrypoint, "main");
        assert_eq!(stored.status.phase, WorkflowPhase::Running);
        assert_eq!(stored.metadata.label(LABEL_COMPLETED), Some("true"));
        assert!(matches!(events.recv().await, Some(WatchEvent::Updated { .. })));
    }

    #[tokio::test]
    async fn test_patch_missing_workflow() {
        let cluster = InMemoryCluster::new();
        let err = cluster.patch_workflow(&workflow("ghost")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_indexes() {
        let cluster = InMemoryCluster::new();
        let mut wf = workflow("locked");
        wf.spec.synchronization = Some(Synchronization::semaphore(None, "limits", "workflow"));
        let un = cluster.create_workflow(&wf).unwrap();
        cluster.create_workflow(&workflow("plain")).unwrap();

        assert_eq!(cluster.by_index(IndexName::Namespace, "ns").len(), 2);
        assert_eq!(cluster.by_index(IndexName::Uid, &un.metadata.uid).len(), 1);
        assert_eq!(cluster.by_index(IndexName::Phase, "").len(), 2);
        let locked = cluster.by_index(IndexName::SemaphoreConfig, "ns/limits");
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].key(), wf.key());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let cluster = InMemoryCluster::new();
        let wf = workflow("a");
        cluster.create_workflow(&wf).unwrap();
        cluster.set_unavailable(true);
        let err = cluster.patch_workflow(&wf).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_archive_expiry() {
        let cluster = InMemoryCluster::new();
        cluster.archive(&workflow("old")).await.unwrap();
        assert_eq!(cluster.delete_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cluster.delete_expired(Duration::ZERO).await.unwrap(), 1);
        assert!(cluster.archived().is_empty());
    }
}
