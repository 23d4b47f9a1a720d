//! Node-status offloading
//!
//! Large node maps are moved out of the workflow object into an offload
//! store and replaced by a version pointer. A dehydrated workflow must be
//! hydrated before the engine touches it and dehydrated again before it is
//! persisted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use workflow_sync::{retry_transient, Backoff};
use workflow_types::{Nodes, Workflow};

use crate::{EngineError, EngineResult};

/// Default size above which node maps are offloaded
pub const DEFAULT_OFFLOAD_THRESHOLD: usize = 1024 * 1024;

// ── Offload store ────────────────────────────────────────────────────

/// Durable store for offloaded node maps, keyed by (workflow UID, version)
#[async_trait]
pub trait OffloadStore: Send + Sync {
    fn is_enabled(&self) -> bool;

    async fn save(&self, uid: &str, namespace: &str, version: &str, nodes: &Nodes)
        -> EngineResult<()>;

    async fn get(&self, uid: &str, version: &str) -> EngineResult<Nodes>;

    async fn delete(&self, uid: &str, version: &str) -> EngineResult<()>;

    /// Versions old enough to be garbage collected, grouped by UID. An
    /// empty namespace covers every namespace.
    async fn list_old_offloads(&self, namespace: &str)
        -> EngineResult<HashMap<String, Vec<String>>>;
}

/// Version pointer for a node map: a content hash of its JSON form.
pub fn offload_version(nodes: &Nodes) -> EngineResult<String> {
    let json = serde_json::to_vec(nodes)?;
    let hash = blake3::hash(&json);
    Ok(format!("blake3-{}", &hash.to_hex()[..16]))
}

#[derive(Clone)]
struct OffloadRecord {
    namespace: String,
    nodes: Nodes,
    saved_at: DateTime<Utc>,
}

/// In-memory offload store
pub struct InMemoryOffloadStore {
    records: DashMap<(String, String), OffloadRecord>,
    enabled: bool,
    min_age: Duration,
}

impl InMemoryOffloadStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            enabled: true,
            min_age: Duration::ZERO,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Only versions at least this old are reported for collection.
    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    pub fn versions(&self, uid: &str) -> Vec<String> {
        let mut versions: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.key().0 == uid)
            .map(|r| r.key().1.clone())
            .collect();
        versions.sort();
        versions
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryOffloadStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OffloadStore for InMemoryOffloadStore {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn save(
        &self,
        uid: &str,
        namespace: &str,
        version: &str,
        nodes: &Nodes,
    ) -> EngineResult<()> {
        self.records.insert(
            (uid.to_string(), version.to_string()),
            OffloadRecord {
                namespace: namespace.to_string(),
                nodes: nodes.clone(),
                saved_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, uid: &str, version: &str) -> EngineResult<Nodes> {
        self.records
            .get(&(uid.to_string(), version.to_string()))
            .map(|r| r.nodes.clone())
            .ok_or_else(|| {
                EngineError::Offload(format!("offloaded nodes not found: {uid}/{version}"))
            })
    }

    async fn delete(&self, uid: &str, version: &str) -> EngineResult<()> {
        self.records.remove(&(uid.to_string(), version.to_string()));
        Ok(())
    }

    async fn list_old_offloads(
        &self,
        namespace: &str,
    ) -> EngineResult<HashMap<String, Vec<String>>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.min_age)
                .map_err(|e| EngineError::Offload(e.to_string()))?;
        let mut old: HashMap<String, Vec<String>> = HashMap::new();
        for record in self.records.iter() {
            if (namespace.is_empty() || record.namespace == namespace) && record.saved_at <= cutoff {
                let (uid, version) = record.key();
                old.entry(uid.clone()).or_default().push(version.clone());
            }
        }
        Ok(old)
    }
}

// ── Hydrator ─────────────────────────────────────────────────────────

/// Moves node maps between the workflow object and the offload store
#[derive(Clone)]
pub struct Hydrator {
    store: Arc<dyn OffloadStore>,
    threshold: usize,
    always_offload: bool,
    backoff: Backoff,
}

impl Hydrator {
    pub fn new(store: Arc<dyn OffloadStore>) -> Self {
        Self {
            store,
            threshold: DEFAULT_OFFLOAD_THRESHOLD,
            always_offload: false,
            backoff: Backoff::default(),
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_always_offload(mut self, always: bool) -> Self {
        self.always_offload = always;
        self
    }

    pub fn store(&self) -> &Arc<dyn OffloadStore> {
        &self.store
    }

    /// A workflow is dehydrated when its nodes live only in the store.
    pub fn is_hydrated(&self, wf: &Workflow) -> bool {
        !wf.status.is_offloaded() || !wf.status.nodes.is_empty()
    }

    /// Load offloaded nodes back into the workflow.
    pub async fn hydrate(&self, wf: &mut Workflow) -> EngineResult<()> {
        if self.is_hydrated(wf) {
            return Ok(());
        }
        let version = wf
            .status
            .offload_node_status_version
            .clone()
            .unwrap_or_default();
        let uid = wf.uid().to_string();
        let store = &*self.store;
        let nodes = retry_transient(&self.backoff, EngineError::is_transient, || {
            store.get(&uid, &version)
        })
        .await?;
        debug!(key = %wf.key(), version = %version, nodes = nodes.len(), "Workflow hydrated");
        wf.status.nodes = nodes;
        wf.status.offload_node_status_version = None;
        Ok(())
    }

    /// Offload the node map when it is too large to keep inline.
    pub async fn dehydrate(&self, wf: &mut Workflow) -> EngineResult<()> {
        if !self.is_hydrated(wf) || wf.status.nodes.is_empty() {
            return Ok(());
        }
        let size = serde_json::to_vec(&wf.status.nodes)?.len();
        if !self.always_offload && size <= self.threshold {
            return Ok(());
        }
        if !self.store.is_enabled() {
            return Err(EngineError::Offload(format!(
                "node status is {} bytes, over the {} byte limit, and offloading is disabled",
                size, self.threshold
            )));
        }
        let version = offload_version(&wf.status.nodes)?;
        let (uid, namespace) = (wf.uid().to_string(), wf.namespace().to_string());
        let store = &*self.store;
        let nodes = &wf.status.nodes;
        retry_transient(&self.backoff, EngineError::is_transient, || {
            store.save(&uid, &namespace, &version, nodes)
        })
        .await?;
        info!(key = %wf.key(), version = %version, size, "Node status offloaded");
        wf.status.nodes.clear();
        wf.status.offload_node_status_version = Some(version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use workflow_types::{NodePhase, NodeStatus, NodeType, WorkflowSpec};

    fn workflow_with_nodes(count: usize) -> Workflow {
        let mut wf = Workflow::new("ns", "wf", WorkflowSpec::new("main"));
        for i in 0..count {
            let name = format!("wf[{i}].step");
            let id = workflow_types::node_id("wf", &name);
            let mut node = NodeStatus::new(id.clone(), name, NodeType::Task);
            node.phase = NodePhase::Succeeded;
            wf.status.nodes.insert(id, node);
        }
        wf
    }

    #[tokio::test]
    async fn test_small_node_map_stays_inline() {
        let store = Arc::new(InMemoryOffloadStore::new());
        let hydrator = Hydrator::new(store.clone());
        let mut wf = workflow_with_nodes(3);
        hydrator.dehydrate(&mut wf).await.unwrap();
        assert!(!wf.status.is_offloaded());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_offload_disabled_is_an_error() {
        let hydrator = Hydrator::new(Arc::new(InMemoryOffloadStore::disabled())).with_threshold(10);
        let mut wf = workflow_with_nodes(3);
        assert!(matches!(
            hydrator.dehydrate(&mut wf).await,
            Err(EngineError::Offload(_))
        ));
        assert_eq!(wf.status.nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_offload_fails_hydration() {
        let hydrator = Hydrator::new(Arc::new(InMemoryOffloadStore::new()));
        let mut wf = workflow_with_nodes(0);
        wf.status.offload_node_status_version = Some("blake3-0000".into());
        assert!(!hydrator.is_hydrated(&wf));
        assert!(hydrator.hydrate(&mut wf).await.is_err());
    }

    #[test]
    fn test_version_is_content_addressed() {
        let a = offload_version(&workflow_with_nodes(2).status.nodes).unwrap();
        let b = offload_version(&workflow_with_nodes(2).status.nodes).unwrap();
        let c = offload_version(&workflow_with_nodes(3).status.nodes).unwrap();
        assert!(a.starts_with("blake3-"));
        assert_eq!(a.len(), "blake3-".len() + 16);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    proptest! {
        #[test]
        fn prop_dehydrate_then_hydrate_is_lossless(count in 0usize..40, always in any::<bool>()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let hydrator = Hydrator::new(Arc::new(InMemoryOffloadStore::new()))
                .with_threshold(512)
                .with_always_offload(always);
            let original = workflow_with_nodes(count);
            let mut wf = original.clone();

            rt.block_on(hydrator.dehydrate(&mut wf)).unwrap();
            if count > 0 && (always || serde_json::to_vec(&original.status.nodes).unwrap().len() > 512) {
                prop_assert!(wf.status.is_offloaded());
                prop_assert!(!hydrator.is_hydrated(&wf));
            }
            rt.block_on(hydrator.hydrate(&mut wf)).unwrap();
            prop_assert_eq!(&wf.status.nodes, &original.status.nodes);
            prop_assert!(!wf.status.is_offloaded());
        }
    }
}
