//! Change-feed handlers
//!
//! Turns watch events into queue operations. Handlers never reconcile
//! anything themselves and never block.

use workflow_sync::parse_capacity;
use workflow_types::{
    ConfigMap, UnstructuredWorkflow, WatchEvent, WatchedObject, LABEL_ARCHIVING_STATUS,
};

use crate::controller::WorkflowController;
use crate::store::IndexName;

impl WorkflowController {
    /// Route one change notification.
    pub fn handle_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(WatchedObject::Workflow(un)) => self.on_workflow_added(un),
            WatchEvent::Updated {
                old: WatchedObject::Workflow(old),
                new: WatchedObject::Workflow(new),
            } => self.on_workflow_updated(&old, new),
            WatchEvent::Deleted(WatchedObject::Workflow(un)) => self.on_workflow_deleted(&un),

            WatchEvent::Added(WatchedObject::ConfigMap(cm))
            | WatchEvent::Updated {
                new: WatchedObject::ConfigMap(cm),
                ..
            } => self.on_config_map_changed(&cm),
            WatchEvent::Deleted(WatchedObject::ConfigMap(cm)) => {
                tracing::debug!(config_map = %cm.metadata.key(), "Config map deleted");
            }

            WatchEvent::Added(WatchedObject::WorkflowTemplate(t))
            | WatchEvent::Updated {
                new: WatchedObject::WorkflowTemplate(t),
                ..
            }
            | WatchEvent::Deleted(WatchedObject::WorkflowTemplate(t)) => {
                tracing::debug!(template = %t.metadata.key(), "Workflow template changed");
            }

            WatchEvent::Updated { old, new } => {
                tracing::warn!(
                    old = %old.metadata().key(),
                    new = %new.metadata().key(),
                    "Update changed the object kind, ignoring"
                );
            }
        }
    }

    /// Completed workflows are recorded and dropped; the rest pass.
    fn accept_workflow(&self, un: &UnstructuredWorkflow) -> bool {
        if un.metadata.reconciliation_needed() {
            return true;
        }
        self.recent.record(un.key());
        false
    }

    fn enqueue_for_archive(&self, un: &UnstructuredWorkflow) {
        if un.metadata.label(LABEL_ARCHIVING_STATUS) == Some("Pending") {
            self.archive_queue.add(un.key());
        }
    }

    fn on_workflow_added(&self, un: UnstructuredWorkflow) {
        self.enqueue_for_archive(&un);
        if !self.accept_workflow(&un) {
            return;
        }
        let key = un.key();
        tracing::debug!(key = %key, "Workflow added");
        self.queue.add_after(key.clone(), self.config.initial_delay());
        self.throttler
            .add(key, un.priority(), un.metadata.creation_timestamp);
    }

    fn on_workflow_updated(&self, old: &UnstructuredWorkflow, new: UnstructuredWorkflow) {
        self.enqueue_for_archive(&new);
        if !self.accept_workflow(&new) {
            return;
        }
        // Periodic resyncs deliver the same object again
        if old.metadata.resource_version == new.metadata.resource_version {
            return;
        }
        let key = new.key();
        self.queue.add_rate_limited(key.clone());
        self.throttler
            .add(key, new.priority(), new.metadata.creation_timestamp);
    }

    fn on_workflow_deleted(&self, un: &UnstructuredWorkflow) {
        let key = un.key();
        tracing::debug!(key = %key, "Workflow deleted");
        self.sync.release_all_for_key(&key);
        self.recent.record(key.clone());
        self.throttler.remove(&key);
        self.queue.add(key);
    }

    fn on_config_map_changed(&self, cm: &ConfigMap) {
        let meta = &cm.metadata;
        let own = &self.config.controller_config_map;
        if meta.namespace == own.namespace && meta.name == own.name {
            self.on_controller_config_changed(cm);
            return;
        }
        let changed = self.sync.on_capacity_change(cm);
        let index_value = format!("{}/{}", meta.namespace, meta.name);
        let waiting = self.cache.by_index(IndexName::SemaphoreConfig, &index_value);
        if changed > 0 || !waiting.is_empty() {
            tracing::info!(
                config_map = %index_value,
                locks = changed,
                workflows = waiting.len(),
                "Semaphore config updated"
            );
        }
        for un in waiting {
            self.queue.add_rate_limited(un.key());
        }
    }

    fn on_controller_config_changed(&self, cm: &ConfigMap) {
        let mut throttle = self.config.throttle.clone();
        for (field, target) in [
            ("parallelism", &mut throttle.parallelism),
            ("namespaceParallelism", &mut throttle.namespace_parallelism),
        ] {
            let Some(value) = cm.data.get(field) else {
                continue;
            };
            match parse_capacity(value) {
                Ok(limit) => *target = limit,
                Err(e) => {
                    tracing::warn!(field, error = %e, "Ignoring invalid controller setting");
                }
            }
        }
        self.throttler.update_limits(throttle.limits());
    }
}
