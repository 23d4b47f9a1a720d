//! Periodic garbage collection
//!
//! Offloaded node maps are written under a new version on every change, so
//! old versions pile up. The offload sweep deletes every version that is
//! not the live one of an existing workflow. The archive sweep expires
//! archived workflows past their TTL.

use std::time::Duration;
use workflow_types::WorkflowKey;

use crate::controller::WorkflowController;
use crate::error::{ControllerError, ControllerResult};
use crate::store::IndexName;

impl WorkflowController {
    /// Delete offloaded node maps that no live workflow points at.
    /// Returns how many versions were deleted.
    #[tracing::instrument(skip(self))]
    pub async fn offload_gc(&self) -> ControllerResult<usize> {
        if !self.hydrator.store().is_enabled() {
            return Ok(0);
        }
        tracing::info!("Performing periodic offload GC");
        let old = self
            .hydrator
            .store()
            .list_old_offloads(&self.config.offload.namespace)
            .await?;
        tracing::info!(workflows = old.len(), "Deleting old offloads that are not live");
        let mut deleted = 0;
        for (uid, versions) in old {
            match self.delete_offloads_for_workflow(&uid, &versions).await {
                Ok(n) => deleted += n,
                Err(e) => {
                    tracing::error!(uid = %uid, error = %e, "Failed to delete old offloaded nodes");
                }
            }
        }
        tracing::info!(deleted, "Offload GC finished");
        Ok(deleted)
    }

    async fn delete_offloads_for_workflow(
        &self,
        uid: &str,
        versions: &[String],
    ) -> ControllerResult<usize> {
        let matches = self.cache.by_index(IndexName::Uid, uid);
        let (live, _guard) = match matches.as_slice() {
            [] => {
                tracing::info!(uid, "Workflow missing, probably deleted");
                (None, None)
            }
            [un] => {
                let key: WorkflowKey = un.key();
                let guard = self.key_lock.lock(&key.to_string()).await;
                let un = self.cache.get_by_key(&key).ok_or_else(|| {
                    ControllerError::Gc(format!("workflow {key} vanished after locking"))
                })?;
                let mut wf = un
                    .to_workflow()
                    .map_err(|e| ControllerError::Gc(e.to_string()))?;
                if self.hydrator.is_hydrated(&wf) {
                    tracing::info!(uid, "Hydrated workflow encountered");
                    self.hydrator.dehydrate(&mut wf).await?;
                }
                (wf.status.offload_node_status_version, Some(guard))
            }
            more => {
                return Err(ControllerError::Gc(format!(
                    "expected no more than 1 workflow with uid {uid}, got {}",
                    more.len()
                )));
            }
        };

        let mut deleted = 0;
        for version in versions {
            if live.as_deref() == Some(version.as_str()) {
                continue;
            }
            self.hydrator.store().delete(uid, version).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Delete archived workflows older than `ttl`.
    pub async fn archived_workflow_gc(&self, ttl: Duration) -> ControllerResult<usize> {
        tracing::info!(ttl_secs = ttl.as_secs(), "Performing archived workflow GC");
        let deleted = self.archive_store.delete_expired(ttl).await?;
        tracing::info!(deleted, "Archived workflow GC finished");
        Ok(deleted)
    }
}
