//! Archive worker
//!
//! Completed workflows labelled for archiving are copied to the archive
//! store, then relabelled `Archived` so they are not picked up again.

use workflow_types::{WorkflowKey, LABEL_ARCHIVING_STATUS};

use crate::controller::WorkflowController;
use crate::error::{ControllerError, ControllerResult};

impl WorkflowController {
    /// Take one key off the archive queue. `false` once the queue has shut down.
    pub async fn process_next_archive_item(&self) -> bool {
        let Some(key) = self.archive_queue.get().await else {
            return false;
        };
        {
            let _guard = self.key_lock.lock(&key.to_string()).await;
            if let Err(e) = self.archive_workflow(&key).await {
                tracing::error!(key = %key, error = %e, "Failed to archive workflow");
            }
        }
        self.archive_queue.done(&key);
        true
    }

    async fn archive_workflow(&self, key: &WorkflowKey) -> ControllerResult<()> {
        let Some(un) = self.cache.get_by_key(key) else {
            return Ok(());
        };
        let stored = un
            .to_workflow()
            .map_err(|e| ControllerError::Archive(format!("cannot parse {key}: {e}")))?;

        let mut hydrated = stored.clone();
        self.hydrator.hydrate(&mut hydrated).await?;
        tracing::info!(key = %key, uid = %stored.uid(), "Archiving workflow");
        self.archive_store.archive(&hydrated).await?;

        let mut labelled = stored;
        labelled
            .metadata
            .labels
            .insert(LABEL_ARCHIVING_STATUS.to_string(), "Archived".to_string());
        match self.store.patch_workflow(&labelled).await {
            Ok(_) => Ok(()),
            // Archived already; the workflow may have been deleted since.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
