//! Semaphore capacities read from config maps

use async_trait::async_trait;
use std::sync::Arc;
use workflow_sync::{parse_capacity, LockCapacityResolver, LockKind, LockName, ResolveError};

use super::ObjectStore;
use crate::error::StoreError;

/// Resolves semaphore limits from `data[key]` of the named config map.
/// Mutexes always have a capacity of one.
pub struct ConfigMapCapacityResolver {
    store: Arc<dyn ObjectStore>,
}

impl ConfigMapCapacityResolver {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LockCapacityResolver for ConfigMapCapacityResolver {
    async fn capacity(&self, lock: &LockName) -> Result<usize, ResolveError> {
        if lock.kind == LockKind::Mutex {
            return Ok(1);
        }
        let Some(key) = lock.key.as_deref() else {
            return Err(ResolveError::Invalid(format!("semaphore {lock} has no key")));
        };
        let config_map = self
            .store
            .get_config_map(&lock.namespace, &lock.resource_name)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => ResolveError::NotFound(format!(
                    "config map {}/{} not found",
                    lock.namespace, lock.resource_name
                )),
                StoreError::Unavailable(msg) | StoreError::Conflict(msg) => {
                    ResolveError::Transient(msg)
                }
                StoreError::InvalidData(msg) => ResolveError::Invalid(msg),
            })?;
        let value = config_map.data.get(key).ok_or_else(|| {
            ResolveError::NotFound(format!(
                "key '{}' not found in config map {}/{}",
                key, lock.namespace, lock.resource_name
            ))
        })?;
        parse_capacity(value)
    }
}
