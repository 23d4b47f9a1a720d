//! Encoded lock names
//!
//! Semaphores are backed by a config-map entry and encode as
//! `namespace/ConfigMap/name/key`; mutexes encode as `namespace/Mutex/name`.

use std::fmt;
use workflow_types::{MutexRef, SemaphoreRef, Synchronization};

use crate::{SyncError, SyncResult};

const CONFIG_MAP_KIND: &str = "ConfigMap";
const MUTEX_KIND: &str = "Mutex";

/// Kind of lock
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockKind {
    Semaphore,
    Mutex,
}

/// Parsed lock name
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockName {
    pub namespace: String,
    /// Config map name for semaphores, mutex name for mutexes
    pub resource_name: String,
    /// Config map key (semaphores only)
    pub key: Option<String>,
    pub kind: LockKind,
}

impl LockName {
    pub fn semaphore(
        namespace: impl Into<String>,
        config_map: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            resource_name: config_map.into(),
            key: Some(key.into()),
            kind: LockKind::Semaphore,
        }
    }

    pub fn mutex(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource_name: name.into(),
            key: None,
            kind: LockKind::Mutex,
        }
    }

    pub fn from_semaphore_ref(r: &SemaphoreRef, default_namespace: &str) -> Self {
        Self::semaphore(
            r.namespace.as_deref().unwrap_or(default_namespace),
            r.config_map.clone(),
            r.key.clone(),
        )
    }

    pub fn from_mutex_ref(r: &MutexRef, default_namespace: &str) -> Self {
        Self::mutex(
            r.namespace.as_deref().unwrap_or(default_namespace),
            r.name.clone(),
        )
    }

    /// Parse an encoded lock name.
    pub fn decode(encoded: &str) -> SyncResult<Self> {
        let parts: Vec<&str> = encoded.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(SyncError::InvalidLockName(encoded.to_string()));
        }
        match parts.as_slice() {
            [ns, CONFIG_MAP_KIND, name, key] => Ok(Self::semaphore(*ns, *name, *key)),
            [ns, MUTEX_KIND, name] => Ok(Self::mutex(*ns, *name)),
            _ => Err(SyncError::InvalidLockName(encoded.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// `namespace/name` of the backing config map, for semaphores.
    pub fn config_map_key(&self) -> Option<String> {
        match self.kind {
            LockKind::Semaphore => Some(format!("{}/{}", self.namespace, self.resource_name)),
            LockKind::Mutex => None,
        }
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, &self.key) {
            (LockKind::Semaphore, Some(key)) => write!(
                f,
                "{}/{}/{}/{}",
                self.namespace, CONFIG_MAP_KIND, self.resource_name, key
            ),
            _ => write!(f, "{}/{}/{}", self.namespace, MUTEX_KIND, self.resource_name),
        }
    }
}

/// Every lock a synchronization block requests, semaphores first.
pub fn lock_names(sync: &Synchronization, default_namespace: &str) -> Vec<LockName> {
    sync.semaphores
        .iter()
        .map(|s| LockName::from_semaphore_ref(s, default_namespace))
        .chain(
            sync.mutexes
                .iter()
                .map(|m| LockName::from_mutex_ref(m, default_namespace)),
        )
        .collect()
}
