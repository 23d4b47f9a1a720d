//! Per-key mutual exclusion
//!
//! A worker must hold the lock for a workflow key for the whole of a
//! reconciliation pass. Entries are created on first use and removed again
//! once no guard or waiter references them, so the table only holds keys
//! that are actually contended.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Table of named async mutexes
#[derive(Default)]
pub struct KeyLock {
    locks: Mutex<HashMap<String, Slot>>,
}

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    /// Guards plus callers still waiting in `lock`
    users: usize,
}

/// Claim on a table entry; the entry goes away with the last claim,
/// including claims of `lock` calls dropped before they got the mutex.
struct Lease<'a> {
    owner: &'a KeyLock,
    key: String,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock();
        if let Some(slot) = locks.get_mut(&self.key) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                locks.remove(&self.key);
            }
        }
    }
}

/// Held key lock; released on drop
pub struct KeyGuard<'a> {
    // field order matters: the mutex is unlocked before the lease is dropped
    _guard: OwnedMutexGuard<()>,
    lease: Lease<'a>,
}

impl KeyLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock();
            let slot = locks.entry(key.to_string()).or_insert_with(|| Slot {
                mutex: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            slot.users += 1;
            slot.mutex.clone()
        };
        let lease = Lease {
            owner: self,
            key: key.to_string(),
        };
        let guard = mutex.lock_owned().await;
        KeyGuard {
            _guard: guard,
            lease,
        }
    }

    /// Whether some guard currently holds `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        let locks = self.locks.lock();
        locks
            .get(key)
            .map(|slot| slot.mutex.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys with a live entry.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.lease.key
    }
}
