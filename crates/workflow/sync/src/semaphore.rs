//! Counting semaphore with a FIFO waiter queue
//!
//! Holders and waiters are opaque holder IDs (`ns/wf` or `ns/wf/<node>`).
//! Nothing here blocks: acquisition either succeeds now or the caller is
//! queued and told to come back once notified.

use std::collections::{BTreeSet, VecDeque};

#[derive(Debug)]
pub(crate) struct Semaphore {
    name: String,
    limit: usize,
    holders: BTreeSet<String>,
    queue: VecDeque<String>,
}

impl Semaphore {
    pub(crate) fn new(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            limit,
            holders: BTreeSet::new(),
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn holders(&self) -> impl Iterator<Item = &String> {
        self.holders.iter()
    }

    pub(crate) fn waiters(&self) -> impl Iterator<Item = &String> {
        self.queue.iter()
    }

    pub(crate) fn is_holding(&self, holder: &str) -> bool {
        self.holders.contains(holder)
    }

    fn free(&self) -> usize {
        self.limit.saturating_sub(self.holders.len())
    }

    /// Whether `holder` may take the lock right now.
    ///
    /// Waiters are served in arrival order: a queued holder must be among
    /// the first `free` entries, a newcomer only gets through when fewer
    /// than `free` holders are already queued.
    pub(crate) fn is_eligible(&self, holder: &str) -> bool {
        if self.holders.contains(holder) {
            return true;
        }
        let free = self.free();
        if free == 0 {
            return false;
        }
        match self.queue.iter().position(|h| h == holder) {
            Some(pos) => pos < free,
            None => self.queue.len() < free,
        }
    }

    /// Take the lock if eligible; re-acquiring a held lock succeeds.
    pub(crate) fn try_acquire(&mut self, holder: &str) -> bool {
        if !self.is_eligible(holder) {
            return false;
        }
        self.remove_waiter(holder);
        self.holders.insert(holder.to_string());
        true
    }

    /// Record a holder without checking capacity, used when restoring state
    /// that was persisted before a restart.
    pub(crate) fn force_hold(&mut self, holder: &str) {
        self.remove_waiter(holder);
        self.holders.insert(holder.to_string());
    }

    pub(crate) fn enqueue(&mut self, holder: &str) {
        if self.holders.contains(holder) || self.queue.iter().any(|h| h == holder) {
            return;
        }
        self.queue.push_back(holder.to_string());
    }

    /// Returns whether the holder actually held the lock.
    pub(crate) fn release(&mut self, holder: &str) -> bool {
        self.holders.remove(holder)
    }

    pub(crate) fn remove_waiter(&mut self, holder: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|h| h != holder);
        before != self.queue.len()
    }

    /// Drop every holder and waiter matching `pred`; returns how many went.
    pub(crate) fn evict(&mut self, mut pred: impl FnMut(&str) -> bool) -> usize {
        let before = self.holders.len() + self.queue.len();
        self.holders.retain(|h| !pred(h));
        self.queue.retain(|h| !pred(h));
        before - self.holders.len() - self.queue.len()
    }

    /// Change capacity. Shrinking never evicts current holders; new
    /// acquisitions wait until they drop below the new limit.
    pub(crate) fn resize(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// Queued holders that may acquire right now.
    pub(crate) fn eligible_waiters(&self) -> Vec<String> {
        self.queue.iter().take(self.free()).cloned().collect()
    }

    pub(crate) fn status(&self) -> String {
        format!("Lock status: {}/{}", self.holders.len(), self.limit)
    }
}
