//! Work queue with coalescing, delayed adds and per-item backoff
//!
//! An item is in at most one of two places: queued (waiting for a worker)
//! or processing (taken by a worker). Adding an item that is already
//! queued is a no-op; adding one that is being processed marks it dirty,
//! and it is queued again when the worker calls [`WorkQueue::done`].

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Base delay of the per-item exponential backoff
pub const RATE_LIMIT_BASE: Duration = Duration::from_millis(5);
/// Upper bound of the per-item exponential backoff
pub const RATE_LIMIT_CAP: Duration = Duration::from_secs(1000);

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    /// Earliest pending delayed add per item
    waiting: HashMap<T, Instant>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: HashMap::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

/// Deduplicating work queue shared by the worker pool
pub struct WorkQueue<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + std::fmt::Display + 'static,
{
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    /// Queue `item` unless it is already queued.
    pub fn add(&self, item: T) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }
            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                return;
            }
            state.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Queue `item` once `delay` has passed. Of several pending delayed
    /// adds for the same item only the earliest fires.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let ready = Instant::now() + delay;
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&item) {
                Some(existing) if *existing <= ready => return,
                _ => {
                    state.waiting.insert(item.clone(), ready);
                }
            }
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(ready).await;
            let due = {
                let mut state = queue.state.lock();
                match state.waiting.get(&item) {
                    Some(at) if *at == ready => {
                        state.waiting.remove(&item);
                        true
                    }
                    _ => false,
                }
            };
            if due {
                queue.add(item);
            }
        });
    }

    /// Queue `item` after its per-item backoff and grow the backoff.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let delay = backoff_delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        tracing::trace!(queue = self.name, item = %item, delay_ms = delay.as_millis() as u64, "Rate-limited requeue");
        self.add_after(item, delay);
    }

    /// Reset the backoff of `item`.
    pub fn forget(&self, item: &T) {
        self.state.lock().failures.remove(item);
    }

    /// Rate-limited requeues since the last `forget`.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Wait for the next item. `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `item` as processed; re-queue it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop accepting items and wake every waiting worker.
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
        tracing::debug!(queue = self.name, "Work queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Items waiting for a worker
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, item: &T) -> bool {
        self.state.lock().processing.contains(item)
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(31));
    RATE_LIMIT_BASE.saturating_mul(factor).min(RATE_LIMIT_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_coalesces_queued_items() {
        let queue = WorkQueue::new("test");
        queue.add("a".to_string());
        queue.add("a".to_string());
        queue.add("b".to_string());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_readd_while_processing_requeues_on_done() {
        let queue = WorkQueue::new("test");
        queue.add("a".to_string());
        let item = queue.get().await.unwrap();
        queue.add("a".to_string());
        assert!(queue.is_empty());
        assert!(queue.is_processing(&item));

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = WorkQueue::<String>::new("test");
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        queue.add("late".to_string());
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_keeps_earliest() {
        let queue = WorkQueue::new("test");
        queue.add_after("a".to_string(), Duration::from_secs(10));
        queue.add_after("a".to_string(), Duration::from_secs(1));
        queue.add_after("a".to_string(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(queue.len(), 1);
        let item = queue.get().await.unwrap();
        queue.done(&item);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(queue.is_empty());
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        assert_eq!(backoff_delay(0), Duration::from_millis(5));
        assert_eq!(backoff_delay(1), Duration::from_millis(10));
        assert_eq!(backoff_delay(3), Duration::from_millis(40));
        assert_eq!(backoff_delay(40), RATE_LIMIT_CAP);
    }

    #[tokio::test]
    async fn test_forget_resets_backoff() {
        let queue = WorkQueue::new("test");
        queue.add_rate_limited("a".to_string());
        queue.add_rate_limited("a".to_string());
        assert_eq!(queue.num_requeues(&"a".to_string()), 2);
        queue.forget(&"a".to_string());
        assert_eq!(queue.num_requeues(&"a".to_string()), 0);
    }
}
