//! Recently completed workflows
//!
//! The change feed can deliver a stale copy of a workflow that was just
//! completed. Keys land here when a workflow completes or is deleted, and
//! the dispatch loop skips them for a trailing window.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use workflow_types::WorkflowKey;

/// Sliding window of completion times per workflow key
pub struct RecentCompletions {
    window: ChronoDuration,
    entries: Mutex<HashMap<WorkflowKey, DateTime<Utc>>>,
}

impl RecentCompletions {
    pub fn new(window: Duration) -> Self {
        Self {
            window: ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::weeks(52 * 100)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, key: WorkflowKey) {
        self.record_at(key, Utc::now());
    }

    /// Record a completion at `at`. A later time replaces an earlier one.
    pub fn record_at(&self, key: WorkflowKey, at: DateTime<Utc>) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn contains(&self, key: &WorkflowKey) -> bool {
        self.contains_at(key, Utc::now())
    }

    /// Whether `key` completed within the window ending at `now`. Entries
    /// that fell out of the window are pruned on the way.
    pub fn contains_at(&self, key: &WorkflowKey, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock();
        let window = self.window;
        entries.retain(|_, at| now.signed_duration_since(*at) < window);
        entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(name: &str) -> WorkflowKey {
        WorkflowKey::new("ns", name)
    }

    #[test]
    fn test_suppresses_for_exactly_the_window() {
        let recent = RecentCompletions::new(Duration::from_secs(600));
        let t0 = Utc::now();
        recent.record_at(key("a"), t0);

        assert!(recent.contains_at(&key("a"), t0));
        assert!(recent.contains_at(&key("a"), t0 + ChronoDuration::seconds(599)));
        assert!(!recent.contains_at(&key("a"), t0 + ChronoDuration::seconds(600)));
        assert!(recent.is_empty());
    }

    #[test]
    fn test_prunes_only_expired_entries() {
        let recent = RecentCompletions::new(Duration::from_secs(60));
        let t0 = Utc::now();
        recent.record_at(key("old"), t0);
        recent.record_at(key("new"), t0 + ChronoDuration::seconds(50));

        assert!(recent.contains_at(&key("new"), t0 + ChronoDuration::seconds(70)));
        assert!(!recent.contains_at(&key("old"), t0 + ChronoDuration::seconds(70)));
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn test_unknown_key() {
        let recent = RecentCompletions::new(Duration::from_secs(60));
        assert!(!recent.contains(&key("missing")));
    }

    proptest! {
        #[test]
        fn test_window_with_out_of_order_timestamps(
            offsets in prop::collection::vec(0i64..1200, 1..40),
            probe in 0i64..2400,
        ) {
            let window = 600i64;
            let recent = RecentCompletions::new(Duration::from_secs(window as u64));
            let base = Utc::now();
            for (i, offset) in offsets.iter().enumerate() {
                recent.record_at(key(&i.to_string()), base + ChronoDuration::seconds(*offset));
            }
            let now = base + ChronoDuration::seconds(probe);
            for (i, offset) in offsets.iter().enumerate() {
                let expected = probe - offset < window;
                prop_assert_eq!(recent.contains_at(&key(&i.to_string()), now), expected);
            }
        }
    }
}
