//! Tracking of notifications received from upstream servers, keyed by
//! subscription URL, with sliding-window eviction.

use candela_core::FhirInstant;
use dashmap::DashMap;
use std::collections::VecDeque;
use time::Duration;
use tracing::debug;

/// Entries older than this fall out of the window.
const WINDOW_MINUTES: i64 = 10;

/// One received notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedNotification {
    pub status: String,
    pub event_numbers: Vec<u64>,
    pub processed_at: FhirInstant,
}

/// Per-subscription-url ring of received notifications.
#[derive(Debug, Default)]
pub struct ReceivedNotificationTracker {
    entries: DashMap<String, VecDeque<ReceivedNotification>>,
}

impl ReceivedNotificationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, subscription_url: &str, status: impl Into<String>, events: Vec<u64>) {
        self.entries
            .entry(subscription_url.to_string())
            .or_default()
            .push_back(ReceivedNotification {
                status: status.into(),
                event_numbers: events,
                processed_at: FhirInstant::now(),
            });
    }

    pub fn notifications(&self, subscription_url: &str) -> Vec<ReceivedNotification> {
        self.entries
            .get(subscription_url)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tracked_urls(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop entries older than the 10-minute window; a subscription whose
    /// list empties is removed entirely. Returns the removed subscription
    /// urls so a "removed" change event can be emitted for each.
    pub fn evict_stale(&self, now: &FhirInstant) -> Vec<String> {
        let cutoff = FhirInstant(now.0 - Duration::minutes(WINDOW_MINUTES));
        let mut removed = Vec::new();
        for mut entry in self.entries.iter_mut() {
            while entry
                .value()
                .front()
                .is_some_and(|n| n.processed_at < cutoff)
            {
                entry.value_mut().pop_front();
            }
        }
        self.entries.retain(|url, list| {
            if list.is_empty() {
                removed.push(url.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            debug!(count = removed.len(), "stale notification keys removed");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_lists() {
        let tracker = ReceivedNotificationTracker::new();
        tracker.record("http://srv/Subscription/1", "active", vec![1, 2]);
        tracker.record("http://srv/Subscription/1", "active", vec![3]);

        let list = tracker.notifications("http://srv/Subscription/1");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].event_numbers, vec![1, 2]);
        assert!(tracker.notifications("http://srv/Subscription/2").is_empty());
    }

    #[test]
    fn eviction_drops_old_entries_and_empty_keys() {
        let tracker = ReceivedNotificationTracker::new();
        tracker.record("http://srv/Subscription/1", "active", vec![1]);

        // Nothing is stale within the window.
        let removed = tracker.evict_stale(&FhirInstant::now());
        assert!(removed.is_empty());
        assert_eq!(tracker.tracked_urls().len(), 1);

        // A sweep "15 minutes later" clears the key.
        let later = FhirInstant(FhirInstant::now().0 + Duration::minutes(15));
        let removed = tracker.evict_stale(&later);
        assert_eq!(removed, vec!["http://srv/Subscription/1"]);
        assert!(tracker.tracked_urls().is_empty());
    }

    #[test]
    fn partial_eviction_keeps_fresh_entries() {
        let tracker = ReceivedNotificationTracker::new();
        tracker
            .entries
            .entry("http://srv/Subscription/1".to_string())
            .or_default()
            .push_back(ReceivedNotification {
                status: "active".to_string(),
                event_numbers: vec![1],
                processed_at: FhirInstant(FhirInstant::now().0 - Duration::minutes(20)),
            });
        tracker.record("http://srv/Subscription/1", "active", vec![2]);

        let removed = tracker.evict_stale(&FhirInstant::now());
        assert!(removed.is_empty());
        let list = tracker.notifications("http://srv/Subscription/1");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].event_numbers, vec![2]);
    }
}
