use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::types::{ScheduleOutcome, SchedulingKey};

/// Shared outcome slot for one scheduling key.
pub type OutcomeSlot = Arc<OnceCell<ScheduleOutcome>>;

/// Process-lifetime set of keys already handed to a channel.
///
/// A key is claimed synchronously before any channel call, so a second
/// caller for the same key waits on the first caller's outcome instead of
/// issuing its own request. Entries live until purged by cancellation.
#[derive(Debug, Default)]
pub struct DedupCache {
    slots: Mutex<HashMap<SchedulingKey, OutcomeSlot>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the slot for `key`.
    pub fn claim(&self, key: &SchedulingKey) -> OutcomeSlot {
        let mut slots = self.slots.lock().unwrap();
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Drop `slot` if it still owns `key`. Used after an unsuccessful outcome
    /// so a later call can retry.
    pub fn release(&self, key: &SchedulingKey, slot: &OutcomeSlot) {
        let mut slots = self.slots.lock().unwrap();
        if slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(key);
        }
    }

    /// Remove every key of one occurrence. Returns how many were removed.
    pub fn purge(&self, occurrence_id: &str) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let before = slots.len();
        slots.retain(|k, _| k.occurrence_id != occurrence_id);
        before - slots.len()
    }

    /// Recorded outcome for `key`, if scheduling already completed.
    pub fn outcome(&self, key: &SchedulingKey) -> Option<ScheduleOutcome> {
        self.slots.lock().unwrap().get(key).and_then(|s| s.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlarmHandle, DeliveryChannel};

    fn key(id: &str, ms: i64) -> SchedulingKey {
        SchedulingKey {
            occurrence_id: id.into(),
            due_at_millis: ms,
        }
    }

    #[test]
    fn claim_returns_same_slot() {
        let cache = DedupCache::new();
        let a = cache.claim(&key("d1", 1));
        let b = cache.claim(&key("d1", 1));
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.claim(&key("d1", 2));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn purge_matches_whole_id_only() {
        let cache = DedupCache::new();
        cache.claim(&key("d1", 1));
        cache.claim(&key("d1", 2));
        cache.claim(&key("d10", 1));
        assert_eq!(cache.purge("d1"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.outcome(&key("d10", 1)).is_none());
    }

    #[test]
    fn release_ignores_replaced_slot() {
        let cache = DedupCache::new();
        let old = cache.claim(&key("d1", 1));
        cache.purge("d1");
        let fresh = cache.claim(&key("d1", 1));
        cache.release(&key("d1", 1), &old);
        assert_eq!(cache.len(), 1);
        cache.release(&key("d1", 1), &fresh);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn outcome_visible_after_init() {
        let cache = DedupCache::new();
        let k = key("d1", 1);
        let slot = cache.claim(&k);
        assert!(cache.outcome(&k).is_none());
        slot.get_or_init(|| async { ScheduleOutcome::scheduled(DeliveryChannel::Primary, AlarmHandle(3)) })
            .await;
        assert_eq!(cache.outcome(&k).unwrap().handle, AlarmHandle(3));
    }
}
