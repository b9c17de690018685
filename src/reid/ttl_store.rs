//! Key-value store with sliding per-entry expiry.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    updated_at: Instant,
    ttl: Duration,
}

impl<V> Slot<V> {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.updated_at) <= self.ttl
    }
}

/// Every write resets an entry's clock; entries idle for longer than their
/// TTL are invisible to reads and reclaimed by [`TtlStore::purge_expired_at`].
///
/// The `*_at` methods take the current time explicitly; the plain variants
/// use [`Instant::now`].
#[derive(Debug, Clone)]
pub struct TtlStore<K, V> {
    entries: HashMap<K, Slot<V>>,
    default_ttl: Duration,
}

impl<K: Eq + Hash + Clone, V> TtlStore<K, V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.insert_at(key, value, self.default_ttl, Instant::now());
    }

    pub fn insert_at(&mut self, key: K, value: V, ttl: Duration, now: Instant) {
        self.entries.insert(
            key,
            Slot {
                value,
                updated_at: now,
                ttl,
            },
        );
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &K, now: Instant) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| &slot.value)
    }

    /// Mutable access to a live entry; refreshes its clock.
    pub fn get_mut_at(&mut self, key: &K, ttl: Duration, now: Instant) -> Option<&mut V> {
        let slot = self.entries.get_mut(key).filter(|slot| slot.is_live(now))?;
        slot.updated_at = now;
        slot.ttl = ttl;
        Some(&mut slot.value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|slot| slot.value)
    }

    /// Drop expired entries; returns how many were reclaimed.
    pub fn purge_expired_at(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.is_live(now));
        before - self.entries.len()
    }

    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    /// Number of stored entries, expired-but-unpurged ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expires_without_refresh() {
        let start = Instant::now();
        let mut store = TtlStore::new(Duration::from_secs(5));
        store.insert_at("a", 1, Duration::from_secs(5), start);

        assert_eq!(store.get_at(&"a", start + Duration::from_secs(5)), Some(&1));
        assert_eq!(store.get_at(&"a", start + Duration::from_secs(6)), None);
        assert_eq!(store.purge_expired_at(start + Duration::from_secs(6)), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_refresh_slides_expiry() {
        let start = Instant::now();
        let ttl = Duration::from_secs(5);
        let mut store = TtlStore::new(ttl);
        for step in 0..10 {
            let now = start + Duration::from_secs(step * 4);
            store.insert_at("a", step, ttl, now);
        }
        let last_write = start + Duration::from_secs(36);
        assert_eq!(store.get_at(&"a", last_write + Duration::from_secs(4)), Some(&9));
    }

    #[test]
    fn test_get_mut_refreshes() {
        let start = Instant::now();
        let ttl = Duration::from_secs(5);
        let mut store = TtlStore::new(ttl);
        store.insert_at(1u64, vec![1], ttl, start);
        let later = start + Duration::from_secs(4);
        store.get_mut_at(&1, ttl, later).unwrap().push(2);
        assert_eq!(store.get_at(&1, later + Duration::from_secs(4)), Some(&vec![1, 2]));
    }
}
