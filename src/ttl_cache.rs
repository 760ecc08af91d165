//! Expiring key/value map with an optional size bound.
//!
//! Entries become invisible once their TTL has elapsed; expired entries are
//! dropped lazily on access or eagerly through [`TtlCache::remove_expired`].
//! When a size bound is configured, inserting a *new* key at capacity drops
//! the oldest entry. Re-setting an existing key refreshes its position and
//! expiry and never drops anything else.

use std::hash::Hash;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

struct TtlEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> TtlEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub struct TtlCache<K: Hash + Eq, V> {
    entries: LruCache<K, TtlEntry<V>>,
    default_ttl: Duration,
    max_size: Option<usize>,
}

impl<K: Hash + Eq + Clone, V> TtlCache<K, V> {
    /// Unbounded cache.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: LruCache::unbounded(),
            default_ttl,
            max_size: None,
        }
    }

    /// Cache holding at most `max_size` entries. A bound of zero keeps the
    /// cache permanently empty.
    pub fn with_max_size(default_ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            default_ttl,
            max_size: Some(max_size),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn set(&mut self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&mut self, key: K, value: V, ttl: Duration) {
        if self.max_size == Some(0) {
            return;
        }
        let entry = TtlEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        if self.entries.contains(&key) {
            self.entries.put(key, entry);
            return;
        }
        if let Some(max) = self.max_size {
            while self.entries.len() >= max {
                if self.entries.pop_lru().is_none() {
                    break;
                }
            }
        }
        self.entries.put(key, entry);
    }

    /// Live value for `key`. Reading does not change the eviction order.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let now = Instant::now();
        let expired = self.entries.peek(key)?.is_expired(now);
        if expired {
            self.entries.pop(key);
            return None;
        }
        self.entries.peek(key).map(|entry| &entry.value)
    }

    /// Mutable access to a live value. Neither the expiry nor the eviction
    /// order of the entry change.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let now = Instant::now();
        let expired = self.entries.peek(key)?.is_expired(now);
        if expired {
            self.entries.pop(key);
            return None;
        }
        self.entries.peek_mut(key).map(|entry| &mut entry.value)
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Remove `key`, returning its value if it was still live.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let now = Instant::now();
        let entry = self.entries.pop(key)?;
        if entry.is_expired(now) {
            None
        } else {
            Some(entry.value)
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries, expired ones included until they are purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live values, oldest first.
    pub fn values(&self) -> Vec<&V> {
        let now = Instant::now();
        self.entries
            .iter()
            .rev()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(_, entry)| &entry.value)
            .collect()
    }

    /// Live keys, oldest first.
    pub fn keys(&self) -> Vec<K> {
        let now = Instant::now();
        self.entries
            .iter()
            .rev()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Live entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let now = Instant::now();
        self.entries
            .iter()
            .rev()
            .filter(move |(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (key, &entry.value))
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn remove_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    /// Remove and return every live entry.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let now = Instant::now();
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some((key, entry)) = self.entries.pop_lru() {
            if !entry.is_expired(now) {
                out.push((key, entry.value));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let mut cache = TtlCache::new(TTL);
        cache.set("a", 1);
        assert_eq!(cache.get(&"a"), Some(&1));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.contains(&"a"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_entry_ttl_overrides_default() {
        let mut cache = TtlCache::new(TTL);
        cache.set_with_ttl("short", 1, Duration::from_secs(1));
        cache.set("long", 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.contains(&"short"));
        assert!(cache.contains(&"long"));
    }

    #[test]
    fn max_size_zero_stays_empty() {
        let mut cache = TtlCache::with_max_size(TTL, 0);
        cache.set("a", 1);
        cache.set("b", 2);
        assert!(cache.is_empty());
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn inserting_beyond_max_size_drops_oldest() {
        let mut cache = TtlCache::with_max_size(TTL, 3);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);
        cache.set("d", 4);

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&"a"));
        assert_eq!(cache.values(), vec![&2, &3, &4]);
    }

    #[test]
    fn resetting_existing_key_keeps_other_entries() {
        let mut cache = TtlCache::with_max_size(TTL, 2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(&10));
        assert_eq!(cache.get(&"b"), Some(&2));

        // "a" was refreshed, so "b" is now the oldest
        cache.set("c", 3);
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"a"));
    }

    #[test]
    fn reads_do_not_change_eviction_order() {
        let mut cache = TtlCache::with_max_size(TTL, 2);
        cache.set("a", 1);
        cache.set("b", 2);
        let _ = cache.get(&"a");
        cache.set("c", 3);
        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b"));
    }

    #[tokio::test(start_paused = true)]
    async fn mutating_in_place_keeps_expiry() {
        let mut cache = TtlCache::new(TTL);
        cache.set("a", 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        *cache.get_mut(&"a").unwrap() = 2;
        assert_eq!(cache.get(&"a"), Some(&2));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.get_mut(&"a").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_expired_purges_only_stale_entries() {
        let mut cache = TtlCache::new(TTL);
        cache.set_with_ttl("old", 1, Duration::from_secs(1));
        cache.set("fresh", 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.remove_expired(), 1);
        assert_eq!(cache.keys(), vec!["fresh"]);
    }

    #[test]
    fn remove_and_clear() {
        let mut cache = TtlCache::new(TTL);
        cache.set(1u32, "x");
        cache.set(2u32, "y");
        assert_eq!(cache.remove(&1), Some("x"));
        assert_eq!(cache.remove(&1), None);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn drain_returns_everything_oldest_first() {
        let mut cache = TtlCache::new(TTL);
        cache.set(1u32, "x");
        cache.set(2u32, "y");
        let drained = cache.drain();
        assert_eq!(drained, vec![(1, "x"), (2, "y")]);
        assert!(cache.is_empty());
    }
}
