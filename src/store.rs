//! Local record storage.
//!
//! Each key may hold one entry per creator. Entries carry their own TTL,
//! capped at the node's configured maximum, and are last-write-wins on
//! `created_at` per `(key, creator)`. Deletion is a marker, not a removal, so
//! a delete cannot be undone by an older store arriving late.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::identity::NodeId;
use crate::messages::MAX_VALUE_SIZE;
use crate::ttl_cache::TtlCache;

/// Maximum number of distinct keys held locally.
pub const LOCAL_STORE_MAX_KEYS: usize = 100_000;

/// Maximum number of creators per key.
pub const MAX_CREATORS_PER_KEY: usize = 1_000;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecordEntry {
    pub key: NodeId,
    pub value: Vec<u8>,
    pub creator: NodeId,
    /// Creation time at the creator, ms since the Unix epoch.
    pub created_at: u64,
    pub ttl_ms: u64,
    /// Set when the holder no longer considers itself among the closest
    /// nodes to `key`.
    pub stale: bool,
    pub deleted: bool,
}

impl StoredRecordEntry {
    pub fn new(key: NodeId, value: Vec<u8>, creator: NodeId, ttl: Duration) -> Self {
        Self {
            key,
            value,
            creator,
            created_at: now_ms(),
            ttl_ms: ttl.as_millis() as u64,
            stale: false,
            deleted: false,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// An entry from the same creator with a newer timestamp is held, or a
    /// deletion marker with the same one.
    Outdated,
    TooLarge,
    /// Key table full.
    Full,
}

pub struct LocalDataStore {
    records: HashMap<NodeId, TtlCache<NodeId, StoredRecordEntry>>,
    max_ttl: Duration,
}

impl LocalDataStore {
    pub fn new(max_ttl: Duration) -> Self {
        Self {
            records: HashMap::new(),
            max_ttl,
        }
    }

    pub fn store(&mut self, mut entry: StoredRecordEntry) -> StoreOutcome {
        if entry.value.len() > MAX_VALUE_SIZE {
            return StoreOutcome::TooLarge;
        }
        if !self.records.contains_key(&entry.key) && self.records.len() >= LOCAL_STORE_MAX_KEYS {
            self.remove_expired();
            if self.records.len() >= LOCAL_STORE_MAX_KEYS {
                return StoreOutcome::Full;
            }
        }

        let ttl = entry.ttl().min(self.max_ttl);
        entry.ttl_ms = ttl.as_millis() as u64;

        let max_ttl = self.max_ttl;
        let per_key = self
            .records
            .entry(entry.key)
            .or_insert_with(|| TtlCache::with_max_size(max_ttl, MAX_CREATORS_PER_KEY));

        if let Some(existing) = per_key.get(&entry.creator)
            && (existing.created_at > entry.created_at
                || (existing.deleted && existing.created_at >= entry.created_at))
        {
            trace!(
                key = hex::encode(&entry.key.as_bytes()[..8]),
                creator = hex::encode(&entry.creator.as_bytes()[..8]),
                "ignoring outdated store"
            );
            return StoreOutcome::Outdated;
        }

        per_key.set_with_ttl(entry.creator, entry, ttl);
        StoreOutcome::Stored
    }

    /// Live entries under `key`, deleted markers included.
    pub fn get(&mut self, key: &NodeId) -> Vec<StoredRecordEntry> {
        let Some(per_key) = self.records.get_mut(key) else {
            return Vec::new();
        };
        per_key.remove_expired();
        let entries: Vec<StoredRecordEntry> = per_key.values().into_iter().cloned().collect();
        if entries.is_empty() {
            self.records.remove(key);
        }
        entries
    }

    /// Mark the entry of `creator` under `key` as deleted. The marker
    /// expires when the entry it replaces would have.
    pub fn mark_deleted(&mut self, key: &NodeId, creator: &NodeId) -> bool {
        let Some(existing) = self.records.get_mut(key).and_then(|per_key| per_key.get_mut(creator)) else {
            return false;
        };
        existing.deleted = true;
        true
    }

    /// Flag every entry under `key` as stale (or fresh again).
    pub fn set_stale(&mut self, key: &NodeId, stale: bool) {
        let Some(per_key) = self.records.get_mut(key) else {
            return;
        };
        for creator in per_key.keys() {
            if let Some(existing) = per_key.get_mut(&creator) {
                existing.stale = stale;
            }
        }
    }

    /// Every live entry, deleted markers included.
    pub fn entries(&mut self) -> Vec<StoredRecordEntry> {
        self.remove_expired();
        self.records
            .values()
            .flat_map(|per_key| per_key.values().into_iter().cloned())
            .collect()
    }

    /// Number of keys whose entries are flagged stale.
    pub fn stale_key_count(&self) -> usize {
        self.records
            .values()
            .filter(|per_key| per_key.values().iter().any(|e| e.stale))
            .count()
    }

    pub fn keys(&self) -> Vec<NodeId> {
        self.records.keys().copied().collect()
    }

    pub fn remove_expired(&mut self) -> usize {
        let mut removed = 0;
        self.records.retain(|_, per_key| {
            removed += per_key.remove_expired();
            !per_key.is_empty()
        });
        removed
    }

    pub fn key_count(&self) -> usize {
        self.records.len()
    }

    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }
}
