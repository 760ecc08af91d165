//! Exact duplicate detection for request identifiers.
//!
//! Bounded both by count and by age. Both bounds are enforced on every
//! insertion, so memory never exceeds `max_count` entries regardless of how
//! rarely the detector is queried.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use serde::Deserialize;
use tokio::time::Instant;

use crate::identity::NodeId;

/// Default number of remembered identifiers.
pub const DEFAULT_MAX_COUNT: usize = 10_000;

/// Default retention for a remembered identifier.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(100);

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DuplicateDetectorConfig {
    pub max_count: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub max_age: Duration,
}

impl Default for DuplicateDetectorConfig {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_MAX_COUNT,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SeenEntry {
    pub seen_at: Instant,
    pub sender: NodeId,
    pub metadata: Option<String>,
}

pub struct DuplicateDetector {
    seen: LruCache<String, SeenEntry>,
    max_age: Duration,
}

impl DuplicateDetector {
    pub fn new(max_count: usize, max_age: Duration) -> Self {
        let cap = NonZeroUsize::new(max_count).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(cap),
            max_age,
        }
    }

    pub fn from_config(config: &DuplicateDetectorConfig) -> Self {
        Self::new(config.max_count, config.max_age)
    }

    /// Record `value`. Re-adding a known value refreshes its recency and timestamp.
    pub fn add(&mut self, value: impl Into<String>, sender: NodeId, metadata: Option<String>) {
        let now = Instant::now();
        self.seen.put(
            value.into(),
            SeenEntry {
                seen_at: now,
                sender,
                metadata,
            },
        );
        self.evict_aged(now);
    }

    pub fn is_likely_duplicate(&self, value: &str) -> bool {
        self.seen
            .peek(value)
            .is_some_and(|entry| Instant::now().duration_since(entry.seen_at) <= self.max_age)
    }

    pub fn get(&self, value: &str) -> Option<&SeenEntry> {
        self.seen.peek(value)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    fn evict_aged(&mut self, now: Instant) {
        while let Some((_, oldest)) = self.seen.peek_lru() {
            if now.duration_since(oldest.seen_at) <= self.max_age {
                break;
            }
            self.seen.pop_lru();
        }
    }
}
