//! # Probabilistic Duplicate Suppression
//!
//! Routed and flooded payloads arrive at much higher volume than request ids,
//! so exact tracking ([`crate::duplicate::DuplicateDetector`]) is too
//! expensive for them. [`RouterDuplicateDetector`] instead keeps a rotating
//! pair of fixed-size Bloom filters:
//!
//! ```text
//!   counter:  0 ........ fill_threshold ........ reset_threshold
//!   current:  [ every add ---------------------------------------> ]
//!   next:                [ every add (pre-warm) -----------------> ]
//!                                                 rotate: current := next
//! ```
//!
//! The `next` filter is created lazily once `counter >= fill_threshold` and
//! mirrors every later insertion. When `counter` reaches `reset_threshold`
//! the filters rotate *before* the triggering value is inserted, so recent
//! values survive the rotation.
//!
//! ## Guarantees
//!
//! - No false negatives for values added since the last rotation, nor for
//!   values added after `fill_threshold` in the cycle before it.
//! - False positives are possible; a positive `test()` must only be used to
//!   drop traffic that tolerates occasional loss (flood routing), never for
//!   request/response correlation.
//!
//! Pre-warming doubles the insert cost during the last
//! `reset_threshold - fill_threshold` inserts of each cycle. Setting
//! `fill_threshold == reset_threshold` disables it at the price of an empty
//! filter right after each rotation.

use serde::Deserialize;

/// Insertions per cycle in the default configuration.
pub const DEFAULT_RESET_THRESHOLD: usize = 100_000;

/// Insertion count at which the `next` filter starts pre-warming.
pub const DEFAULT_FILL_THRESHOLD: usize = 90_000;

/// Target false-positive probability of the default configuration at
/// `2 * DEFAULT_RESET_THRESHOLD - DEFAULT_FILL_THRESHOLD` insertions.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 1e-4;

#[derive(Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    bits: usize,
    hash_functions: u32,
}

impl BloomFilter {
    pub fn new(bits: usize, hash_functions: u32) -> Self {
        let bits = bits.max(1);
        Self {
            words: vec![0u64; bits.div_ceil(64)],
            bits,
            hash_functions: hash_functions.max(1),
        }
    }

    /// `(bits, hash_functions)` keeping the false-positive probability under
    /// `false_positive_rate` after `capacity` insertions.
    pub fn optimal_params(capacity: usize, false_positive_rate: f64) -> (usize, u32) {
        let n = capacity.max(1) as f64;
        let p = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let bits = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(64.0);
        let hash_functions = ((bits / n) * ln2).round().max(1.0);
        (bits as usize, hash_functions as u32)
    }

    pub fn with_capacity(capacity: usize, false_positive_rate: f64) -> Self {
        let (bits, hash_functions) = Self::optimal_params(capacity, false_positive_rate);
        Self::new(bits, hash_functions)
    }

    pub fn insert(&mut self, value: &[u8]) {
        let (h1, h2) = Self::hash_pair(value);
        for i in 0..self.hash_functions as u64 {
            let bit = self.index(h1, h2, i);
            self.words[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    pub fn contains(&self, value: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(value);
        (0..self.hash_functions as u64).all(|i| {
            let bit = self.index(h1, h2, i);
            self.words[bit / 64] & (1u64 << (bit % 64)) != 0
        })
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn hash_functions(&self) -> u32 {
        self.hash_functions
    }

    #[inline]
    fn index(&self, h1: u64, h2: u64, i: u64) -> usize {
        (h1.wrapping_add(i.wrapping_mul(h2)) % self.bits as u64) as usize
    }

    /// Double hashing: two independent 64-bit halves of one BLAKE3 digest.
    fn hash_pair(value: &[u8]) -> (u64, u64) {
        let digest = blake3::hash(value);
        let bytes = digest.as_bytes();
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&bytes[..8]);
        second.copy_from_slice(&bytes[8..16]);
        (u64::from_le_bytes(first), u64::from_le_bytes(second) | 1)
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bits", &self.bits)
            .field("hash_functions", &self.hash_functions)
            .finish()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RouterDuplicateDetectorConfig {
    pub bits: usize,
    pub hash_functions: u32,
    pub fill_threshold: usize,
    pub reset_threshold: usize,
}

impl RouterDuplicateDetectorConfig {
    /// Size both filters for `reset_threshold` insertions per cycle at the
    /// given false-positive probability.
    pub fn sized_for(reset_threshold: usize, fill_threshold: usize, false_positive_rate: f64) -> Self {
        let worst_case = reset_threshold + reset_threshold.saturating_sub(fill_threshold);
        let (bits, hash_functions) = BloomFilter::optimal_params(worst_case, false_positive_rate);
        Self {
            bits,
            hash_functions,
            fill_threshold: fill_threshold.min(reset_threshold),
            reset_threshold,
        }
    }
}

impl Default for RouterDuplicateDetectorConfig {
    fn default() -> Self {
        Self::sized_for(
            DEFAULT_RESET_THRESHOLD,
            DEFAULT_FILL_THRESHOLD,
            DEFAULT_FALSE_POSITIVE_RATE,
        )
    }
}

#[derive(Debug)]
pub struct RouterDuplicateDetector {
    current: BloomFilter,
    next: Option<BloomFilter>,
    counter: usize,
    config: RouterDuplicateDetectorConfig,
}

impl RouterDuplicateDetector {
    pub fn new(bits: usize, hash_functions: u32, fill_threshold: usize, reset_threshold: usize) -> Self {
        Self::from_config(RouterDuplicateDetectorConfig {
            bits,
            hash_functions,
            fill_threshold,
            reset_threshold,
        })
    }

    pub fn from_config(config: RouterDuplicateDetectorConfig) -> Self {
        Self {
            current: BloomFilter::new(config.bits, config.hash_functions),
            next: None,
            counter: 0,
            config,
        }
    }

    pub fn add(&mut self, value: &str) {
        if self.counter >= self.config.reset_threshold {
            self.current = self
                .next
                .take()
                .unwrap_or_else(|| BloomFilter::new(self.config.bits, self.config.hash_functions));
            self.counter = 0;
        }

        self.current.insert(value.as_bytes());

        if self.counter >= self.config.fill_threshold {
            let (bits, hash_functions) = (self.config.bits, self.config.hash_functions);
            self.next
                .get_or_insert_with(|| BloomFilter::new(bits, hash_functions))
                .insert(value.as_bytes());
        }

        self.counter += 1;
    }

    pub fn test(&self, value: &str) -> bool {
        self.current.contains(value.as_bytes())
    }

    /// Insertions since the last rotation.
    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn is_prewarming(&self) -> bool {
        self.next.is_some()
    }
}

impl Default for RouterDuplicateDetector {
    fn default() -> Self {
        Self::from_config(RouterDuplicateDetectorConfig::default())
    }
}
