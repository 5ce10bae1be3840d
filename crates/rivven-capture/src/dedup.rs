//! # Event deduplication
//!
//! Bounded set of recently seen content hashes.
//!
//! ## Eviction policies
//!
//! - **TrimHalf** (default): once the set grows past capacity it is cut down
//!   to half its size in arbitrary order. Cheap, but may forget a recent hash
//!   while keeping an old one.
//! - **Recency**: strict LRU-by-insertion; the oldest hashes go first, down
//!   to capacity.
//!
//! Membership is best-effort: an evicted hash is no longer recognised, so a
//! late replay of that mutation is delivered again.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Eviction policy once the set exceeds its capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Keep `len / 2` entries, arbitrary order
    #[default]
    TrimHalf,
    /// Evict oldest-inserted first, down to capacity
    Recency,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    seen_at: Instant,
}

/// Counters of a [`DedupSet`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub checked: u64,
    pub duplicates: u64,
    pub evicted: u64,
    pub trims: u64,
}

impl DedupStats {
    /// Duplicate rate (0.0 - 1.0).
    pub fn duplicate_rate(&self) -> f64 {
        if self.checked == 0 {
            return 0.0;
        }
        self.duplicates as f64 / self.checked as f64
    }
}

/// Bounded set of content hashes.
#[derive(Debug)]
pub struct DedupSet {
    capacity: usize,
    policy: EvictionPolicy,
    entries: HashMap<String, Entry>,
    // Insertion order for Recency. Stale (seq-mismatched) keys are skipped.
    order: VecDeque<(u64, String)>,
    next_seq: u64,
    stats: DedupStats,
}

impl DedupSet {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            policy,
            entries: HashMap::with_capacity(capacity.min(65_536)),
            order: VecDeque::new(),
            next_seq: 0,
            stats: DedupStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    /// Record `hash`; returns `true` when it was already present.
    pub fn check_and_insert(&mut self, hash: &str) -> bool {
        self.stats.checked += 1;
        if self.entries.contains_key(hash) {
            self.stats.duplicates += 1;
            return true;
        }
        self.insert(hash);
        false
    }

    /// Insert without counting a check. Evicts once over capacity.
    pub fn insert(&mut self, hash: &str) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            hash.to_string(),
            Entry {
                seq,
                seen_at: Instant::now(),
            },
        );
        if self.policy == EvictionPolicy::Recency {
            self.order.push_back((seq, hash.to_string()));
        }

        if self.entries.len() > self.capacity {
            self.evict();
        }
        self.compact_order();
    }

    /// Forget `hash` so a later replay is not treated as a duplicate.
    pub fn remove(&mut self, hash: &str) -> bool {
        let removed = self.entries.remove(hash).is_some();
        if removed {
            self.compact_order();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Drop entries older than `max_age`. Only the Recency policy tracks
    /// meaningful age, so this is a no-op under TrimHalf.
    pub fn expire_older_than(&mut self, max_age: Duration) -> usize {
        if self.policy != EvictionPolicy::Recency {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|_, e| e.seen_at.elapsed() <= max_age);
        self.retain_live_order();
        let removed = before - self.entries.len();
        self.stats.evicted += removed as u64;
        removed
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    /// Recency records of removed or re-inserted keys stay in `order` until
    /// evicted; drop them once they outnumber live entries.
    fn compact_order(&mut self) {
        if self.order.len() > 2 * self.entries.len().max(self.capacity) {
            self.retain_live_order();
        }
    }

    fn retain_live_order(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(seq, key)| entries.get(key).is_some_and(|e| e.seq == *seq));
    }

    fn evict(&mut self) {
        let before = self.entries.len();
        match self.policy {
            EvictionPolicy::TrimHalf => {
                let keep = before / 2;
                let victims: Vec<String> =
                    self.entries.keys().take(before - keep).cloned().collect();
                for key in victims {
                    self.entries.remove(&key);
                }
                self.stats.trims += 1;
            }
            EvictionPolicy::Recency => {
                while self.entries.len() > self.capacity {
                    let Some((seq, key)) = self.order.pop_front() else {
                        break;
                    };
                    if self.entries.get(&key).is_some_and(|e| e.seq == seq) {
                        self.entries.remove(&key);
                    }
                }
            }
        }
        let evicted = before - self.entries.len();
        self.stats.evicted += evicted as u64;
        debug!(
            "Dedup eviction ({:?}): {} -> {} entries",
            self.policy,
            before,
            self.entries.len()
        );
    }
}
