//! ARC (Adaptive Replacement Cache) memory tier
//!
//! Balances recency and frequency with four lists:
//! - T1: entries seen once (recency, LRU order)
//! - T2: entries reused (frequency, LRU order)
//! - B1/B2: ghost lists of evicted keys (no values)
//!
//! The adaptive parameter `p` is the target size for T1, bounded [0, C].
//! A ghost hit in B1 grows `p` (recency matters), a ghost hit in B2
//! shrinks it (frequency matters).

use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::core::types::Tier;

/// An entry evicted from the memory tier with its value still in hand.
/// The controller flushes it to the active partition's write buffer
/// before the value is dropped; ghost lists retain the key only.
#[derive(Debug)]
pub struct Demoted {
    pub key: String,
    pub value: Vec<u8>,
}

/// In-memory eviction engine implementing the ARC algorithm
pub struct ArcTier {
    capacity: usize,

    /// Target size for T1
    p: usize,

    /// T1: recently seen once
    t1: HashMap<String, Vec<u8>>,
    /// T1 LRU ordering (front = LRU, back = MRU)
    t1_order: VecDeque<String>,

    /// T2: reused entries
    t2: HashMap<String, Vec<u8>>,
    /// T2 LRU ordering (front = LRU, back = MRU)
    t2_order: VecDeque<String>,

    /// Ghost of keys evicted from T1
    b1: VecDeque<String>,
    /// Ghost of keys evicted from T2
    b2: VecDeque<String>,
}

impl ArcTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: capacity / 2,
            t1: HashMap::new(),
            t1_order: VecDeque::new(),
            t2: HashMap::new(),
            t2_order: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
        }
    }

    /// Look up a key. A T1 hit promotes the entry to the MRU end of T2,
    /// a T2 hit refreshes its MRU position. Ghost membership is invisible
    /// to callers and only affects adaptation inside `put`.
    pub fn get(&mut self, key: &str) -> Option<(Vec<u8>, Tier)> {
        if let Some(value) = self.t1.remove(key) {
            self.t1_order.retain(|k| k != key);
            self.t2.insert(key.to_string(), value.clone());
            self.t2_order.push_back(key.to_string());
            return Some((value, Tier::Recent));
        }

        if let Some(value) = self.t2.get(key) {
            let value = value.clone();
            self.t2_order.retain(|k| k != key);
            self.t2_order.push_back(key.to_string());
            return Some((value, Tier::Frequent));
        }

        None
    }

    /// Insert or update a key, running the ARC decision table.
    /// Returns any entries demoted out of memory so the caller can
    /// schedule their write-behind flush.
    pub fn put(&mut self, key: String, value: Vec<u8>) -> Vec<Demoted> {
        let mut demoted = Vec::new();

        if self.capacity == 0 {
            return demoted;
        }

        // Case 1: resident in T1 or T2 - update in place, move to T2 MRU
        if self.t1.remove(&key).is_some() {
            self.t1_order.retain(|k| k != &key);
            self.t2.insert(key.clone(), value);
            self.t2_order.push_back(key);
            return demoted;
        }
        if self.t2.contains_key(&key) {
            self.t2.insert(key.clone(), value);
            self.t2_order.retain(|k| k != &key);
            self.t2_order.push_back(key);
            return demoted;
        }

        // Case 2: ghost hit in B1 - recency history, grow the T1 target
        if self.b1.contains(&key) {
            let delta = (self.b2.len() / self.b1.len()).max(1);
            self.p = (self.p + delta).min(self.capacity);
            if let Some(d) = self.replace(false) {
                demoted.push(d);
            }
            self.b1.retain(|k| k != &key);
            self.t2.insert(key.clone(), value);
            self.t2_order.push_back(key);
            return demoted;
        }

        // Case 3: ghost hit in B2 - frequency history, shrink the T1 target
        if self.b2.contains(&key) {
            let delta = (self.b1.len() / self.b2.len()).max(1);
            self.p = self.p.saturating_sub(delta);
            if let Some(d) = self.replace(true) {
                demoted.push(d);
            }
            self.b2.retain(|k| k != &key);
            self.t2.insert(key.clone(), value);
            self.t2_order.push_back(key);
            return demoted;
        }

        // Case 4: key in none of the four lists
        if self.t1.len() + self.b1.len() >= self.capacity {
            if self.t1.len() < self.capacity {
                self.b1.pop_front();
                if let Some(d) = self.replace(false) {
                    demoted.push(d);
                }
            } else if let Some(d) = self.evict_t1_lru() {
                // T1 holds the whole of its allowance; drop its LRU
                demoted.push(d);
            }
        } else if self.total_len() >= 2 * self.capacity {
            self.b2.pop_front();
            if let Some(d) = self.replace(false) {
                demoted.push(d);
            }
        }

        self.t1.insert(key.clone(), value);
        self.t1_order.push_back(key);

        // History may not outgrow 2C in total
        while self.total_len() > 2 * self.capacity {
            if self.b1.len() >= self.b2.len() {
                if self.b1.pop_front().is_none() {
                    break;
                }
            } else if self.b2.pop_front().is_none() {
                break;
            }
        }

        demoted
    }

    /// REPLACE: pick the eviction victim based on the adaptive target.
    /// Evicts the T1 LRU into B1 when T1 is over target (or exactly at
    /// target on a B2 arrival), otherwise the T2 LRU into B2.
    fn replace(&mut self, via_b2: bool) -> Option<Demoted> {
        let t1_len = self.t1_order.len();
        if t1_len >= 1 && (t1_len > self.p || (via_b2 && t1_len == self.p)) {
            self.evict_t1_lru()
        } else if !self.t2_order.is_empty() {
            self.evict_t2_lru()
        } else {
            self.evict_t1_lru()
        }
    }

    fn evict_t1_lru(&mut self) -> Option<Demoted> {
        let key = self.t1_order.pop_front()?;
        let value = self.t1.remove(&key)?;
        debug!("ARC evict T1 -> B1: {}", key);
        self.b1.push_back(key.clone());
        if self.b1.len() > self.capacity {
            self.b1.pop_front();
        }
        Some(Demoted { key, value })
    }

    fn evict_t2_lru(&mut self) -> Option<Demoted> {
        let key = self.t2_order.pop_front()?;
        let value = self.t2.remove(&key)?;
        debug!("ARC evict T2 -> B2: {}", key);
        self.b2.push_back(key.clone());
        if self.b2.len() > self.capacity {
            self.b2.pop_front();
        }
        Some(Demoted { key, value })
    }

    /// Remove a key from every list, including ghost history
    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        if let Some(value) = self.t1.remove(key) {
            self.t1_order.retain(|k| k != key);
            return Some(value);
        }
        if let Some(value) = self.t2.remove(key) {
            self.t2_order.retain(|k| k != key);
            return Some(value);
        }
        self.b1.retain(|k| k != key);
        self.b2.retain(|k| k != key);
        None
    }

    /// Resident entries (T1 + T2)
    pub fn len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t1.is_empty() && self.t2.is_empty()
    }

    fn total_len(&self) -> usize {
        self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn p(&self) -> usize {
        self.p
    }

    pub fn t1_len(&self) -> usize {
        self.t1.len()
    }

    pub fn t2_len(&self) -> usize {
        self.t2.len()
    }

    pub fn b1_len(&self) -> usize {
        self.b1.len()
    }

    pub fn b2_len(&self) -> usize {
        self.b2.len()
    }

    #[cfg(test)]
    fn t1_keys(&self) -> Vec<String> {
        // MRU first
        self.t1_order.iter().rev().cloned().collect()
    }

    #[cfg(test)]
    fn t2_keys(&self) -> Vec<String> {
        self.t2_order.iter().rev().cloned().collect()
    }

    #[cfg(test)]
    fn b1_keys(&self) -> Vec<String> {
        self.b1.iter().rev().cloned().collect()
    }
}
