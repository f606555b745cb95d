//! Keyed delay queue: a min-heap of `(fire_at, key)` with lazy deletion.
//!
//! At most one live deadline exists per key. Rescheduling a key pushes a new
//! heap entry and supersedes the old one; cancelled or superseded entries are
//! skipped when they reach the top. Uses `tokio::time::Instant` so tests can
//! drive it with a paused clock.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

use tokio::time::Instant;

struct Entry<K> {
    fire_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl<K> Eq for Entry<K> {}

impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Entry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.fire_at, self.seq).cmp(&(other.fire_at, other.seq))
    }
}

/// Min-heap of deadlines keyed by `K`, last write wins per key.
pub struct DelayQueue<K> {
    heap: BinaryHeap<Reverse<Entry<K>>>,
    live: HashMap<K, (Instant, u64)>,
    next_seq: u64,
}

impl<K: Clone + Eq + Hash> Default for DelayQueue<K> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<K: Clone + Eq + Hash> DelayQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) `key` to fire at `fire_at`, replacing any earlier deadline.
    pub fn schedule(&mut self, key: K, fire_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(key.clone(), (fire_at, seq));
        self.heap.push(Reverse(Entry { fire_at, seq, key }));
    }

    /// Disarm `key`. Returns whether it was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.live.remove(key).is_some()
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.live.get(key).map(|(at, _)| *at)
    }

    /// Number of live (armed) keys.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Earliest live deadline, discarding stale heap entries on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.is_live(entry) {
                return Some(entry.fire_at);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.fire_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if self.is_live(&entry) {
                self.live.remove(&entry.key);
                expired.push(entry.key);
            }
        }
        expired
    }

    fn is_live(&self, entry: &Entry<K>) -> bool {
        self.live.get(&entry.key) == Some(&(entry.fire_at, entry.seq))
    }
}
