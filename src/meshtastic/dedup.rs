//! Duplicate packet suppression.
//!
//! The same packet reaches the broker once per gateway that heard it, and the broker may
//! redeliver on QoS 1 retries. `(packet id, sender)` pairs seen within the window are
//! reported as repeats. The cache is bounded two ways: entries older than the window are
//! expired on every call, and when the cache is full the oldest entry is evicted.
//!
//! State is in-memory only; a restart forgets everything, so a packet redelivered across
//! a restart is relayed again.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(600);
pub const DEFAULT_CAPACITY: usize = 100;

type PacketKey = (u32, u32);

#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    capacity: usize,
    seen: HashMap<PacketKey, Instant>,
    order: VecDeque<(PacketKey, Instant)>,
}

impl DedupCache {
    /// A zero capacity is treated as 1 so a packet is always remembered at least until
    /// the next one arrives.
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window,
            capacity,
            seen: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record an observation. Returns `true` the first time a pair is seen within the
    /// window, `false` for repeats.
    pub fn observe(&mut self, packet_id: u32, sender_id: u32, now: Instant) -> bool {
        self.expire(now);
        let key = (packet_id, sender_id);
        if self.seen.contains_key(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key, now);
        self.order.push_back((key, now));
        true
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(key, at)) = self.order.front() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_inside_window_is_suppressed() {
        let mut cache = DedupCache::new(Duration::from_secs(60), 10);
        let t0 = Instant::now();
        assert!(cache.observe(42, 7, t0));
        assert!(!cache.observe(42, 7, t0 + Duration::from_secs(1)));
        assert!(!cache.observe(42, 7, t0 + Duration::from_secs(59)));
    }

    #[test]
    fn same_id_from_different_senders_is_distinct() {
        let mut cache = DedupCache::default();
        let t0 = Instant::now();
        assert!(cache.observe(42, 7, t0));
        assert!(cache.observe(42, 8, t0));
        assert!(cache.observe(43, 7, t0));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn entries_expire_after_window() {
        let mut cache = DedupCache::new(Duration::from_secs(60), 10);
        let t0 = Instant::now();
        assert!(cache.observe(42, 7, t0));
        assert!(cache.observe(42, 7, t0 + Duration::from_secs(60)));
        // the re-observation starts a fresh window
        assert!(!cache.observe(42, 7, t0 + Duration::from_secs(61)));
    }

    #[test]
    fn oldest_entry_is_evicted_when_full() {
        let mut cache = DedupCache::new(Duration::from_secs(3600), 3);
        let t0 = Instant::now();
        for id in 1..=3 {
            assert!(cache.observe(id, 7, t0));
        }
        assert!(cache.observe(4, 7, t0 + Duration::from_secs(1)));
        assert_eq!(cache.len(), 3);
        // 1 was the oldest and is forgotten; 2..=4 are still remembered
        assert!(cache.observe(1, 7, t0 + Duration::from_secs(2)));
        assert!(!cache.observe(3, 7, t0 + Duration::from_secs(2)));
        assert!(!cache.observe(4, 7, t0 + Duration::from_secs(2)));
    }

    #[test]
    fn expiry_runs_on_every_observe() {
        let mut cache = DedupCache::new(Duration::from_secs(10), 100);
        let t0 = Instant::now();
        for id in 0..50 {
            cache.observe(id, 1, t0);
        }
        assert_eq!(cache.len(), 50);
        cache.observe(999, 1, t0 + Duration::from_secs(11));
        assert_eq!(cache.len(), 1);
        assert!(!cache.is_empty());
    }
}
