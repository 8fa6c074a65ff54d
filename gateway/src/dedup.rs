//! Bounded, per-connection cache of recently delivered dispatch hashes (§4.1).
//!
//! Eviction is FIFO over insertion order, not LRU: dispatch hashes are
//! short-lived and predictable, so the bookkeeping cost of true LRU isn't
//! justified. Not thread-safe by design — owned exclusively by the single
//! task that handles a session's inbound dispatches.

use std::collections::{HashSet, VecDeque};

/// Default ring capacity: ~8 KiB per session at 4 bytes/hash.
pub const DEFAULT_CAPACITY: usize = 2048;

#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    seen: HashSet<u32>,
    ring: VecDeque<u32>,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl DedupCache {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            ring: VecDeque::new(),
        }
    }

    /// Inserts `h`. Returns `true` iff it was not already present.
    ///
    /// Invariant maintained: `self.seen.len() <= self.capacity` after return.
    pub fn add_dispatch(&mut self, h: u32) -> bool {
        if !self.seen.insert(h) {
            return false;
        }
        self.ring.push_back(h);

        while self.seen.len() > self.capacity {
            match self.ring.pop_front() {
                Some(evicted) => {
                    self.seen.remove(&evicted);
                }
                None => break,
            }
        }
        true
    }

    #[must_use]
    pub fn has_dispatch(&self, h: u32) -> bool {
        self.seen.contains(&h)
    }

    /// Force-removes `h`, used by the `remove_hashes` dispatch effect.
    ///
    /// The ring entry (if any) is left in place; it is a harmless stale
    /// slot that will be skipped on eviction since `seen` no longer has it.
    pub fn expire_dispatch(&mut self, h: u32) {
        self.seen.remove(&h);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_dispatch_reports_true_exactly_once() {
        let mut cache = DedupCache::with_capacity(10);
        assert!(cache.add_dispatch(42));
        assert!(!cache.add_dispatch(42));
        assert!(!cache.add_dispatch(42));
    }

    #[test]
    fn eviction_is_fifo_and_respects_capacity() {
        let mut cache = DedupCache::with_capacity(3);
        cache.add_dispatch(1);
        cache.add_dispatch(2);
        cache.add_dispatch(3);
        assert_eq!(cache.len(), 3);

        // Inserting a 4th evicts the oldest (1), not an LRU victim.
        cache.add_dispatch(4);
        assert_eq!(cache.len(), 3);
        assert!(!cache.has_dispatch(1));
        assert!(cache.has_dispatch(2));
        assert!(cache.has_dispatch(3));
        assert!(cache.has_dispatch(4));
    }

    #[test]
    fn expire_dispatch_allows_reinsertion() {
        let mut cache = DedupCache::with_capacity(10);
        cache.add_dispatch(7);
        assert!(cache.has_dispatch(7));
        cache.expire_dispatch(7);
        assert!(!cache.has_dispatch(7));
        assert!(cache.add_dispatch(7));
    }

    #[test]
    fn expire_dispatch_on_absent_hash_is_a_no_op() {
        let mut cache = DedupCache::with_capacity(10);
        cache.expire_dispatch(99);
        assert!(cache.is_empty());
    }
}
