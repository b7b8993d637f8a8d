//! Absolute-deadline timeout queue. Keyed by `(deadline, insertion order)`
//! so that two operations due at the same instant fire in the order they
//! were queued, and removal of a specific operation (on cancel or on normal
//! completion) is `O(log n)` via the stable key instead of a linear scan.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::util::Handle;

pub(crate) struct TimeoutQueue {
    entries: BTreeMap<(Instant, u64), Handle>,
    next_seq: u64,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        TimeoutQueue { entries: BTreeMap::new(), next_seq: 0 }
    }

    /// Reserves the next insertion-order sequence number, to be stored on
    /// the `PendingOp` before it (and this queue) learn about each other.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    pub fn insert(&mut self, deadline: Instant, seq: u64, handle: Handle) {
        self.entries.insert((deadline, seq), handle);
    }

    pub fn remove(&mut self, deadline: Instant, seq: u64) {
        self.entries.remove(&(deadline, seq));
    }

    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every entry whose deadline is `<= now`, in
    /// deadline/insertion order.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<Handle> {
        let expired: Vec<(Instant, u64)> =
            self.entries.range(..=(now, u64::MAX)).map(|(k, _)| *k).collect();
        expired.into_iter().filter_map(|k| self.entries.remove(&k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Slab;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_then_insertion_order() {
        let mut slab: Slab<&'static str> = Slab::new();
        let mut q = TimeoutQueue::new();
        let base = Instant::now();

        let h_later = slab.insert("later");
        let seq = q.next_seq();
        q.insert(base + Duration::from_millis(50), seq, h_later);

        let h_first = slab.insert("first");
        let seq = q.next_seq();
        q.insert(base + Duration::from_millis(10), seq, h_first);

        let h_tied = slab.insert("tied-but-later-insert");
        let seq = q.next_seq();
        q.insert(base + Duration::from_millis(50), seq, h_tied);

        let expired = q.drain_expired(base + Duration::from_millis(100));
        let order: Vec<&str> = expired.iter().map(|h| *slab.get(*h).unwrap()).collect();
        assert_eq!(order, vec!["first", "later", "tied-but-later-insert"]);
    }
}
