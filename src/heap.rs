//! Array-backed min-heap of pending timer deadlines.
//!
//! Every entry carries its own position in the backing array, so a timer can
//! be pulled out of the middle of the heap in O(log n) without a lookup
//! table. All methods assume the owning clock's lock is held; the position
//! is stored in an atomic only so that entries can be shared with timer
//! handles, the lock is what orders the writes.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

/// Position sentinel for an entry that is not in the heap.
pub(crate) const NOT_IN_HEAP: usize = usize::MAX;

/// State shared between a timer handle and the heap.
#[derive(Debug)]
pub(crate) struct Entry {
    index: AtomicUsize,
    tx: mpsc::Sender<Instant>,
}

impl Entry {
    pub(crate) fn new(tx: mpsc::Sender<Instant>) -> Arc<Self> {
        Arc::new(Entry {
            index: AtomicUsize::new(NOT_IN_HEAP),
            tx,
        })
    }

    /// True while the entry sits in a heap, waiting to fire.
    pub(crate) fn is_pending(&self) -> bool {
        self.index() != NOT_IN_HEAP
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Instant> {
        &self.tx
    }

    fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Relaxed);
    }
}

struct Node {
    when: Instant,
    seq: u64,
    entry: Arc<Entry>,
}

impl Node {
    /// Equal deadlines fire in insertion order.
    fn key(&self) -> (Instant, u64) {
        (self.when, self.seq)
    }
}

#[derive(Default)]
pub(crate) struct DeadlineHeap {
    nodes: Vec<Node>,
    next_seq: u64,
}

impl DeadlineHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Schedule `entry` at `when`. Returns true if it became the earliest
    /// deadline, meaning the dispatcher has to recompute its sleep.
    pub(crate) fn insert(&mut self, when: Instant, entry: Arc<Entry>) -> bool {
        debug_assert!(!entry.is_pending(), "entry inserted twice");

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let index = self.nodes.len();
        entry.set_index(index);
        self.nodes.push(Node { when, seq, entry });
        self.sift_up(index) == 0
    }

    /// Remove `entry` from the heap, returning the deadline it had.
    /// Returns `None` if the entry was not pending here.
    pub(crate) fn remove(&mut self, entry: &Entry) -> Option<Instant> {
        let index = self.position_of(entry)?;
        Some(self.remove_at(index).when)
    }

    pub(crate) fn peek_min(&self) -> Option<Instant> {
        self.nodes.first().map(|node| node.when)
    }

    pub(crate) fn pop_min(&mut self) -> Option<(Instant, Arc<Entry>)> {
        if self.is_empty() {
            return None;
        }
        let node = self.remove_at(0);
        Some((node.when, node.entry))
    }

    /// Pop the earliest entry if its deadline is at or before `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<(Instant, Arc<Entry>)> {
        match self.peek_min() {
            Some(when) if when <= now => self.pop_min(),
            _ => None,
        }
    }

    pub(crate) fn deadline_of(&self, entry: &Entry) -> Option<Instant> {
        self.position_of(entry).map(|index| self.nodes[index].when)
    }

    fn position_of(&self, entry: &Entry) -> Option<usize> {
        let index = entry.index();
        self.nodes
            .get(index)
            .filter(|node| ptr::eq(Arc::as_ptr(&node.entry), entry))
            .map(|_| index)
    }

    fn remove_at(&mut self, index: usize) -> Node {
        let node = self.nodes.swap_remove(index);
        node.entry.set_index(NOT_IN_HEAP);

        if index < self.nodes.len() {
            self.nodes[index].entry.set_index(index);
            let index = self.sift_up(index);
            self.sift_down(index);
        }
        node
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.nodes[a].key() < self.nodes[b].key()
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.nodes.swap(a, b);
        self.nodes[a].entry.set_index(a);
        self.nodes[b].entry.set_index(b);
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
        index
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.nodes.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, index) {
                break;
            }
            self.swap(index, child);
            index = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry() -> Arc<Entry> {
        let (tx, _rx) = mpsc::channel(1);
        Entry::new(tx)
    }

    fn assert_consistent(heap: &DeadlineHeap) {
        for (index, node) in heap.nodes.iter().enumerate() {
            assert_eq!(node.entry.index(), index, "stale position at {}", index);
            if index > 0 {
                let parent = (index - 1) / 2;
                assert!(heap.nodes[parent].key() <= node.key(), "heap order at {}", index);
            }
        }
    }

    #[test]
    fn test_pop_min_in_deadline_order() {
        let base = Instant::now();
        let mut heap = DeadlineHeap::new();

        // Permutation of 0..97 without pulling in an rng.
        for i in 0..97u64 {
            let offset = (i * 37) % 97;
            heap.insert(base + Duration::from_millis(offset), entry());
            assert_consistent(&heap);
        }
        assert_eq!(heap.len(), 97);

        let mut last = None;
        while let Some((when, entry)) = heap.pop_min() {
            assert!(!entry.is_pending());
            if let Some(last) = last {
                assert!(last <= when);
            }
            last = Some(when);
            assert_consistent(&heap);
        }
        assert!(heap.is_empty());
        assert_eq!(heap.peek_min(), None);
    }

    #[test]
    fn test_insert_reports_new_minimum() {
        let base = Instant::now();
        let mut heap = DeadlineHeap::new();

        assert!(heap.insert(base + Duration::from_secs(5), entry()));
        assert!(!heap.insert(base + Duration::from_secs(7), entry()));
        assert!(heap.insert(base + Duration::from_secs(1), entry()));
        // Equal to the current minimum, but later in insertion order.
        assert!(!heap.insert(base + Duration::from_secs(1), entry()));
        assert_eq!(heap.peek_min(), Some(base + Duration::from_secs(1)));
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let when = Instant::now();
        let mut heap = DeadlineHeap::new();
        let entries: Vec<_> = (0..16).map(|_| entry()).collect();
        for e in &entries {
            heap.insert(when, e.clone());
        }

        for expected in &entries {
            let (_, popped) = heap.pop_min().unwrap();
            assert!(Arc::ptr_eq(expected, &popped));
        }
    }

    #[test]
    fn test_remove_arbitrary_entries() {
        let base = Instant::now();
        let mut heap = DeadlineHeap::new();
        let entries: Vec<_> = (0..64u64)
            .map(|i| {
                let e = entry();
                heap.insert(base + Duration::from_millis((i * 13) % 64), e.clone());
                (base + Duration::from_millis((i * 13) % 64), e)
            })
            .collect();

        for (when, e) in entries.iter().step_by(3) {
            assert_eq!(heap.deadline_of(e), Some(*when));
            assert_eq!(heap.remove(e), Some(*when));
            assert!(!e.is_pending());
            assert_eq!(heap.deadline_of(e), None);
            assert_consistent(&heap);
        }

        // Removing twice is a miss, not a corruption.
        let (_, removed) = &entries[0];
        assert_eq!(heap.remove(removed), None);
        assert_consistent(&heap);

        let remaining = entries.len() - entries.iter().step_by(3).count();
        assert_eq!(heap.len(), remaining);
        for (_, e) in entries.iter().skip(1).step_by(3) {
            assert!(e.is_pending());
        }
    }

    #[test]
    fn test_remove_foreign_entry_is_a_miss() {
        let now = Instant::now();
        let mut heap = DeadlineHeap::new();
        let mut other = DeadlineHeap::new();
        heap.insert(now, entry());
        let foreign = entry();
        other.insert(now, foreign.clone());

        // Same stored position (0), different heap.
        assert_eq!(heap.remove(&foreign), None);
        assert_eq!(heap.len(), 1);
        assert!(foreign.is_pending());
    }

    #[test]
    fn test_pop_due_stops_at_now() {
        let now = Instant::now();
        let mut heap = DeadlineHeap::new();
        heap.insert(now + Duration::from_secs(1), entry());
        heap.insert(now, entry());
        heap.insert(now - Duration::from_millis(1), entry());

        assert!(heap.pop_due(now).is_some());
        assert!(heap.pop_due(now).is_some());
        assert!(heap.pop_due(now).is_none());
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_reinsert_after_removal() {
        let now = Instant::now();
        let mut heap = DeadlineHeap::new();
        let e = entry();

        heap.insert(now + Duration::from_secs(1), e.clone());
        heap.remove(&e);
        heap.insert(now, e.clone());
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.deadline_of(&e), Some(now));
        assert_consistent(&heap);
    }
}
