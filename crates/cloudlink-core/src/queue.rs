//! # Bounded Priority Queue
//!
//! Binary max-heap ordering outbound work by priority rank, with FIFO
//! stability inside a priority band.
//!
//! ## Ordering Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Queue Ordering Contract                            │
//! │                                                                         │
//! │  push A (HIGH)   ┐                                                      │
//! │  push B (LOW)    │──► pop order: A, C, B                                │
//! │  push C (HIGH)   ┘                                                      │
//! │                                                                         │
//! │  • Higher rank always pops first                                        │
//! │  • Equal rank pops in push order (strict tie-break on sequence)         │
//! │  • push beyond capacity fails, never evicts                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The FIFO tie-break matters: senders rely on same-priority messages
//! (sequential attribute updates) being delivered in submission order, so
//! every heap comparison is strict — an older entry never swaps below a
//! newer entry of equal rank.
//!
//! `remove` is an index-assisted linear scan, O(n) by design: queues are
//! capped at 1000 entries and removal only happens on transfer cancellation.

use crate::error::QueueError;

// =============================================================================
// Queue Entry
// =============================================================================

/// Heap entry wrapping an item with its derived ordering key.
#[derive(Debug)]
struct QueueEntry<T> {
    item: T,
    rank: u8,
    seq: u64,
}

impl<T> QueueEntry<T> {
    /// Strict "drains before" relation: higher rank wins, then earlier
    /// sequence. Never true for two entries with the same sequence.
    fn beats(&self, other: &QueueEntry<T>) -> bool {
        self.rank > other.rank || (self.rank == other.rank && self.seq < other.seq)
    }
}

// =============================================================================
// Priority Queue
// =============================================================================

/// Bounded binary heap with FIFO stability within each priority band.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    heap: Vec<QueueEntry<T>>,
    capacity: usize,
    next_seq: u64,
}

impl<T> PriorityQueue<T> {
    /// Creates an empty queue holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        PriorityQueue {
            heap: Vec::new(),
            capacity,
            next_seq: 0,
        }
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Configured maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes an item with the given priority rank.
    ///
    /// Fails with [`QueueError::CapacityExceeded`] when the queue already
    /// holds the configured maximum; the queue is left untouched.
    pub fn push(&mut self, item: T, rank: u8) -> Result<(), QueueError> {
        if self.heap.len() >= self.capacity {
            return Err(QueueError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(QueueEntry { item, rank, seq });
        self.sift_up(self.heap.len() - 1);
        Ok(())
    }

    /// Pops the highest-priority entry, FIFO within equal priorities.
    pub fn pop(&mut self) -> Option<T> {
        if self.heap.is_empty() {
            return None;
        }

        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let entry = self.heap.pop().map(|e| e.item);
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        entry
    }

    /// Returns the highest-priority item without removing it.
    pub fn peek(&self) -> Option<&T> {
        self.heap.first().map(|e| &e.item)
    }

    /// Removes the first entry matching `matcher`, returning whether a
    /// removal occurred. Used to cancel queued storage transfers.
    pub fn remove<F>(&mut self, matcher: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        let index = match self.heap.iter().position(|e| matcher(&e.item)) {
            Some(index) => index,
            None => return false,
        };

        let last = self.heap.len() - 1;
        self.heap.swap(index, last);
        self.heap.pop();

        if index < self.heap.len() {
            // The relocated tail entry may violate the heap property in
            // either direction.
            self.sift_up(index);
            self.sift_down(index);
        }
        true
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[index].beats(&self.heap[parent]) {
                self.heap.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut best = index;

            if left < len && self.heap[left].beats(&self.heap[best]) {
                best = left;
            }
            if right < len && self.heap[right].beats(&self.heap[best]) {
                best = right;
            }
            if best == index {
                break;
            }
            self.heap.swap(index, best);
            index = best;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Priority;

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = PriorityQueue::new(16);
        for label in ["a", "b", "c", "d"] {
            queue.push(label, Priority::Medium.rank()).unwrap();
        }
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), Some("c"));
        assert_eq!(queue.pop(), Some("d"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_priority_dominates_fifo() {
        let mut queue = PriorityQueue::new(16);
        queue.push("low-first", Priority::Low.rank()).unwrap();
        queue.push("high-later", Priority::High.rank()).unwrap();
        assert_eq!(queue.pop(), Some("high-later"));
        assert_eq!(queue.pop(), Some("low-first"));
    }

    #[test]
    fn test_high_low_high_scenario() {
        // A(HIGH), B(LOW), C(HIGH) queued in that order pops A, C, B.
        let mut queue = PriorityQueue::new(16);
        queue.push("A", Priority::High.rank()).unwrap();
        queue.push("B", Priority::Low.rank()).unwrap();
        queue.push("C", Priority::High.rank()).unwrap();
        assert_eq!(queue.pop(), Some("A"));
        assert_eq!(queue.pop(), Some("C"));
        assert_eq!(queue.pop(), Some("B"));
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut queue = PriorityQueue::new(3);
        for i in 0..3 {
            queue.push(i, 0).unwrap();
        }
        let err = queue.push(99, 0).unwrap_err();
        assert_eq!(err, QueueError::CapacityExceeded { capacity: 3 });
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_full_capacity_scenario() {
        // 1000 pushes succeed; the 1001st fails and the length stays 1000.
        let mut queue = PriorityQueue::new(1000);
        for i in 0..1000 {
            queue.push(i, (i % 5) as u8).unwrap();
        }
        assert!(queue.push(1000, 0).is_err());
        assert_eq!(queue.len(), 1000);
    }

    #[test]
    fn test_fifo_across_many_priorities() {
        let mut queue = PriorityQueue::new(64);
        // Interleave priorities; expect rank bands in push order.
        for i in 0..30u32 {
            queue.push(i, (i % 3) as u8).unwrap();
        }
        let mut popped = Vec::new();
        while let Some(item) = queue.pop() {
            popped.push(item);
        }
        let expected: Vec<u32> = (0..30)
            .filter(|i| i % 3 == 2)
            .chain((0..30).filter(|i| i % 3 == 1))
            .chain((0..30).filter(|i| i % 3 == 0))
            .collect();
        assert_eq!(popped, expected);
    }

    #[test]
    fn test_remove_by_matcher() {
        let mut queue = PriorityQueue::new(16);
        queue.push("keep-1", 1).unwrap();
        queue.push("drop", 2).unwrap();
        queue.push("keep-2", 1).unwrap();

        assert!(queue.remove(|item| *item == "drop"));
        assert!(!queue.remove(|item| *item == "drop"));

        assert_eq!(queue.pop(), Some("keep-1"));
        assert_eq!(queue.pop(), Some("keep-2"));
    }

    #[test]
    fn test_remove_preserves_heap_order() {
        let mut queue = PriorityQueue::new(64);
        for i in 0..20u32 {
            queue.push(i, (i % 4) as u8).unwrap();
        }
        assert!(queue.remove(|item| *item == 7));

        let mut previous: Option<(u8, u32)> = None;
        let mut count = 0;
        while let Some(item) = queue.pop() {
            let rank = (item % 4) as u8;
            if let Some((prev_rank, prev_item)) = previous {
                assert!(rank <= prev_rank, "rank order violated");
                if rank == prev_rank {
                    assert!(item > prev_item, "FIFO order violated within rank");
                }
            }
            previous = Some((rank, item));
            count += 1;
        }
        assert_eq!(count, 19);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut queue = PriorityQueue::new(4);
        queue.push("only", 3).unwrap();
        assert_eq!(queue.peek(), Some(&"only"));
        assert_eq!(queue.len(), 1);
    }
}
