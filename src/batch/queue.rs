//! Priority queue shared by the executor and the trade request worker

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::debug;

/// Entry wrapper giving heap order: higher priority first, FIFO within a tier
#[derive(Debug)]
struct Prioritized<P, T> {
    priority: P,
    sequence: u64, // insertion order, used as the tie-break
    item: T,
}

impl<P: Ord, T> PartialEq for Prioritized<P, T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<P: Ord, T> Eq for Prioritized<P, T> {}

impl<P: Ord, T> PartialOrd for Prioritized<P, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P: Ord, T> Ord for Prioritized<P, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            // Same priority: the earlier sequence is "greater" so it pops first
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

/// Max-priority queue with FIFO tie-break
pub struct PriorityQueue<P: Ord, T> {
    heap: BinaryHeap<Prioritized<P, T>>,
    sequence_counter: u64,
    enqueued_count: u64,
    dequeued_count: u64,
}

impl<P: Ord, T> Default for PriorityQueue<P, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Ord, T> PriorityQueue<P, T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            sequence_counter: 0,
            enqueued_count: 0,
            dequeued_count: 0,
        }
    }

    pub fn push(&mut self, priority: P, item: T) {
        let sequence = self.sequence_counter;
        self.sequence_counter += 1;
        self.heap.push(Prioritized {
            priority,
            sequence,
            item,
        });
        self.enqueued_count += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        let next = self.heap.pop().map(|p| p.item);
        if next.is_some() {
            self.dequeued_count += 1;
        }
        next
    }

    /// Take up to `n` items in priority order
    pub fn pop_batch(&mut self, n: usize) -> Vec<T> {
        let mut batch = Vec::with_capacity(n.min(self.heap.len()));
        while batch.len() < n {
            match self.pop() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }

    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|p| &p.item)
    }

    /// Remove the first entry matching `pred`, keeping everyone else's order
    pub fn remove_where<F>(&mut self, mut pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        // BinaryHeap has no keyed removal; rebuild it without the match
        let items = std::mem::take(&mut self.heap).into_vec();
        let mut removed = None;

        for entry in items {
            if removed.is_none() && pred(&entry.item) {
                removed = Some(entry.item);
                continue;
            }
            self.heap.push(entry);
        }

        if removed.is_some() {
            debug!(remaining = self.heap.len(), "removed entry from queue");
        }
        removed
    }

    pub fn contains<F>(&self, mut pred: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        self.heap.iter().any(|entry| pred(&entry.item))
    }

    /// Count queued entries per priority value
    pub fn count_where<F>(&self, mut pred: F) -> usize
    where
        F: FnMut(&P) -> bool,
    {
        self.heap.iter().filter(|entry| pred(&entry.priority)).count()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn enqueued_total(&self) -> u64 {
        self.enqueued_count
    }

    pub fn dequeued_total(&self) -> u64 {
        self.dequeued_count
    }
}
