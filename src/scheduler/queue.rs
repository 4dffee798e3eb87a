//! Admission queue.
//!
//! Orders queued requests by priority (higher first), then by arrival order
//! (earlier first). A preempted request is pushed back with the priority and
//! arrival order it already held, so it keeps its place.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::core::request::{Priority, RequestId};

/// Entry in the priority queue for scheduling.
///
/// Ordered by (priority DESC, arrival_order ASC).
#[derive(Debug, Clone)]
struct PriorityEntry {
    request_id: RequestId,
    priority: Priority,
    arrival_order: u64,
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PriorityEntry {}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier arrival (lower order)
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.arrival_order.cmp(&self.arrival_order),
            ord => ord,
        }
    }
}

/// Requests waiting to be admitted.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    heap: BinaryHeap<PriorityEntry>,
}

impl AdmissionQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request.
    pub fn push(&mut self, request_id: RequestId, priority: Priority, arrival_order: u64) {
        self.heap.push(PriorityEntry {
            request_id,
            priority,
            arrival_order,
        });
    }

    /// The request that would be admitted next.
    pub fn peek(&self) -> Option<RequestId> {
        self.heap.peek().map(|e| e.request_id)
    }

    /// Remove and return the head of the queue.
    pub fn pop(&mut self) -> Option<RequestId> {
        self.heap.pop().map(|e| e.request_id)
    }

    /// Drop a request from the queue.
    ///
    /// # Returns
    ///
    /// `true` if the request was queued.
    pub fn remove(&mut self, request_id: RequestId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|e| e.request_id != request_id);
        self.heap.len() != before
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.heap.iter().any(|e| e.request_id == request_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = AdmissionQueue::new();
        queue.push(1, 0, 0);
        queue.push(2, 5, 1);
        queue.push(3, 0, 2);
        queue.push(4, 5, 3);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_requeued_request_keeps_its_place() {
        let mut queue = AdmissionQueue::new();
        queue.push(10, 1, 5);
        queue.push(11, 1, 6);
        // Preempted request re-enters with its original arrival order
        queue.push(7, 1, 2);

        assert_eq!(queue.peek(), Some(7));
    }

    #[test]
    fn test_remove() {
        let mut queue = AdmissionQueue::new();
        queue.push(1, 0, 0);
        queue.push(2, 0, 1);

        assert!(queue.remove(1));
        assert!(!queue.remove(1));
        assert!(!queue.contains(1));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(2));
        assert!(queue.is_empty());
    }
}
