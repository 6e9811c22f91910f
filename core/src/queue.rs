//! Priority dispatch queue: one FIFO bucket per priority level.

use std::collections::VecDeque;

use crate::message::{Message, Priority};

/// Strict-priority queue with FIFO order inside each level.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    // Indexed by `bucket(priority)`, urgent first
    buckets: [VecDeque<Message>; 4],
}

fn bucket(priority: Priority) -> usize {
    match priority {
        Priority::Urgent => 0,
        Priority::High => 1,
        Priority::Medium => 2,
        Priority::Low => 3,
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: Message) {
        self.buckets[bucket(message.priority)].push_back(message);
    }

    /// Pops the oldest message of the highest non-empty priority level.
    pub fn dequeue_next(&mut self) -> Option<Message> {
        self.buckets.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    pub fn len_for(&self, priority: Priority) -> usize {
        self.buckets[bucket(priority)].len()
    }

    /// Drops everything still queued, returning how many messages were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.len();
        for b in self.buckets.iter_mut() {
            b.clear();
        }
        discarded
    }
}
