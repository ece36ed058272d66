//! Min-heap of (deadline, message id) pairs.
//!
//! Entries are never removed in place: FIN, REQ and TOUCH leave stale pairs
//! behind and the owner of the queue checks each popped pair against its map
//! before acting on it.

use crate::protocol::MessageId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct DeadlineQueue {
    heap: BinaryHeap<Reverse<(Instant, MessageId)>>,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, deadline: Instant, id: MessageId) {
        self.heap.push(Reverse((deadline, id)));
    }

    /// Earliest deadline, stale or not
    pub fn peek(&self) -> Option<(Instant, MessageId)> {
        self.heap.peek().map(|Reverse(entry)| *entry)
    }

    /// Pop the earliest pair if its deadline is at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(Instant, MessageId)> {
        match self.heap.peek() {
            Some(Reverse((deadline, _))) if *deadline <= now => {
                self.heap.pop().map(|Reverse(entry)| entry)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Drop stale pairs once they outnumber live ones
    pub fn compact<F>(&mut self, live: usize, mut is_live: F)
    where
        F: FnMut(Instant, &MessageId) -> bool,
    {
        if self.heap.len() <= 2 * live + 64 {
            return;
        }
        let entries = std::mem::take(&mut self.heap).into_vec();
        self.heap = entries
            .into_iter()
            .filter(|Reverse((deadline, id))| is_live(*deadline, id))
            .collect();
    }
}
