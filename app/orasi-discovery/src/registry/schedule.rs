//! Health check schedule ordered by next due time

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::time::Instant;

/// Min-heap of `(due, check_id)` entries
///
/// Removed checks are not purged from the heap; callers drop ids that no
/// longer resolve when they pop them.
#[derive(Debug, Default)]
pub struct HealthSchedule {
    heap: BinaryHeap<Reverse<(Instant, String)>>,
}

impl HealthSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, check_id: impl Into<String>, due: Instant) {
        self.heap.push(Reverse((due, check_id.into())));
    }

    /// Pop every entry due at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Vec<String> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, check_id))) = self.heap.pop() {
                due.push(check_id);
            }
        }
        due
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop entries whose check no longer exists
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.heap.retain(|Reverse((_, check_id))| keep(check_id));
    }
}
