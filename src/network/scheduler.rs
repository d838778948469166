//! Follow-Up Scheduler
//!
//! Deferred tile follow-ups ordered by due time. Entries due at the same
//! instant run in the order they were scheduled.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::point::Point;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    due: Instant,
    seq: u64,
    position: Point,
}

/// Min-queue of pending follow-ups.
#[derive(Debug, Default)]
pub struct FollowUpScheduler {
    queue: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl FollowUpScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule the tile at `position` to run `delay` after `now`.
    pub fn schedule(&mut self, position: Point, delay: Duration, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(Entry { due: now + delay, seq, position }));
    }

    /// Remove and return every entry due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Point> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.queue.peek() {
            if entry.due > now {
                break;
            }
            due.push(entry.position);
            self.queue.pop();
        }
        due
    }

    /// When the earliest entry is due.
    pub fn next_due(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse(entry)| entry.due)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_due_order() {
        let now = Instant::now();
        let mut scheduler = FollowUpScheduler::new();
        scheduler.schedule(Point::new(3, 0), Duration::from_millis(300), now);
        scheduler.schedule(Point::new(1, 0), Duration::from_millis(100), now);
        scheduler.schedule(Point::new(2, 0), Duration::from_millis(200), now);

        assert!(scheduler.pop_due(now).is_empty());
        assert_eq!(scheduler.next_due(), Some(now + Duration::from_millis(100)));
        assert_eq!(
            scheduler.pop_due(now + Duration::from_millis(250)),
            vec![Point::new(1, 0), Point::new(2, 0)]
        );
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_ties_are_fifo() {
        let now = Instant::now();
        let mut scheduler = FollowUpScheduler::new();
        // Positions chosen so that ordering by position would differ
        scheduler.schedule(Point::new(9, 9), Duration::from_millis(50), now);
        scheduler.schedule(Point::new(0, 0), Duration::from_millis(50), now);
        scheduler.schedule(Point::new(5, 5), Duration::from_millis(50), now);

        assert_eq!(
            scheduler.pop_due(now + Duration::from_millis(50)),
            vec![Point::new(9, 9), Point::new(0, 0), Point::new(5, 5)]
        );
        assert!(scheduler.is_empty());
    }
}
