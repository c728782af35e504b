//! Timer queue used to compute a poll loop's next wake-up (spec.md §4.G
//! "timer queue"), grounded on `rak::timer`'s microsecond-resolution
//! duration type, re-expressed over `std::time::Instant`.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Opaque handle returned by `TimerQueue::schedule`, usable to `cancel` the
/// timer before it fires.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Entry {
    deadline: Instant,
    id: TimerId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> CmpOrdering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline.
        other.deadline.cmp(&self.deadline)
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of pending deadlines. Cancellation is lazy: a cancelled id is
/// recorded and skipped when it reaches the front of the heap, rather than
/// searched for and removed immediately.
pub struct TimerQueue {
    heap: BinaryHeap<Entry>,
    cancelled: std::collections::HashSet<TimerId>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue { heap: BinaryHeap::new(), cancelled: std::collections::HashSet::new(), next_id: 0 }
    }

    pub fn schedule(&mut self, deadline: Instant) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Entry { deadline, id });
        id
    }

    pub fn schedule_in(&mut self, delay: Duration) -> TimerId {
        self.schedule(Instant::now() + delay)
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    fn drop_cancelled(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if self.cancelled.remove(&entry.id) {
                self.heap.pop();
            } else {
                break;
            }
        }
    }

    /// Pop every timer whose deadline has already passed, returning their
    /// ids in deadline order.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<TimerId> {
        self.drop_cancelled();
        let mut expired = Vec::new();

        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            expired.push(entry.id);
            self.drop_cancelled();
        }

        expired
    }

    /// How long until the next (non-cancelled) timer fires, or `None` if
    /// the queue is empty — the poll loop's `next_timeout_usec()`.
    pub fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        self.drop_cancelled();
        self.heap.peek().map(|entry| entry.deadline.saturating_duration_since(now))
    }

    pub fn is_empty(&mut self) -> bool {
        self.drop_cancelled();
        self.heap.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> TimerQueue {
        TimerQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_drains_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();

        let a = queue.schedule(now + Duration::from_millis(20));
        let b = queue.schedule(now + Duration::from_millis(10));

        let expired = queue.drain_expired(now + Duration::from_millis(30));
        assert_eq!(expired, vec![b, a]);
    }

    #[test]
    fn positive_cancel_skips_a_timer() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();

        let a = queue.schedule(now + Duration::from_millis(10));
        let b = queue.schedule(now + Duration::from_millis(10));
        queue.cancel(a);

        let expired = queue.drain_expired(now + Duration::from_millis(20));
        assert_eq!(expired, vec![b]);
    }

    #[test]
    fn positive_next_timeout_reflects_the_earliest_deadline() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.schedule(now + Duration::from_secs(5));

        let remaining = queue.next_timeout(now).unwrap();
        assert!(remaining <= Duration::from_secs(5) && remaining > Duration::from_secs(4));
    }
}
