use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::event::Handle;

pub(crate) type TimerCallback = Box<dyn FnMut() -> bool + Send + 'static>;

/// What happens when a deadline expires.
pub(crate) enum TimerTarget {
    /// Deliver [`EventKind::Timer`](crate::event::EventKind::Timer) to the
    /// event registered under `handle`, if it is still the registration
    /// with this `generation`.
    Event { handle: Handle, generation: u64 },
    /// Run a callback on the I/O thread. It is re-armed every `interval` while
    /// it returns `true` and `remaining` allows (`None` is unbounded).
    Callback {
        callback: TimerCallback,
        interval: Duration,
        remaining: Option<u32>,
    },
}

impl fmt::Debug for TimerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerTarget::Event { handle, generation } => f
                .debug_struct("Event")
                .field("handle", handle)
                .field("generation", generation)
                .finish(),
            TimerTarget::Callback {
                interval,
                remaining,
                ..
            } => f
                .debug_struct("Callback")
                .field("interval", interval)
                .field("remaining", remaining)
                .finish(),
        }
    }
}

struct TimerEntry {
    deadline: Instant,
    sequence: u64,
    target: TimerTarget,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap: earliest deadline first, then insertion order.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match other.deadline.cmp(&self.deadline) {
            CmpOrdering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

/// Deadline-ordered timers owned by the reactor thread.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    sequence: u64,
}

impl TimerQueue {
    pub(crate) fn schedule(&mut self, deadline: Instant, target: TimerTarget) {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        self.heap.push(TimerEntry {
            deadline,
            sequence,
            target,
        });
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Removes and returns every target whose deadline is at or before `now`,
    /// earliest first.
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<TimerTarget> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|entry| entry.deadline <= now) {
            if let Some(entry) = self.heap.pop() {
                due.push(entry.target);
            }
        }
        due
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Clamps `timeout` so the poll wakes no later than the next deadline.
    pub(crate) fn poll_timeout(&self, now: Instant, timeout: Option<Duration>) -> Option<Duration> {
        match (self.next_deadline(), timeout) {
            (Some(deadline), Some(timeout)) => {
                Some(deadline.saturating_duration_since(now).min(timeout))
            }
            (Some(deadline), None) => Some(deadline.saturating_duration_since(now)),
            (None, timeout) => timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(handle: Handle) -> TimerTarget {
        TimerTarget::Event {
            handle,
            generation: 0,
        }
    }

    fn handle_of(target: &TimerTarget) -> Handle {
        match target {
            TimerTarget::Event { handle, .. } => *handle,
            TimerTarget::Callback { .. } => panic!("expected an event timer"),
        }
    }

    #[test]
    fn test_expired_in_deadline_order() {
        let mut timers = TimerQueue::default();
        let now = Instant::now();

        timers.schedule(now + Duration::from_millis(30), event(3));
        timers.schedule(now + Duration::from_millis(10), event(1));
        timers.schedule(now + Duration::from_millis(20), event(2));
        timers.schedule(now + Duration::from_secs(60), event(9));

        let due = timers.expired(now + Duration::from_millis(30));
        let handles: Vec<Handle> = due.iter().map(handle_of).collect();
        assert_eq!(handles, vec![1, 2, 3]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_equal_deadlines_keep_insertion_order() {
        let mut timers = TimerQueue::default();
        let deadline = Instant::now();

        for handle in 0..5 {
            timers.schedule(deadline, event(handle));
        }

        let handles: Vec<Handle> = timers.expired(deadline).iter().map(handle_of).collect();
        assert_eq!(handles, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_poll_timeout_clamped_to_deadline() {
        let mut timers = TimerQueue::default();
        let now = Instant::now();

        assert_eq!(timers.poll_timeout(now, None), None);
        assert_eq!(
            timers.poll_timeout(now, Some(Duration::from_millis(100))),
            Some(Duration::from_millis(100))
        );

        timers.schedule(now + Duration::from_millis(5), event(1));
        assert_eq!(
            timers.poll_timeout(now, Some(Duration::from_millis(100))),
            Some(Duration::from_millis(5))
        );
        assert_eq!(timers.poll_timeout(now, None), Some(Duration::from_millis(5)));
        assert_eq!(
            timers.poll_timeout(now + Duration::from_secs(1), None),
            Some(Duration::ZERO)
        );
    }
}
