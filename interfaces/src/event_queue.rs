//! Deterministic discrete-event queue
//!
//! Events fire in non-decreasing virtual time; events scheduled for the same
//! instant fire in the order they were scheduled. Cancelling a pending event
//! removes it, cancelling one that already fired is a no-op.

use crate::message_types::EventId;
use crate::InterfaceError;
use common::types::SimTime;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap};
use tracing::trace;

struct Scheduled<E> {
    at: SimTime,
    id: EventId,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // ids are handed out in scheduling order, so they break ties
        self.at.cmp(&other.at).then_with(|| self.id.cmp(&other.id))
    }
}

/// Event queue owned by the simulation harness
pub struct EventQueue<E> {
    heap: BinaryHeap<Reverse<Scheduled<E>>>,
    pending: BTreeSet<EventId>,
    next_id: u64,
    now: SimTime,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    /// Create an empty queue at time zero
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: BTreeSet::new(),
            next_id: 0,
            now: SimTime::ZERO,
        }
    }

    /// Time of the last event handed out
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Number of events still pending
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether an event is still waiting to fire
    pub fn is_pending(&self, id: EventId) -> bool {
        self.pending.contains(&id)
    }

    /// Schedule an event at an absolute time
    pub fn schedule_at(&mut self, at: SimTime, event: E) -> Result<EventId, InterfaceError> {
        if at < self.now {
            return Err(InterfaceError::ScheduleInPast { at, now: self.now });
        }
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.pending.insert(id);
        self.heap.push(Reverse(Scheduled { at, id, event }));
        trace!("Scheduled event {} at {}", id, at);
        Ok(id)
    }

    /// Cancel a pending event
    pub fn cancel(&mut self, id: EventId) -> bool {
        let removed = self.pending.remove(&id);
        if removed {
            trace!("Cancelled event {}", id);
        }
        removed
    }

    /// Time of the next pending event
    pub fn peek_time(&mut self) -> Option<SimTime> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse(s)| s.at)
    }

    /// Take the next event and advance the clock to it
    pub fn pop(&mut self) -> Option<(SimTime, EventId, E)> {
        while let Some(Reverse(scheduled)) = self.heap.pop() {
            if !self.pending.remove(&scheduled.id) {
                continue;
            }
            self.now = scheduled.at;
            return Some((scheduled.at, scheduled.id, scheduled.event));
        }
        None
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.pending.contains(&head.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_order_with_fifo_ties() {
        let mut queue = EventQueue::new();
        queue.schedule_at(SimTime::from_millis(5), "late").unwrap();
        queue.schedule_at(SimTime::from_millis(1), "first").unwrap();
        queue.schedule_at(SimTime::from_millis(1), "second").unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|(_, _, e)| e).collect();
        assert_eq!(order, vec!["first", "second", "late"]);
        assert_eq!(queue.now(), SimTime::from_millis(5));
    }

    #[test]
    fn test_cancel_before_and_after_firing() {
        let mut queue = EventQueue::new();
        let a = queue.schedule_at(SimTime::from_millis(1), 'a').unwrap();
        let b = queue.schedule_at(SimTime::from_millis(2), 'b').unwrap();

        assert!(queue.cancel(b));
        assert!(!queue.cancel(b));
        assert_eq!(queue.len(), 1);

        let (_, id, event) = queue.pop().unwrap();
        assert_eq!((id, event), (a, 'a'));
        assert!(!queue.cancel(a));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_schedule_in_past_rejected() {
        let mut queue = EventQueue::new();
        queue.schedule_at(SimTime::from_millis(10), ()).unwrap();
        queue.pop();
        assert!(matches!(
            queue.schedule_at(SimTime::from_millis(9), ()),
            Err(InterfaceError::ScheduleInPast { .. })
        ));
        assert!(queue.schedule_at(SimTime::from_millis(10), ()).is_ok());
    }

    #[test]
    fn test_peek_skips_cancelled() {
        let mut queue = EventQueue::new();
        let first = queue.schedule_at(SimTime::from_millis(1), 1).unwrap();
        queue.schedule_at(SimTime::from_millis(3), 3).unwrap();
        queue.cancel(first);
        assert_eq!(queue.peek_time(), Some(SimTime::from_millis(3)));
        assert!(queue.is_pending(EventId(1)));
    }
}
