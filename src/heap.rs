//! Minimum-heap priority queue of scheduled events, ordered by `next_trigger`.
//!
//! The original implementation hand-rolled a 1-based array heap with its own
//! growth policy. `std::collections::BinaryHeap` already provides the same
//! amortized O(log n) insert/pop behavior with automatic growth, so the
//! queue here is a thin `Reverse`-ordered wrapper rather than a
//! reimplementation of the array bookkeeping.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::event::Event;

#[derive(Debug, Clone, Eq, PartialEq)]
struct Ordered(Event);

impl Ord for Ordered {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.next_trigger.cmp(&other.0.next_trigger)
    }
}

impl PartialOrd for Ordered {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of [`Event`]s keyed on `next_trigger`.
#[derive(Debug, Default)]
pub struct EventHeap {
    heap: BinaryHeap<Reverse<Ordered>>,
}

impl EventHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn insert(&mut self, event: Event) {
        self.heap.push(Reverse(Ordered(event)));
    }

    /// The event with the earliest `next_trigger`, without removing it.
    pub fn peek(&self) -> Option<&Event> {
        self.heap.peek().map(|Reverse(Ordered(e))| e)
    }

    /// Remove and return the event with the earliest `next_trigger`.
    pub fn fetch(&mut self) -> Option<Event> {
        self.heap.pop().map(|Reverse(Ordered(e))| e)
    }

    /// Remove and return the earliest event only if it has already reached
    /// its `next_trigger` relative to `now`.
    pub fn fetch_if_triggered(&mut self, now: i64) -> Option<Event> {
        if self.peek()?.next_trigger <= now {
            self.fetch()
        } else {
            None
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

    /// Remove every event whose `source` matches `source`, returning them.
    pub fn drain_source(&mut self, source: crate::event::EventSource) -> Vec<Event> {
        let (keep, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut self.heap)
            .into_iter()
            .map(|Reverse(Ordered(e))| e)
            .partition(|e| e.source != source);
        self.heap = keep.into_iter().map(|e| Reverse(Ordered(e))).collect();
        removed
    }

    /// Every event currently queued, in ascending `next_trigger` order.
    /// Intended for diagnostics (`Display`, reload logging), not hot paths.
    pub fn iter_sorted(&self) -> Vec<&Event> {
        let mut v: Vec<&Event> = self.heap.iter().map(|Reverse(Ordered(e))| e).collect();
        v.sort_by_key(|e| e.next_trigger);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, Event, EventSource, EventType};

    fn ev(trigger: i64) -> Event {
        Event {
            next_trigger: trigger,
            local_offset: 0,
            r#type: EventType::Once,
            action: Action::Watchdog,
            source: EventSource::Internal,
        }
    }

    #[test]
    fn fetches_in_ascending_trigger_order() {
        let mut heap = EventHeap::new();
        heap.insert(ev(30));
        heap.insert(ev(10));
        heap.insert(ev(20));

        assert_eq!(heap.fetch().unwrap().next_trigger, 10);
        assert_eq!(heap.fetch().unwrap().next_trigger, 20);
        assert_eq!(heap.fetch().unwrap().next_trigger, 30);
        assert!(heap.fetch().is_none());
    }

    #[test]
    fn fetch_if_triggered_respects_now() {
        let mut heap = EventHeap::new();
        heap.insert(ev(100));

        assert!(heap.fetch_if_triggered(50).is_none());
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.fetch_if_triggered(100).unwrap().next_trigger, 100);
    }

    #[test]
    fn drain_source_only_removes_matching() {
        let mut heap = EventHeap::new();
        let mut parsed = ev(10);
        parsed.source = EventSource::Parsed;
        heap.insert(parsed);
        heap.insert(ev(20));

        let removed = heap.drain_source(EventSource::Parsed);
        assert_eq!(removed.len(), 1);
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.peek().unwrap().next_trigger, 20);
    }
}
