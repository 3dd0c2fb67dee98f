//! The ordered queue of a single host's pending events.

use std::collections::BinaryHeap;

use umbra_shim_helper::emulated_time::EmulatedTime;

use super::event::Event;

/// A host's pending events, in the deterministic event order (time, then
/// destination, source and per-host sequence). Peeking at the next event
/// time is cheap; the scheduler's safe-time computation leans on that.
///
/// The queue enforces that a host's virtual time never moves backward: no
/// event may be pushed or popped earlier than the last event handed out.
#[derive(Debug)]
pub struct EventQueue {
    heap: BinaryHeap<QueuedEvent>,
    last_popped_event_time: EmulatedTime,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            last_popped_event_time: EmulatedTime::SIMULATION_START,
        }
    }

    /// Add an event. Panics if its time lies before the last popped event.
    ///
    /// Two queued events must never be without a relative order (see
    /// [`QueuedEvent`]); the per-host sequence counters make that impossible
    /// for events built through a host or a schedule handle.
    pub fn push(&mut self, event: Event) {
        assert!(
            event.time() >= self.last_popped_event_time,
            "pushing an event into this host's past"
        );
        self.heap.push(QueuedEvent(event));
    }

    /// Remove and return the earliest event.
    pub fn pop(&mut self) -> Option<Event> {
        let event = self.heap.pop().map(|queued| queued.0);

        if let Some(event) = &event {
            assert!(
                event.time() >= self.last_popped_event_time,
                "the event queue handed out an event from the past"
            );
            self.last_popped_event_time = event.time();
        }

        event
    }

    /// Remove and return the earliest event only if it falls strictly before
    /// `horizon`. This is how a worker drains a host up to its granted round
    /// window without ever touching an event beyond it.
    pub fn pop_due(&mut self, horizon: EmulatedTime) -> Option<Event> {
        match self.next_event_time() {
            Some(time) if time < horizon => self.pop(),
            _ => None,
        }
    }

    /// The time of the earliest pending event.
    pub fn next_event_time(&self) -> Option<EmulatedTime> {
        self.heap.peek().map(|queued| queued.0.time())
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapts the [`Event`] order to the standard library's max-heap:
/// comparisons are inverted so the earliest event surfaces first, and a
/// pair of events with no relative order aborts the simulation rather than
/// tie-breaking arbitrarily (an arbitrary tie-break would make execution
/// order depend on heap internals, silently breaking determinism).
#[derive(Debug)]
struct QueuedEvent(Event);

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // inverted operands: the max-heap must surface the earliest event
        other
            .0
            .partial_cmp(&self.0)
            .expect("two queued events have no relative order")
    }
}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for QueuedEvent {}

#[cfg(test)]
mod tests {
    use umbra_shim_helper::simulation_time::SimulationTime;
    use umbra_shim_helper::HostId;

    use super::*;
    use crate::core::work::task::TaskRef;

    fn event_with_task(task: TaskRef, nanos: u64, sequence: u64) -> Event {
        let host = HostId::from(0);
        Event::from_parts(
            task,
            EmulatedTime::SIMULATION_START + SimulationTime::from_nanos(nanos),
            host,
            host,
            sequence,
        )
    }

    fn event_at(nanos: u64, sequence: u64) -> Event {
        event_with_task(TaskRef::new(|_| {}), nanos, sequence)
    }

    #[test]
    fn test_pops_in_time_order() {
        let mut queue = EventQueue::new();
        queue.push(event_at(30, 0));
        queue.push(event_at(10, 1));
        queue.push(event_at(20, 2));

        let mut times = Vec::new();
        while let Some(event) = queue.pop() {
            times.push(event.time().to_abs_simtime().as_nanos());
        }
        assert_eq!(times, vec![10, 20, 30]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_sequence_breaks_time_ties() {
        // the later-pushed event carries the smaller sequence, so insertion
        // order must not be what decides
        let first_task = TaskRef::new(|_| {});
        let second_task = TaskRef::new(|_| {});

        let mut queue = EventQueue::new();
        queue.push(event_with_task(second_task.clone(), 10, 2));
        queue.push(event_with_task(first_task.clone(), 10, 1));

        let popped = queue.pop().unwrap();
        assert_eq!(popped, event_with_task(first_task, 10, 1));
        let popped = queue.pop().unwrap();
        assert_eq!(popped, event_with_task(second_task, 10, 2));
    }

    #[test]
    fn test_pop_due_respects_horizon() {
        let mut queue = EventQueue::new();
        queue.push(event_at(10, 0));
        queue.push(event_at(20, 1));

        let horizon = EmulatedTime::SIMULATION_START + SimulationTime::from_nanos(20);

        // only the event strictly before the horizon comes out
        assert!(queue.pop_due(horizon).is_some());
        assert!(queue.pop_due(horizon).is_none());
        assert_eq!(
            queue.next_event_time(),
            Some(EmulatedTime::SIMULATION_START + SimulationTime::from_nanos(20))
        );
    }

    #[test]
    #[should_panic(expected = "past")]
    fn test_push_into_the_past_panics() {
        let mut queue = EventQueue::new();
        queue.push(event_at(10, 0));
        queue.pop().unwrap();

        // the host's clock already reached 10ns
        queue.push(event_at(5, 1));
    }
}
