use crate::host::descriptor::listener::StateListenHandle;
use crate::host::descriptor::FileState;

use super::EpollEvents;

/// The status of one monitored file within an epoll set.
pub struct Entry {
    interest: EpollEvents,
    data: u64,
    /// Our view of the file's state, updated by the listener callback.
    state: FileState,
    /// For edge-triggered entries: a monitored bit turned on and hasn't been
    /// reported yet.
    edge_pending: bool,
    /// The entry's priority in the ready set, if it's in the ready set.
    priority: Option<u64>,
    /// Dropping this stops the file-state listener.
    listener_handle: Option<StateListenHandle>,
}

impl Entry {
    pub fn new(interest: EpollEvents, data: u64, state: FileState) -> Self {
        let mut entry = Self {
            interest,
            data,
            state,
            edge_pending: false,
            priority: None,
            listener_handle: None,
        };
        // an edge-triggered entry reports once if the file is ready at add time
        entry.edge_pending = !entry.level_ready_events().is_empty();
        entry
    }

    pub fn modify(&mut self, interest: EpollEvents, data: u64, state: FileState) {
        self.interest = interest;
        self.data = data;
        self.state = state;
        self.edge_pending = !self.level_ready_events().is_empty();
    }

    /// Update our view of the file's state. Called by the listener.
    pub fn notify(&mut self, state: FileState, changed: FileState) {
        self.state = state;

        // which monitored bits just turned on?
        let turned_on = state & changed;
        if !self.events_for_state(turned_on).is_empty() {
            self.edge_pending = true;
        }
    }

    /// The file-state bits the listener must monitor for this entry. We always
    /// listen for CLOSED so we know when to stop monitoring the file.
    pub fn listener_state(&self) -> FileState {
        let mut state = FileState::CLOSED;
        if self.interest.contains(EpollEvents::EPOLLIN) {
            state.insert(FileState::READABLE);
        }
        if self.interest.contains(EpollEvents::EPOLLOUT) {
            state.insert(FileState::WRITABLE);
        }
        state
    }

    pub fn has_ready_events(&self) -> bool {
        if self.interest.contains(EpollEvents::EPOLLET) {
            self.edge_pending
        } else {
            !self.level_ready_events().is_empty()
        }
    }

    /// The events to report to the managed process, consuming the edge for
    /// edge-triggered entries. None if no events are ready.
    pub fn collect_ready_events(&mut self) -> Option<(EpollEvents, u64)> {
        let events = self.level_ready_events();

        if self.interest.contains(EpollEvents::EPOLLET) {
            if !self.edge_pending {
                return None;
            }
            self.edge_pending = false;
        }

        if events.is_empty() {
            return None;
        }
        Some((events, self.data))
    }

    pub fn priority(&self) -> Option<u64> {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Option<u64>) {
        self.priority = priority;
    }

    pub fn set_listener_handle(&mut self, handle: Option<StateListenHandle>) {
        self.listener_handle = handle;
    }

    /// The events implied by the file's current state, level-triggered.
    fn level_ready_events(&self) -> EpollEvents {
        self.events_for_state(self.state)
    }

    fn events_for_state(&self, state: FileState) -> EpollEvents {
        let mut events = EpollEvents::empty();
        if state.contains(FileState::READABLE) && self.interest.contains(EpollEvents::EPOLLIN) {
            events.insert(EpollEvents::EPOLLIN);
        }
        if state.contains(FileState::WRITABLE) && self.interest.contains(EpollEvents::EPOLLOUT) {
            events.insert(EpollEvents::EPOLLOUT);
        }
        // EPOLLHUP is reported whether or not it was requested
        if state.contains(FileState::CLOSED) {
            events.insert(EpollEvents::EPOLLHUP);
        }
        events
    }
}
