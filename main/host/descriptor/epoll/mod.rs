use std::collections::hash_map::Entry as HashMapEntry;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;

use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::{File, FileMode, FileState, FileStatus};
use crate::host::syscall::types::SyscallError;
use crate::utility::callback_queue::CallbackQueue;

use self::entry::Entry;
use self::key::{Key, PriorityKey};

// Private submodules to help us track the status of files we are monitoring.
mod entry;
mod key;

bitflags::bitflags! {
    /// Epoll event bits. Values match the kernel's.
    #[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
    pub struct EpollEvents: u32 {
        const EPOLLIN = 0x1;
        const EPOLLOUT = 0x4;
        const EPOLLERR = 0x8;
        const EPOLLHUP = 0x10;
        const EPOLLET = 1 << 31;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EpollCtlOp {
    Add,
    Mod,
    Del,
}

pub struct Epoll {
    event_source: StateEventSource,
    status: FileStatus,
    state: FileState,
    // should only be used by `OpenFile` to make sure there is only ever one `OpenFile` instance
    // for this file
    has_open_file: bool,
    // a counter for sorting entries, to guarantee fairness and determinism when reporting events;
    // because our ready set is a max heap, we initialize this counter to u64::MAX and count down
    // as we assign values so that entries whose events were last reported longest ago are
    // prioritized
    pri_counter: u64,
    // stores entries for all files we are currently monitoring for events
    monitoring: HashMap<Key, Entry>,
    // stores keys for entries with events that are ready to be reported
    ready: BinaryHeap<PriorityKey>,
}

impl Epoll {
    pub fn new(status: FileStatus) -> Arc<AtomicRefCell<Self>> {
        let epoll = Self {
            event_source: StateEventSource::new(),
            status,
            state: FileState::ACTIVE,
            has_open_file: false,
            pri_counter: u64::MAX,
            monitoring: HashMap::new(),
            ready: BinaryHeap::new(),
        };

        Arc::new(AtomicRefCell::new(epoll))
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FileStatus) {
        self.status = status;
    }

    pub fn mode(&self) -> FileMode {
        FileMode::READ | FileMode::WRITE
    }

    pub fn has_open_file(&self) -> bool {
        self.has_open_file
    }

    pub fn set_has_open_file(&mut self, val: bool) {
        self.has_open_file = val;
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        // stop monitoring everything; dropping the entries drops their listener handles
        self.monitoring.clear();
        self.ready.clear();

        self.update_state(FileState::all(), FileState::CLOSED, cb_queue);
        Ok(())
    }

    pub fn read(
        &mut self,
        _dst: &mut [u8],
        _cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        // epoll fds don't support reading
        Err(Errno::EINVAL.into())
    }

    pub fn write(
        &mut self,
        _src: &[u8],
        _cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        // epoll fds don't support writing
        Err(Errno::EINVAL.into())
    }

    /// Executes an epoll control operation on the target file.
    ///
    /// This will panic if `target_file` is an instance of this epoll object
    /// due to recursive mutable borrows.
    pub fn ctl(
        &mut self,
        op: EpollCtlOp,
        target_fd: i32,
        target_file: File,
        events: EpollEvents,
        data: u64,
        weak_self: Weak<AtomicRefCell<Epoll>>,
        cb_queue: &mut CallbackQueue,
    ) -> Result<(), SyscallError> {
        let state = target_file.borrow().state();
        let key = Key::new(target_fd, target_file);

        log::trace!("Epoll editing fd {target_fd} while in state {state:?}");

        match op {
            EpollCtlOp::Add => {
                // a file referenced in the descriptor table should never be closed
                if state.contains(FileState::CLOSED) {
                    log::warn!("Attempted to add a closed file {target_fd} to epoll");
                    return Err(Errno::EBADF.into());
                }

                let entry = Entry::new(events, data, state);

                // from epoll_ctl(2): returns EEXIST when "op was EPOLL_CTL_ADD, and the supplied
                // file descriptor fd is already registered with this epoll instance"
                match self.monitoring.entry(key.clone()) {
                    HashMapEntry::Occupied(_) => return Err(Errno::EEXIST.into()),
                    HashMapEntry::Vacant(x) => x.insert(entry),
                };
            }
            EpollCtlOp::Mod => {
                let entry = self.monitoring.get_mut(&key).ok_or(Errno::ENOENT)?;
                entry.modify(events, data, state);
            }
            EpollCtlOp::Del => {
                // stop monitoring this entry; dropping the entry will cause it to stop listening
                // for status changes on its inner `File` event source object
                let entry = self.monitoring.remove(&key).ok_or(Errno::ENOENT)?;

                // if it has a priority, then we also remove it from the ready set
                if let Some(pri) = entry.priority() {
                    self.ready.retain(|e| e.priority() != pri)
                }
            }
        };

        self.refresh_ready(key.clone());
        self.refresh_listener(weak_self, key);
        self.refresh_state(cb_queue);

        Ok(())
    }

    pub fn add_listener(
        &mut self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> StateListenHandle {
        self.event_source.add_listener(monitoring, filter, notify_fn)
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    fn refresh_state(&mut self, cb_queue: &mut CallbackQueue) {
        if self.state.contains(FileState::CLOSED) {
            return;
        }

        let mut new_state = FileState::empty();
        new_state.set(FileState::READABLE, self.has_ready_events());

        self.update_state(FileState::READABLE, new_state, cb_queue);
    }

    fn update_state(&mut self, mask: FileState, state: FileState, cb_queue: &mut CallbackQueue) {
        let old_state = self.state;

        // remove the masked flags, then copy the masked flags
        self.state.remove(mask);
        self.state.insert(state & mask);

        let states_changed = self.state ^ old_state;
        if !states_changed.is_empty() {
            self.event_source
                .notify_listeners(self.state, states_changed, cb_queue);
        }
    }

    fn refresh_listener(&mut self, weak_self: Weak<AtomicRefCell<Epoll>>, key: Key) {
        let Some(entry) = self.monitoring.get_mut(&key) else {
            return;
        };

        let listen_state = entry.listener_state();
        let filter = StateListenerFilter::Always;

        // set up a callback so we get informed when the file changes
        let file = key.file().clone();
        let handle = file.borrow_mut().add_listener(
            listen_state,
            filter,
            move |state, changed, cb_queue| {
                if let Some(epoll) = weak_self.upgrade() {
                    epoll
                        .borrow_mut()
                        .notify_entry(&key, state, changed, cb_queue);
                }
            },
        );
        entry.set_listener_handle(Some(handle));
    }

    /// The file listener callback for when a monitored entry's file state changes.
    fn notify_entry(
        &mut self,
        key: &Key,
        state: FileState,
        changed: FileState,
        cb_queue: &mut CallbackQueue,
    ) {
        // notify the entry of the file state change if we're still monitoring it
        match self.monitoring.get_mut(key) {
            Some(entry) => entry.notify(state, changed),
            None => return,
        };

        // update our ready set
        self.refresh_ready(key.clone());

        // also stop monitoring if the file was closed
        if state.contains(FileState::CLOSED) {
            self.monitoring.remove(key);
        }

        // update the readability of the epoll descriptor
        self.refresh_state(cb_queue);
    }

    /// Ensures that the entry is in the ready set if it should be, or not if it shouldn't be.
    fn refresh_ready(&mut self, key: Key) {
        let Some(entry) = self.monitoring.get_mut(&key) else {
            return;
        };

        if entry.has_ready_events() {
            if entry.priority().is_none() {
                // it's ready but not in the ready set yet
                let pri = self.pri_counter;
                self.pri_counter -= 1;
                self.ready.push(PriorityKey::new(pri, key));
                entry.set_priority(Some(pri));
            }
        } else if let Some(pri) = entry.priority() {
            // it's not ready anymore but it's in the ready set, so remove it
            self.ready.retain(|e| e.priority() != pri);
            entry.set_priority(None);
        }
    }

    pub fn has_ready_events(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn collect_ready_events(
        &mut self,
        cb_queue: &mut CallbackQueue,
        max_events: u32,
    ) -> Vec<(EpollEvents, u64)> {
        let mut events = vec![];
        let mut keep = vec![];

        while !self.ready.is_empty() && events.len() < max_events as usize {
            // get the next ready entry
            let pri_key = self.ready.pop().unwrap();
            let key = Key::from(pri_key);
            let entry = self.monitoring.get_mut(&key).unwrap();

            // just removed from the ready set, keep the priority consistent
            entry.set_priority(None);

            // it was ready so it should have events
            if let Some(ev) = entry.collect_ready_events() {
                events.push(ev);
            }

            // it might still be ready even after we report
            if entry.has_ready_events() {
                // it's ready again; assign a new priority to ensure fairness with other entries
                let pri = self.pri_counter;
                self.pri_counter -= 1;
                let pri_key = PriorityKey::new(pri, key);

                // use a temp vec so we don't report the same entry twice in the same round
                keep.push(pri_key);

                // the entry will be in the ready set, keep its priority consistent
                entry.set_priority(Some(pri));
            }
        }

        // add everything that is still ready back to the ready set
        self.ready.extend(keep);

        // we've mutated the ready list; we may need to trigger callbacks
        self.refresh_state(cb_queue);

        // the events to be returned to the managed process
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::descriptor::eventfd::EventFd;

    fn new_eventfd_file(init: u64) -> (Arc<AtomicRefCell<EventFd>>, File) {
        let eventfd = Arc::new(AtomicRefCell::new(EventFd::new(
            init,
            false,
            FileStatus::empty(),
        )));
        let file = File::EventFd(Arc::clone(&eventfd));
        (eventfd, file)
    }

    fn write_eventfd(eventfd: &Arc<AtomicRefCell<EventFd>>, val: u64) {
        CallbackQueue::queue_and_run(|cb_queue| {
            eventfd
                .borrow_mut()
                .write(&val.to_ne_bytes(), cb_queue)
                .unwrap()
        });
    }

    fn read_eventfd(eventfd: &Arc<AtomicRefCell<EventFd>>) -> u64 {
        CallbackQueue::queue_and_run(|cb_queue| {
            let mut buf = [0u8; 8];
            eventfd.borrow_mut().read(&mut buf, cb_queue).unwrap();
            u64::from_ne_bytes(buf)
        })
    }

    #[test]
    fn test_level_triggered() {
        let epoll = Epoll::new(FileStatus::empty());
        let (eventfd, file) = new_eventfd_file(0);

        CallbackQueue::queue_and_run(|cb_queue| {
            epoll
                .borrow_mut()
                .ctl(
                    EpollCtlOp::Add,
                    5,
                    file,
                    EpollEvents::EPOLLIN,
                    1234,
                    Arc::downgrade(&epoll),
                    cb_queue,
                )
                .unwrap();
        });

        // nothing ready yet
        assert!(!epoll.borrow().has_ready_events());
        assert!(!epoll.borrow().state().contains(FileState::READABLE));

        write_eventfd(&eventfd, 1);

        // the epoll descriptor itself became readable
        assert!(epoll.borrow().state().contains(FileState::READABLE));

        let events = CallbackQueue::queue_and_run(|cb_queue| {
            epoll.borrow_mut().collect_ready_events(cb_queue, 8)
        });
        assert_eq!(events, vec![(EpollEvents::EPOLLIN, 1234)]);

        // level-triggered: still ready until the counter is drained
        assert!(epoll.borrow().has_ready_events());
        assert_eq!(read_eventfd(&eventfd), 1);
        assert!(!epoll.borrow().has_ready_events());
    }

    #[test]
    fn test_edge_triggered_reports_once() {
        let epoll = Epoll::new(FileStatus::empty());
        let (eventfd, file) = new_eventfd_file(0);

        CallbackQueue::queue_and_run(|cb_queue| {
            epoll
                .borrow_mut()
                .ctl(
                    EpollCtlOp::Add,
                    5,
                    file,
                    EpollEvents::EPOLLIN | EpollEvents::EPOLLET,
                    7,
                    Arc::downgrade(&epoll),
                    cb_queue,
                )
                .unwrap();
        });

        write_eventfd(&eventfd, 1);
        let events = CallbackQueue::queue_and_run(|cb_queue| {
            epoll.borrow_mut().collect_ready_events(cb_queue, 8)
        });
        assert_eq!(events.len(), 1);

        // no new edge: nothing more to report even though the counter is positive
        assert!(!epoll.borrow().has_ready_events());

        // a new write isn't a new edge either (READABLE was already on), but
        // draining and re-writing is
        assert_eq!(read_eventfd(&eventfd), 1);
        write_eventfd(&eventfd, 1);
        assert!(epoll.borrow().has_ready_events());
    }

    #[test]
    fn test_ready_reporting_is_fair() {
        let epoll = Epoll::new(FileStatus::empty());
        let (eventfd_a, file_a) = new_eventfd_file(0);
        let (eventfd_b, file_b) = new_eventfd_file(0);

        CallbackQueue::queue_and_run(|cb_queue| {
            for (fd, file) in [(5, file_a), (6, file_b)] {
                epoll
                    .borrow_mut()
                    .ctl(
                        EpollCtlOp::Add,
                        fd,
                        file,
                        EpollEvents::EPOLLIN,
                        fd as u64,
                        Arc::downgrade(&epoll),
                        cb_queue,
                    )
                    .unwrap();
            }
        });

        write_eventfd(&eventfd_a, 1);
        write_eventfd(&eventfd_b, 1);

        // with room for only one event per call, the two level-triggered
        // entries alternate rather than starving one another
        let collect_one = || {
            CallbackQueue::queue_and_run(|cb_queue| {
                epoll.borrow_mut().collect_ready_events(cb_queue, 1)
            })
        };
        let first = collect_one();
        let second = collect_one();
        let third = collect_one();

        assert_eq!(first.len(), 1);
        assert_ne!(first[0].1, second[0].1);
        assert_eq!(first[0].1, third[0].1);
    }

    #[test]
    fn test_ctl_errors() {
        let epoll = Epoll::new(FileStatus::empty());
        let (_eventfd, file) = new_eventfd_file(0);

        CallbackQueue::queue_and_run(|cb_queue| {
            // modifying an unknown entry
            assert!(epoll
                .borrow_mut()
                .ctl(
                    EpollCtlOp::Mod,
                    5,
                    file.clone(),
                    EpollEvents::EPOLLIN,
                    0,
                    Arc::downgrade(&epoll),
                    cb_queue,
                )
                .is_err());

            epoll
                .borrow_mut()
                .ctl(
                    EpollCtlOp::Add,
                    5,
                    file.clone(),
                    EpollEvents::EPOLLIN,
                    0,
                    Arc::downgrade(&epoll),
                    cb_queue,
                )
                .unwrap();

            // adding twice
            assert!(epoll
                .borrow_mut()
                .ctl(
                    EpollCtlOp::Add,
                    5,
                    file.clone(),
                    EpollEvents::EPOLLIN,
                    0,
                    Arc::downgrade(&epoll),
                    cb_queue,
                )
                .is_err());

            // deleting works exactly once
            epoll
                .borrow_mut()
                .ctl(
                    EpollCtlOp::Del,
                    5,
                    file.clone(),
                    EpollEvents::empty(),
                    0,
                    Arc::downgrade(&epoll),
                    cb_queue,
                )
                .unwrap();
            assert!(epoll
                .borrow_mut()
                .ctl(
                    EpollCtlOp::Del,
                    5,
                    file,
                    EpollEvents::empty(),
                    0,
                    Arc::downgrade(&epoll),
                    cb_queue,
                )
                .is_err());
        });
    }
}
