use nix::errno::Errno;

use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::{FileMode, FileState, FileStatus};
use crate::host::syscall::types::SyscallError;
use crate::utility::callback_queue::CallbackQueue;

/// An emulated `eventfd(2)`: a 64-bit kernel counter behind a descriptor.
pub struct EventFd {
    counter: u64,
    is_semaphore_mode: bool,
    event_source: StateEventSource,
    state: FileState,
    status: FileStatus,
    // should only be used by `OpenFile` to make sure there is only ever one `OpenFile` instance
    // for this file
    has_open_file: bool,
}

impl EventFd {
    pub fn new(init_value: u64, is_semaphore_mode: bool, status: FileStatus) -> Self {
        let mut eventfd = Self {
            counter: init_value,
            is_semaphore_mode,
            event_source: StateEventSource::new(),
            state: FileState::ACTIVE | FileState::WRITABLE,
            status,
            has_open_file: false,
        };
        // make the initial READABLE bit consistent with the counter
        CallbackQueue::queue_and_run(|cb_queue| eventfd.update_state(cb_queue));
        eventfd
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
        // set the closed flag and remove the active, readable, and writable flags
        self.copy_state(
            FileState::CLOSED | FileState::ACTIVE | FileState::READABLE | FileState::WRITABLE,
            FileState::CLOSED,
            cb_queue,
        );

        Ok(())
    }

    pub fn read(
        &mut self,
        dst: &mut [u8],
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        // eventfd(2): "Each successful read(2) returns an 8-byte integer"
        const NUM_BYTES: usize = 8;

        if dst.len() < NUM_BYTES {
            log::trace!("Reading from eventfd requires a buffer of at least {NUM_BYTES} bytes");
            return Err(Errno::EINVAL.into());
        }

        if self.counter == 0 {
            log::trace!("Eventfd counter is 0 and cannot be read right now");
            return Err(Errno::EWOULDBLOCK.into());
        }

        // behavior defined in `man 2 eventfd`
        let to_read = if self.is_semaphore_mode {
            self.counter -= 1;
            1u64
        } else {
            let val = self.counter;
            self.counter = 0;
            val
        };
        dst[..NUM_BYTES].copy_from_slice(&to_read.to_ne_bytes());

        self.update_state(cb_queue);

        Ok(NUM_BYTES)
    }

    pub fn write(
        &mut self,
        src: &[u8],
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        // eventfd(2): "A write(2) call adds the 8-byte integer value supplied in its buffer to the
        // counter"
        const NUM_BYTES: usize = 8;

        if src.len() < NUM_BYTES {
            log::trace!("Writing to eventfd requires a buffer with at least {NUM_BYTES} bytes");
            return Err(Errno::EINVAL.into());
        }

        let value = u64::from_ne_bytes(src[..NUM_BYTES].try_into().unwrap());

        if value == u64::MAX {
            log::trace!("We do not allow writing the max counter value");
            return Err(Errno::EINVAL.into());
        }

        const MAX_ALLOWED: u64 = u64::MAX - 1;
        if value > MAX_ALLOWED - self.counter {
            log::trace!("The write value does not currently fit into the counter");
            return Err(Errno::EWOULDBLOCK.into());
        }

        self.counter += value;
        self.update_state(cb_queue);

        Ok(NUM_BYTES)
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

    fn update_state(&mut self, cb_queue: &mut CallbackQueue) {
        if self.state.contains(FileState::CLOSED) {
            return;
        }

        let mut readable_writable = FileState::empty();

        // set the descriptor as readable if we have a non-zero counter
        readable_writable.set(FileState::READABLE, self.counter > 0);
        // set the descriptor as writable if we can write a value of at least 1
        readable_writable.set(FileState::WRITABLE, self.counter < u64::MAX - 1);

        self.copy_state(
            FileState::READABLE | FileState::WRITABLE,
            readable_writable,
            cb_queue,
        );
    }

    fn copy_state(&mut self, mask: FileState, state: FileState, cb_queue: &mut CallbackQueue) {
        let old_state = self.state;

        // remove the masked flags, then copy the masked flags
        self.state.remove(mask);
        self.state.insert(state & mask);

        self.handle_state_change(old_state, cb_queue);
    }

    fn handle_state_change(&mut self, old_state: FileState, cb_queue: &mut CallbackQueue) {
        let states_changed = self.state ^ old_state;

        // if nothing changed
        if states_changed.is_empty() {
            return;
        }

        self.event_source
            .notify_listeners(self.state, states_changed, cb_queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_counter(eventfd: &mut EventFd, cb_queue: &mut CallbackQueue) -> u64 {
        let mut buf = [0u8; 8];
        eventfd.read(&mut buf, cb_queue).unwrap();
        u64::from_ne_bytes(buf)
    }

    fn write_counter(
        eventfd: &mut EventFd,
        val: u64,
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        eventfd.write(&val.to_ne_bytes(), cb_queue)
    }

    #[test]
    fn test_writes_accumulate() {
        CallbackQueue::queue_and_run(|cb_queue| {
            let mut eventfd = EventFd::new(0, false, FileStatus::empty());
            assert!(!eventfd.state().contains(FileState::READABLE));

            write_counter(&mut eventfd, 1, cb_queue).unwrap();
            write_counter(&mut eventfd, 2, cb_queue).unwrap();
            write_counter(&mut eventfd, 3, cb_queue).unwrap();
            assert!(eventfd.state().contains(FileState::READABLE));

            // a single read drains the accumulated counter
            assert_eq!(read_counter(&mut eventfd, cb_queue), 6);
            assert!(!eventfd.state().contains(FileState::READABLE));

            // and the next read would block
            let mut buf = [0u8; 8];
            assert!(matches!(
                eventfd.read(&mut buf, cb_queue),
                Err(SyscallError::Failed(ref f)) if f.errno == Errno::EWOULDBLOCK
            ));
        });
    }

    #[test]
    fn test_write_overflow_blocks() {
        CallbackQueue::queue_and_run(|cb_queue| {
            let mut eventfd = EventFd::new(1, false, FileStatus::empty());

            // the counter is already positive, so u64::MAX - 1 doesn't fit
            assert!(matches!(
                write_counter(&mut eventfd, u64::MAX - 1, cb_queue),
                Err(SyscallError::Failed(ref f)) if f.errno == Errno::EWOULDBLOCK
            ));

            // after a reader drains the counter, it fits
            assert_eq!(read_counter(&mut eventfd, cb_queue), 1);
            write_counter(&mut eventfd, u64::MAX - 1, cb_queue).unwrap();
            // and the counter is now saturated: not writable
            assert!(!eventfd.state().contains(FileState::WRITABLE));
        });
    }

    #[test]
    fn test_write_max_is_invalid() {
        CallbackQueue::queue_and_run(|cb_queue| {
            let mut eventfd = EventFd::new(0, false, FileStatus::empty());
            assert!(matches!(
                write_counter(&mut eventfd, u64::MAX, cb_queue),
                Err(SyscallError::Failed(ref f)) if f.errno == Errno::EINVAL
            ));
        });
    }

    #[test]
    fn test_semaphore_mode() {
        CallbackQueue::queue_and_run(|cb_queue| {
            let mut eventfd = EventFd::new(0, true, FileStatus::empty());

            write_counter(&mut eventfd, 3, cb_queue).unwrap();

            // each read decrements by one and returns one
            assert_eq!(read_counter(&mut eventfd, cb_queue), 1);
            assert_eq!(read_counter(&mut eventfd, cb_queue), 1);
            assert_eq!(read_counter(&mut eventfd, cb_queue), 1);
            assert!(!eventfd.state().contains(FileState::READABLE));
        });
    }

    #[test]
    fn test_listener_notified_exactly_once() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        CallbackQueue::queue_and_run(|cb_queue| {
            let mut eventfd = EventFd::new(0, false, FileStatus::empty());

            let notify_count = Arc::new(AtomicU32::new(0));
            let notify_count_clone = Arc::clone(&notify_count);
            let handle = eventfd.add_listener(
                FileState::READABLE,
                StateListenerFilter::OffToOn,
                move |_state, _changed, _cb_queue| {
                    notify_count_clone.fetch_add(1, Ordering::Relaxed);
                },
            );

            write_counter(&mut eventfd, 1, cb_queue).unwrap();
            // a second write doesn't change READABLE, so no second notification
            write_counter(&mut eventfd, 1, cb_queue).unwrap();
            cb_queue.run();

            assert_eq!(notify_count.load(Ordering::Relaxed), 1);
            handle.stop_listening();
        });
    }
}
