use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;
use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::simulation_time::SimulationTime;

use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::{FileMode, FileState, FileStatus};
use crate::host::host::Host;
use crate::host::syscall::types::SyscallError;
use crate::host::timer::Timer;
use crate::utility::callback_queue::CallbackQueue;

/// An emulated `timerfd_create(2)` timer. Expirations are generated by
/// self-scheduled events and accumulate a count that `read` returns and
/// resets.
pub struct TimerFd {
    timer: Timer,
    event_source: StateEventSource,
    state: FileState,
    status: FileStatus,
    // should only be used by `OpenFile` to make sure there is only ever one `OpenFile` instance
    // for this file
    has_open_file: bool,
}

impl TimerFd {
    /// Creates a new unarmed [`TimerFd`]. The timer's expiry callback holds a
    /// weak reference back to the file so that it can publish readability.
    pub fn new(status: FileStatus) -> Arc<AtomicRefCell<Self>> {
        Arc::new_cyclic(|weak: &std::sync::Weak<AtomicRefCell<Self>>| {
            let weak = weak.clone();
            let timer = Timer::new(move |_host| {
                if let Some(timerfd) = weak.upgrade() {
                    CallbackQueue::queue_and_run(|cb_queue| {
                        timerfd.borrow_mut().update_state(cb_queue)
                    });
                }
            });

            AtomicRefCell::new(Self {
                timer,
                event_source: StateEventSource::new(),
                state: FileState::ACTIVE,
                status,
                has_open_file: false,
            })
        })
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FileStatus) {
        self.status = status;
    }

    pub fn mode(&self) -> FileMode {
        FileMode::READ
    }

    pub fn has_open_file(&self) -> bool {
        self.has_open_file
    }

    pub fn set_has_open_file(&mut self, val: bool) {
        self.has_open_file = val;
    }

    /// The remaining time until the next expiration (None if unarmed) and the
    /// expiration interval.
    pub fn get_time(&self) -> (Option<SimulationTime>, SimulationTime) {
        (self.timer.remaining_time(), self.timer.interval())
    }

    /// Arm the timer to expire at `initial` and then every `interval`
    /// thereafter (a zero interval means one-shot), or disarm it if `initial`
    /// is None. Returns the previous (remaining, interval) pair, following
    /// `timerfd_settime(2)`.
    pub fn set_time(
        &mut self,
        host: &Host,
        initial: Option<EmulatedTime>,
        interval: SimulationTime,
        cb_queue: &mut CallbackQueue,
    ) -> (Option<SimulationTime>, SimulationTime) {
        let old = self.get_time();

        // setting the timer always discards pending expirations
        self.timer.disarm();
        if let Some(initial) = initial {
            self.timer.arm(host, initial, interval);
        }
        self.update_state(cb_queue);

        old
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        self.timer.disarm();

        // set the closed flag and remove the active and readable flags
        self.copy_state(
            FileState::CLOSED | FileState::ACTIVE | FileState::READABLE,
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
        // timerfd_create(2): "read(2) returns an unsigned 8-byte integer containing the number of
        // expirations that have occurred"
        const NUM_BYTES: usize = 8;

        if dst.len() < NUM_BYTES {
            log::trace!("Reading from timerfd requires a buffer of at least {NUM_BYTES} bytes");
            return Err(Errno::EINVAL.into());
        }

        let expiration_count = self.timer.consume_expiration_count();

        if expiration_count == 0 {
            log::trace!("Timerfd expiration count is 0 and cannot be read right now");
            return Err(Errno::EWOULDBLOCK.into());
        }

        dst[..NUM_BYTES].copy_from_slice(&expiration_count.to_ne_bytes());

        // we just read the expiration counter and so are not readable anymore
        self.update_state(cb_queue);

        Ok(NUM_BYTES)
    }

    pub fn write(
        &mut self,
        _src: &[u8],
        _cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        // timerfds don't support writing
        Err(Errno::EINVAL.into())
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

        let mut new_state = FileState::empty();

        // set the descriptor as readable if we have a non-zero expiration count
        new_state.set(FileState::READABLE, self.timer.expiration_count() > 0);

        self.copy_state(FileState::READABLE, new_state, cb_queue);
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
