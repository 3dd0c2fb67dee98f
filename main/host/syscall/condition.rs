//! Parked continuations of blocked syscalls.
//!
//! When a syscall handler cannot complete, it returns a condition describing
//! what it is waiting for. The process arms the condition with its resume
//! task and leaves the managed thread suspended; when the condition fires it
//! schedules the resume task, which re-runs the syscall. This is the only
//! suspension point a blocked process has relative to virtual time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::simulation_time::SimulationTime;

use crate::core::work::task::TaskRef;
use crate::core::worker::Worker;
use crate::host::descriptor::listener::{StateListenHandle, StateListenerFilter};
use crate::host::descriptor::{File, FileState};
use crate::host::host::{Host, HostScheduleHandle};
use crate::host::timer::Timer;

/// Fires a parked continuation at most once. Held by whatever is being
/// waited on (a file listener, a timeout timer, a futex wait list).
pub struct ConditionWaker {
    fired: AtomicBool,
    target: AtomicRefCell<Option<(HostScheduleHandle, TaskRef)>>,
}

impl ConditionWaker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicBool::new(false),
            target: AtomicRefCell::new(None),
        })
    }

    /// Schedule the parked continuation at the current time. Subsequent wakes
    /// are no-ops. A wake before the condition is armed is remembered and
    /// fires as soon as the target is set.
    pub fn wake(&self) {
        if self.fired.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some((handle, task)) = &*self.target.borrow() {
            handle.schedule(task.clone(), Worker::current_time().unwrap());
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Relaxed)
    }

    fn set_target(&self, handle: HostScheduleHandle, task: TaskRef) {
        *self.target.borrow_mut() = Some((handle.clone(), task.clone()));
        // a wake arrived before we were armed
        if self.fired.load(Ordering::Relaxed) {
            handle.schedule(task, Worker::current_time().unwrap());
        }
    }
}

/// What a blocked syscall is waiting for.
pub enum Trigger {
    /// Any of the given state bits turning on for the file.
    File { file: File, state: FileState },
    /// Nothing observable; some other component holds the waker and will
    /// fire it explicitly (futexes do this).
    Manual,
}

pub struct SyscallCondition {
    trigger: Trigger,
    timeout: Option<EmulatedTime>,
    waker: Arc<ConditionWaker>,
    // dropping these cancels the respective wakeup paths
    listen_handle: Option<StateListenHandle>,
    timeout_timer: Option<Timer>,
}

impl SyscallCondition {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            timeout: None,
            waker: ConditionWaker::new(),
            listen_handle: None,
            timeout_timer: None,
        }
    }

    pub fn new_from_file(file: File, state: FileState) -> Self {
        Self::new(Trigger::File { file, state })
    }

    /// A condition that fires at `unblock_time` and waits for nothing else.
    pub fn new_from_wakeup_time(unblock_time: EmulatedTime) -> Self {
        let mut cond = Self::new(Trigger::Manual);
        cond.timeout = Some(unblock_time);
        cond
    }

    pub fn set_timeout(&mut self, timeout: Option<EmulatedTime>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<EmulatedTime> {
        self.timeout
    }

    /// The waker, for components that fire the condition explicitly.
    pub fn waker(&self) -> Arc<ConditionWaker> {
        Arc::clone(&self.waker)
    }

    /// Arm the condition: when it fires, `resume` is scheduled on `host` at
    /// the then-current time. Must be called within the event that produced
    /// the blocked syscall, so no state change can slip between the handler's
    /// would-block answer and the listener being registered.
    pub fn arm(&mut self, host: &Host, resume: TaskRef) {
        self.waker.set_target(host.schedule_handle(), resume);

        if let Trigger::File { file, state } = &self.trigger {
            // if the state came on since the handler checked, fire immediately
            if file.borrow().state().intersects(*state) {
                self.waker.wake();
                return;
            }

            let waker = Arc::clone(&self.waker);
            let handle = file.borrow_mut().add_listener(
                *state,
                StateListenerFilter::OffToOn,
                move |_state, _changed, _cb_queue| waker.wake(),
            );
            self.listen_handle = Some(handle);
        }

        if let Some(timeout) = self.timeout {
            let waker = Arc::clone(&self.waker);
            let mut timer = Timer::new(move |_host| waker.wake());
            let now = Worker::current_time().unwrap();
            timer.arm(host, std::cmp::max(timeout, now), SimulationTime::ZERO);
            self.timeout_timer = Some(timer);
        }
    }

    /// Whether the condition's timeout (rather than its trigger) is what
    /// fired, i.e. the current time has reached the timeout.
    pub fn timed_out(&self) -> bool {
        match (self.timeout, Worker::current_time()) {
            (Some(timeout), Some(now)) => now >= timeout,
            _ => false,
        }
    }
}

impl std::fmt::Debug for SyscallCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallCondition")
            .field("timeout", &self.timeout)
            .field("fired", &self.waker.has_fired())
            .finish_non_exhaustive()
    }
}
