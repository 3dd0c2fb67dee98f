//! A self-contained single-producer single-consumer channel. The whole
//! channel lives inside its own allocation with no pointers, so it can be
//! placed in memory shared between the engine and a managed process. The
//! futex word doubles as the channel state, which is what makes the two
//! event-counter semaphores of the control block possible with one word per
//! direction.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

// The low byte holds the contents state; flag bits live above it.
const CONTENTS_MASK: u32 = 0xff;
const CONTENTS_EMPTY: u32 = 0;
const CONTENTS_WRITING: u32 = 1;
const CONTENTS_READY: u32 = 2;
const CONTENTS_READING: u32 = 3;
const WRITER_CLOSED: u32 = 1 << 9;
const HAS_SLEEPER: u32 = 1 << 10;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SelfContainedChannelError {
    WriterIsClosed,
}

impl std::fmt::Display for SelfContainedChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelfContainedChannelError::WriterIsClosed => write!(f, "WriterIsClosed"),
        }
    }
}

fn futex_wait(word: &AtomicU32, expected: u32) {
    // Not FUTEX_PRIVATE: the waiter and waker are in different processes.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
            0usize,
            0u32,
        )
    };
    // A result of EAGAIN or EINTR just means the state may have changed;
    // the caller re-checks in a loop either way.
}

fn futex_wake_one(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            1u32,
            std::ptr::null::<libc::timespec>(),
            0usize,
            0u32,
        )
    };
}

/// A minimal SPSC channel holding at most one message.
///
/// Contract: `send` and `receive` must each be called from at most one
/// thread at a time, and `send` must not be called while a message is still
/// pending. Violations panic. `close_writer` may be called from anywhere,
/// including a watchdog that noticed the writing process died.
#[repr(C)]
pub struct SelfContainedChannel<T> {
    message: UnsafeCell<MaybeUninit<T>>,
    state: AtomicU32,
}

impl<T> SelfContainedChannel<T> {
    pub fn new() -> Self {
        Self {
            message: UnsafeCell::new(MaybeUninit::uninit()),
            state: AtomicU32::new(CONTENTS_EMPTY),
        }
    }

    fn transition_contents(&self, from: u32, to: u32, order: Ordering) -> u32 {
        self.state
            .fetch_update(order, Ordering::Relaxed, |state| {
                assert_eq!(state & CONTENTS_MASK, from);
                Some((state & !CONTENTS_MASK) | to)
            })
            .unwrap()
    }

    /// Sends `message` through the channel.
    ///
    /// Panics if the channel already holds an unreceived message.
    pub fn send(&self, message: T) {
        self.transition_contents(CONTENTS_EMPTY, CONTENTS_WRITING, Ordering::Acquire);
        unsafe { (*self.message.get()).as_mut_ptr().write(message) };
        let prev = self.transition_contents(CONTENTS_WRITING, CONTENTS_READY, Ordering::Release);
        if prev & HAS_SLEEPER != 0 {
            futex_wake_one(&self.state);
        }
    }

    /// Blocks until the channel holds a message or the writer has closed it.
    pub fn receive(&self) -> Result<T, SelfContainedChannelError> {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & CONTENTS_MASK == CONTENTS_READY {
                break;
            }
            if state & WRITER_CLOSED != 0 {
                return Err(SelfContainedChannelError::WriterIsClosed);
            }
            assert!(state & HAS_SLEEPER == 0);
            let sleeper_state = state | HAS_SLEEPER;
            match self.state.compare_exchange(
                state,
                sleeper_state,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => (),
                Err(s) => {
                    // Something changed; re-evaluate.
                    state = s;
                    continue;
                }
            }
            futex_wait(&self.state, sleeper_state);
            // Clear the sleeper bit and re-evaluate.
            state = self
                .state
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
                    Some(s & !HAS_SLEEPER)
                })
                .unwrap()
                & !HAS_SLEEPER;
        }
        self.transition_contents(CONTENTS_READY, CONTENTS_READING, Ordering::Acquire);
        let val = unsafe { (*self.message.get()).assume_init_read() };
        self.transition_contents(CONTENTS_READING, CONTENTS_EMPTY, Ordering::Release);
        Ok(val)
    }

    /// Closes the write end. Any current or subsequent `receive` fails once
    /// the channel is empty. Safe to call in parallel with other operations.
    pub fn close_writer(&self) {
        let prev = self
            .state
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
                Some(s | WRITER_CLOSED)
            })
            .unwrap();
        if prev & HAS_SLEEPER != 0 {
            futex_wake_one(&self.state);
        }
    }

    pub fn writer_is_closed(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER_CLOSED != 0
    }
}

unsafe impl<T> Send for SelfContainedChannel<T> where T: Send {}
unsafe impl<T> Sync for SelfContainedChannel<T> where T: Send {}

impl<T> Drop for SelfContainedChannel<T> {
    fn drop(&mut self) {
        // Acquire-ordering to synchronize with the Release store in `send`.
        let state = self.state.load(Ordering::Acquire);
        if state & CONTENTS_MASK == CONTENTS_READY {
            unsafe { (*self.message.get()).assume_init_drop() }
        }
    }
}

impl<T> Default for SelfContainedChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_send_receive() {
        let channel = SelfContainedChannel::<u32>::new();
        channel.send(42);
        assert_eq!(channel.receive(), Ok(42));
    }

    #[test]
    fn test_closed_writer() {
        let channel = SelfContainedChannel::<u32>::new();
        channel.send(1);
        channel.close_writer();
        // a pending message is still delivered, then the close is observed
        assert_eq!(channel.receive(), Ok(1));
        assert_eq!(
            channel.receive(),
            Err(SelfContainedChannelError::WriterIsClosed)
        );
    }

    #[test]
    fn test_ping_pong() {
        let to_b = Arc::new(SelfContainedChannel::<u32>::new());
        let to_a = Arc::new(SelfContainedChannel::<u32>::new());

        let thread = {
            let to_b = Arc::clone(&to_b);
            let to_a = Arc::clone(&to_a);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let x = to_b.receive().unwrap();
                    to_a.send(x + 1);
                }
            })
        };

        let mut val = 0;
        for _ in 0..100 {
            to_b.send(val);
            val = to_a.receive().unwrap();
        }
        thread.join().unwrap();
        assert_eq!(val, 100);
    }

    #[test]
    fn test_close_unblocks_receiver() {
        let channel = Arc::new(SelfContainedChannel::<u32>::new());
        let thread = {
            let channel = Arc::clone(&channel);
            std::thread::spawn(move || channel.receive())
        };
        // give the receiver a chance to park
        std::thread::sleep(std::time::Duration::from_millis(10));
        channel.close_writer();
        assert_eq!(
            thread.join().unwrap(),
            Err(SelfContainedChannelError::WriterIsClosed)
        );
    }
}
