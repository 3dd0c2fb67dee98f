//! Emulated futexes: wait lists of parked process continuations keyed by the
//! futex word's address in the managed process.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::host::syscall::condition::ConditionWaker;

/// One parked `futex(FUTEX_WAIT)` caller. The handler holds a reference so
/// that, when re-run, it can tell a genuine wakeup apart from a timeout.
pub struct FutexWaiter {
    woken: AtomicBool,
    waker: Arc<ConditionWaker>,
}

impl FutexWaiter {
    pub fn was_woken(&self) -> bool {
        self.woken.load(Ordering::Relaxed)
    }

    fn wake(&self) {
        self.woken.store(true, Ordering::Relaxed);
        self.waker.wake();
    }
}

/// A single futex word and its waiters, in wakeup (FIFO) order.
struct Futex {
    waiters: VecDeque<Arc<FutexWaiter>>,
}

/// A map of managed-memory addresses to futexes. Owned by a host.
pub struct FutexTable {
    futexes: HashMap<u64, Futex>,
}

impl FutexTable {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            futexes: HashMap::new(),
        }
    }

    /// Park a waiter on the futex at `addr`. The returned handle is woken by
    /// [`wake`](Self::wake) in FIFO order.
    pub fn wait(&mut self, addr: u64, waker: Arc<ConditionWaker>) -> Arc<FutexWaiter> {
        let waiter = Arc::new(FutexWaiter {
            woken: AtomicBool::new(false),
            waker,
        });

        self.futexes
            .entry(addr)
            .or_insert_with(|| Futex {
                waiters: VecDeque::new(),
            })
            .waiters
            .push_back(Arc::clone(&waiter));

        waiter
    }

    /// Wake up to `count` waiters of the futex at `addr`. Returns the number
    /// woken.
    pub fn wake(&mut self, addr: u64, count: usize) -> usize {
        let Entry::Occupied(mut entry) = self.futexes.entry(addr) else {
            return 0;
        };

        let mut num_woken = 0;
        while num_woken < count {
            let Some(waiter) = entry.get_mut().waiters.pop_front() else {
                break;
            };
            waiter.wake();
            num_woken += 1;
        }

        if entry.get().waiters.is_empty() {
            entry.remove();
        }

        num_woken
    }

    /// Remove a waiter that stopped waiting on its own (e.g. its timeout
    /// fired before any wake).
    pub fn cancel(&mut self, addr: u64, waiter: &Arc<FutexWaiter>) {
        let Entry::Occupied(mut entry) = self.futexes.entry(addr) else {
            return;
        };
        entry
            .get_mut()
            .waiters
            .retain(|w| !Arc::ptr_eq(w, waiter));
        if entry.get().waiters.is_empty() {
            entry.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::syscall::condition::SyscallCondition;

    fn new_waker() -> Arc<ConditionWaker> {
        SyscallCondition::new(crate::host::syscall::condition::Trigger::Manual).waker()
    }

    #[test]
    fn test_wake_fifo_order() {
        let mut table = FutexTable::new();

        let a = table.wait(0x1000, new_waker());
        let b = table.wait(0x1000, new_waker());
        let c = table.wait(0x1000, new_waker());

        assert_eq!(table.wake(0x1000, 2), 2);
        assert!(a.was_woken());
        assert!(b.was_woken());
        assert!(!c.was_woken());

        assert_eq!(table.wake(0x1000, 10), 1);
        assert!(c.was_woken());

        // the entry is cleaned up once empty
        assert_eq!(table.wake(0x1000, 1), 0);
    }

    #[test]
    fn test_addresses_are_independent() {
        let mut table = FutexTable::new();

        let a = table.wait(0x1000, new_waker());
        let b = table.wait(0x2000, new_waker());

        assert_eq!(table.wake(0x1000, 10), 1);
        assert!(a.was_woken());
        assert!(!b.was_woken());
    }

    #[test]
    fn test_cancel() {
        let mut table = FutexTable::new();

        let a = table.wait(0x1000, new_waker());
        let b = table.wait(0x1000, new_waker());

        table.cancel(0x1000, &a);
        assert_eq!(table.wake(0x1000, 10), 1);
        assert!(!a.was_woken());
        assert!(b.was_woken());
    }
}
