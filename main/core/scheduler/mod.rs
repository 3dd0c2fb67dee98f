//! The host scheduler: a fixed pool of workers cooperatively drains all
//! hosts, one round at a time. Within a round each host is claimed by
//! exactly one worker, which gives every host single-writer discipline; the
//! claim order comes from a shared cursor so any worker may run any host.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use umbra_shim_helper::emulated_time::EmulatedTime;

use crate::core::scheduler::pools::WorkPool;
use crate::core::worker::{Worker, WorkerShared, WorkerThreadID};
use crate::host::host::Host;

pub mod pools;

struct SchedulerShared {
    /// Hosts in their deterministic creation order. A worker claims a host
    /// by taking it out of its slot for the duration of the round.
    hosts: Vec<Mutex<Option<Box<Host>>>>,
    /// The next unclaimed host index in the current round.
    cursor: AtomicUsize,
}

pub struct Scheduler {
    pool: WorkPool,
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    pub fn new(
        parallelism: usize,
        hosts: Vec<Box<Host>>,
        worker_shared: Arc<WorkerShared>,
    ) -> Self {
        // no point running more workers than hosts
        let num_threads = std::cmp::max(1, std::cmp::min(parallelism, hosts.len()));

        let pool = WorkPool::new(num_threads, "umbra-worker", move |thread_idx| {
            Worker::new_for_this_thread(
                Arc::clone(&worker_shared),
                WorkerThreadID(thread_idx as u32),
            );
        });

        let shared = Arc::new(SchedulerShared {
            hosts: hosts
                .into_iter()
                .map(|host| Mutex::new(Some(host)))
                .collect(),
            cursor: AtomicUsize::new(0),
        });

        Self { pool, shared }
    }

    pub fn parallelism(&self) -> usize {
        self.pool.num_threads()
    }

    /// Run one round: every host executes its events with times strictly
    /// before `window_end`, in parallel. Blocks until the round is done.
    pub fn run_round(&self, window_end: EmulatedTime) {
        self.shared.cursor.store(0, Ordering::Relaxed);

        let shared = Arc::clone(&self.shared);
        self.pool.run(move |_thread_idx| {
            Worker::set_round_end_time(window_end);

            loop {
                let i = shared.cursor.fetch_add(1, Ordering::Relaxed);
                let Some(slot) = shared.hosts.get(i) else {
                    break;
                };

                let mut slot = slot.lock().unwrap();
                let host = slot.as_mut().unwrap();
                host.execute(window_end);
            }
        });
    }

    /// The earliest next event time across all hosts, or None if every queue
    /// is empty. Called between rounds, when no worker holds a host.
    pub fn min_next_event_time(&self) -> Option<EmulatedTime> {
        self.shared
            .hosts
            .iter()
            .filter_map(|slot| slot.lock().unwrap().as_ref().unwrap().next_event_time())
            .min()
    }

    /// Shut down every host (kill processes, close descriptors), in
    /// parallel.
    pub fn shutdown_hosts(&self) {
        self.shared.cursor.store(0, Ordering::Relaxed);

        let shared = Arc::clone(&self.shared);
        self.pool.run(move |_thread_idx| loop {
            let i = shared.cursor.fetch_add(1, Ordering::Relaxed);
            let Some(slot) = shared.hosts.get(i) else {
                break;
            };

            let slot = slot.lock().unwrap();
            slot.as_ref().unwrap().shutdown();
        });
    }

    /// Join the worker threads and drop the hosts.
    pub fn join(self) {
        self.pool.join();
    }
}
