//! A thread pool that broadcasts one task to every worker thread and blocks
//! until all of them finish it. The round barrier of the scheduler.

use crossbeam::channel::{Receiver, Sender};

type Job = Box<dyn FnOnce(usize) + Send>;

pub struct WorkPool {
    handles: Vec<std::thread::JoinHandle<()>>,
    job_senders: Vec<Sender<Job>>,
    done_recv: Receiver<()>,
}

impl WorkPool {
    /// Start `num_threads` named threads. `thread_init` runs once on each
    /// thread before any job.
    pub fn new(
        num_threads: usize,
        thread_name: &str,
        thread_init: impl Fn(usize) + Send + Sync + Clone + 'static,
    ) -> Self {
        assert!(num_threads > 0);

        let (done_send, done_recv) = crossbeam::channel::unbounded::<()>();

        let mut handles = Vec::with_capacity(num_threads);
        let mut job_senders = Vec::with_capacity(num_threads);

        for thread_idx in 0..num_threads {
            let (job_send, job_recv) = crossbeam::channel::unbounded::<Job>();
            let done_send = done_send.clone();
            let thread_init = thread_init.clone();

            let handle = std::thread::Builder::new()
                .name(thread_name.to_string())
                .spawn(move || {
                    thread_init(thread_idx);
                    // a closed channel means the pool is shutting down
                    while let Ok(job) = job_recv.recv() {
                        job(thread_idx);
                        done_send.send(()).unwrap();
                    }
                })
                .unwrap();

            handles.push(handle);
            job_senders.push(job_send);
        }

        Self {
            handles,
            job_senders,
            done_recv,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.handles.len()
    }

    /// Run `f` once on every thread, blocking until all threads finish.
    pub fn run(&self, f: impl Fn(usize) + Send + Sync + 'static) {
        let f = std::sync::Arc::new(f);

        for sender in &self.job_senders {
            let f = std::sync::Arc::clone(&f);
            sender.send(Box::new(move |thread_idx| f(thread_idx))).unwrap();
        }

        // the barrier: all threads have finished the job
        for _ in 0..self.job_senders.len() {
            self.done_recv.recv().unwrap();
        }
    }

    /// Stop and join the threads.
    pub fn join(mut self) {
        // closing the job channels ends the worker loops
        self.job_senders.clear();
        for handle in self.handles.drain(..) {
            handle.join().expect("A worker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_runs_on_every_thread() {
        let pool = WorkPool::new(4, "test-worker", |_| {});

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        pool.run(move |_| {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(counter.load(Ordering::Relaxed), 4);
        pool.join();
    }

    #[test]
    fn test_run_is_a_barrier() {
        let pool = WorkPool::new(2, "test-worker", |_| {});

        let counter = Arc::new(AtomicUsize::new(0));
        for round in 0..10 {
            let counter_clone = Arc::clone(&counter);
            pool.run(move |_| {
                // every thread observes the counts of all previous rounds
                assert!(counter_clone.load(Ordering::SeqCst) >= round * 2);
                counter_clone.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(counter.load(Ordering::SeqCst), 20);
        pool.join();
    }

    #[test]
    fn test_thread_init_runs_once_per_thread() {
        let init_count = Arc::new(AtomicUsize::new(0));
        let init_count_clone = Arc::clone(&init_count);

        let pool = WorkPool::new(3, "test-worker", move |_| {
            init_count_clone.fetch_add(1, Ordering::Relaxed);
        });

        pool.run(|_| {});
        pool.run(|_| {});

        assert_eq!(init_count.load(Ordering::Relaxed), 3);
        pool.join();
    }
}
