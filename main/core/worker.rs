use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::atomic::AtomicCell;
use rand::Rng;
use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::simulation_time::SimulationTime;
use umbra_shim_helper::HostId;

use crate::core::runahead::Runahead;
use crate::core::work::event::Event;
use crate::core::work::event_queue::EventQueue;
use crate::core::work::task::TaskRef;
use crate::host::host::{Host, HostInfo};
use crate::network::graph::{IpAssignment, RoutingInfo};
use crate::network::packet::Packet;

// thread-local worker state; initialized when the worker thread starts running
std::thread_local! {
    static WORKER: once_cell::unsync::OnceCell<Worker> = once_cell::unsync::OnceCell::new();
}

#[derive(Copy, Clone, Debug)]
pub struct WorkerThreadID(pub u32);

struct Clock {
    now: Option<EmulatedTime>,
    barrier: Option<EmulatedTime>,
}

/// Worker context, containing 'global' information for the current thread.
pub struct Worker {
    #[allow(unused)]
    worker_id: WorkerThreadID,

    shared: Arc<WorkerShared>,

    // Information about the host currently being run on this worker, used by
    // code that doesn't have access to the host itself (e.g. the logger).
    active_host_info: RefCell<Option<Arc<HostInfo>>>,

    // The host currently executing an event on this worker. Only valid for
    // the duration of `Host::execute`, which sets and clears it.
    active_host: Cell<Option<*const Host>>,

    clock: RefCell<Clock>,

    // A saved copy of this worker's minimum used latency, so that we don't
    // take the shared lock for latencies we've already reported.
    min_latency_cache: Cell<Option<SimulationTime>>,
}

impl Worker {
    /// Create the worker for this thread. Panics if the thread already has one.
    pub fn new_for_this_thread(shared: Arc<WorkerShared>, worker_id: WorkerThreadID) {
        WORKER.with(|worker| {
            let res = worker.set(Self {
                worker_id,
                shared,
                active_host_info: RefCell::new(None),
                active_host: Cell::new(None),
                clock: RefCell::new(Clock {
                    now: None,
                    barrier: None,
                }),
                min_latency_cache: Cell::new(None),
            });
            assert!(res.is_ok(), "Worker already initialized");
        });
    }

    // Runs `f` with a shared reference to the current thread's Worker. Returns
    // None if this thread has no Worker object.
    #[must_use]
    fn with<F, O>(f: F) -> Option<O>
    where
        F: FnOnce(&Worker) -> O,
    {
        WORKER.try_with(|w| w.get().map(f)).ok().flatten()
    }

    /// Whether currently running on a live Worker.
    pub fn is_alive() -> bool {
        Worker::with(|_| ()).is_some()
    }

    /// Run `f` with the shared simulation state, or return None if this thread
    /// has no Worker.
    #[must_use]
    pub fn with_shared<F, O>(f: F) -> Option<O>
    where
        F: FnOnce(&WorkerShared) -> O,
    {
        Worker::with(|w| f(&w.shared))
    }

    /// Set information about the host this worker is currently running.
    pub fn set_active_host_info(info: Option<Arc<HostInfo>>) {
        Worker::with(|w| *w.active_host_info.borrow_mut() = info).unwrap();
    }

    /// Information about the host this worker is currently running, if any.
    pub fn active_host_info() -> Option<Arc<HostInfo>> {
        Worker::with(|w| w.active_host_info.borrow().clone()).flatten()
    }

    /// Mark `host` as the host executing on this worker. Must be paired with
    /// [`Worker::clear_active_host`] before the reference expires.
    pub(crate) fn set_active_host(host: &Host) {
        Worker::with(|w| w.active_host.set(Some(host as *const Host))).unwrap();
    }

    pub(crate) fn clear_active_host() {
        Worker::with(|w| w.active_host.set(None)).unwrap();
    }

    /// Run `f` with a reference to the host currently executing on this
    /// worker, or return None if there is no active host.
    #[must_use]
    pub fn with_active_host<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&Host) -> R,
    {
        Worker::with(|w| {
            let ptr = w.active_host.get()?;
            // The pointer was set by `Host::execute` on this thread and is
            // cleared before the host reference expires; hosts are never
            // mutably aliased (mutation is interior), so a shared reborrow
            // here is sound.
            Some(f(unsafe { &*ptr }))
        })
        .flatten()
    }

    pub fn set_round_end_time(t: EmulatedTime) {
        Worker::with(|w| w.clock.borrow_mut().barrier.replace(t)).unwrap();
    }

    pub fn round_end_time() -> Option<EmulatedTime> {
        Worker::with(|w| w.clock.borrow().barrier).flatten()
    }

    pub fn set_current_time(t: EmulatedTime) {
        Worker::with(|w| w.clock.borrow_mut().now.replace(t)).unwrap();
    }

    pub fn clear_current_time() {
        Worker::with(|w| w.clock.borrow_mut().now.take()).unwrap();
    }

    pub fn current_time() -> Option<EmulatedTime> {
        Worker::with(|w| w.clock.borrow().now).flatten()
    }

    pub fn is_bootstrapping() -> bool {
        Worker::with(|w| w.clock.borrow().now.unwrap() < w.shared.bootstrap_end_time).unwrap()
    }

    pub fn shutdown_requested() -> bool {
        Worker::with(|w| w.shared.shutdown_requested.load(Ordering::Relaxed)).unwrap_or(false)
    }

    pub fn update_lowest_used_latency(t: SimulationTime) {
        assert!(t != SimulationTime::ZERO);

        Worker::with(|w| {
            let min_latency_cache = w.min_latency_cache.get();
            if min_latency_cache.is_none() || t < min_latency_cache.unwrap() {
                w.min_latency_cache.set(Some(t));
                w.shared.runahead.update_lowest_used_latency(t);
            }
        })
        .unwrap();
    }

    /// Schedule a task for `host` at time `t`. Returns false if `t` is beyond
    /// the end of the simulation.
    pub fn schedule_task_at_emulated_time(task: TaskRef, host: &Host, t: EmulatedTime) -> bool {
        host.schedule_task_at_emulated_time(task, t)
    }

    /// Schedule a task for `host` at a delay from the current time.
    pub fn schedule_task_with_delay(task: TaskRef, host: &Host, delay: SimulationTime) -> bool {
        host.schedule_task_with_delay(task, delay)
    }

    pub fn increment_process_error_count() {
        Worker::with(|w| {
            w.shared.num_process_errors.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }

    /// Send a packet from `src_host` into the fabric. Samples loss, computes
    /// the path latency, and schedules an arrival event on the destination
    /// host. This is the only place where events cross between hosts.
    pub fn send_packet(src_host: &Host, packet: Packet) {
        let current_time = Worker::current_time().unwrap();
        let round_end_time = Worker::round_end_time().unwrap();
        let shared = Worker::with(|w| Arc::clone(&w.shared)).unwrap();

        if current_time >= shared.sim_end_time {
            // the simulation is over, don't bother
            return;
        }
        let is_bootstrapping = current_time < shared.bootstrap_end_time;

        let src_ip = *packet.src().ip();
        let dst_ip = *packet.dst().ip();

        let Some(dst_host_id) = shared.resolve_ip_to_host_id(dst_ip) else {
            log::warn!("No host for destination address {dst_ip}; dropping packet");
            return;
        };

        // check if network reliability forces us to 'drop' the packet
        let reliability: f64 = shared.reliability(src_ip, dst_ip).unwrap().into();
        let chance: f64 = src_host.with_random_mut(|rng| rng.gen());

        // don't drop control packets with length 0, otherwise congestion control has
        // problems responding to packet loss
        if !is_bootstrapping && chance >= reliability && packet.payload_len() > 0 {
            log::trace!(
                "Packet {}->{} lost in transit (chance={chance:.3}, reliability={reliability:.3})",
                packet.src(),
                packet.dst(),
            );
            return;
        }

        let delay = shared.latency(src_ip, dst_ip).unwrap();
        let deliver_time = current_time + delay;

        Worker::update_lowest_used_latency(delay);
        shared.increment_packet_count(src_ip, dst_ip);

        let packet = Arc::new(AtomicCell::new(Some(packet)));
        let packet_task = TaskRef::new(move |host| {
            let packet = packet.take().expect("Packet task ran twice");
            host.deliver_packet(packet);
        });

        let mut packet_event = Event::new(packet_task, deliver_time, src_host, dst_host_id);

        // delay the packet until the next round
        if deliver_time < round_end_time {
            packet_event.set_time(round_end_time);
        }

        debug_assert!(packet_event.time() >= round_end_time);
        shared.push_to_host(dst_host_id, packet_event);
    }
}

/// Simulation state shared between all workers. Immutable after bootstrap
/// except for the per-host event queues (locked pushes) and a few counters.
pub struct WorkerShared {
    /// Maps addresses to graph attachment points.
    pub ip_assignment: IpAssignment<u32>,
    /// Maps addresses to hosts, for event addressing.
    pub ip_to_host: HashMap<Ipv4Addr, HostId>,
    /// Path properties between graph nodes.
    pub routing_info: RoutingInfo<u32>,
    /// Every host's event queue. Cross-host events are pushed here.
    pub event_queues: HashMap<HostId, Arc<Mutex<EventQueue>>>,
    /// Computes the round window for the next scheduling round.
    pub runahead: Runahead,
    /// Packet loss is disabled before this time so that applications can set
    /// themselves up over a reliable network.
    pub bootstrap_end_time: EmulatedTime,
    pub sim_end_time: EmulatedTime,
    /// Set by the signal handler; checked between events.
    pub shutdown_requested: Arc<AtomicBool>,
    /// Number of managed processes that exited with a non-zero code.
    pub num_process_errors: AtomicU32,
}

impl WorkerShared {
    pub fn latency(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<SimulationTime> {
        let src = self.ip_assignment.get_node(src.into())?;
        let dst = self.ip_assignment.get_node(dst.into())?;

        Some(SimulationTime::from_nanos(
            self.routing_info.path(src, dst)?.latency_ns,
        ))
    }

    pub fn reliability(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<f32> {
        let src = self.ip_assignment.get_node(src.into())?;
        let dst = self.ip_assignment.get_node(dst.into())?;

        Some(1.0 - self.routing_info.path(src, dst)?.packet_loss)
    }

    pub fn increment_packet_count(&self, src: Ipv4Addr, dst: Ipv4Addr) {
        let src = self.ip_assignment.get_node(src.into()).unwrap();
        let dst = self.ip_assignment.get_node(dst.into()).unwrap();

        self.routing_info.increment_packet_count(src, dst)
    }

    pub fn resolve_ip_to_host_id(&self, ip: Ipv4Addr) -> Option<HostId> {
        self.ip_to_host.get(&ip).copied()
    }

    pub fn push_to_host(&self, host: HostId, event: Event) {
        let event_queue = self.event_queues.get(&host).unwrap();
        event_queue.lock().unwrap().push(event);
    }

    pub fn process_error_count(&self) -> u32 {
        self.num_process_errors.load(Ordering::Relaxed)
    }
}
