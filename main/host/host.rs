//! A virtual host: the owner of descriptors, processes, a network interface
//! and an event queue. A host is touched by at most one worker within a
//! round, which gives it single-writer discipline; its fields use interior
//! mutability so that tasks and descriptor callbacks can reach it through a
//! shared reference.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::unsync::OnceCell;
use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::simulation_time::SimulationTime;
use umbra_shim_helper::HostId;

use crate::core::work::event::Event;
use crate::core::work::event_queue::EventQueue;
use crate::core::work::task::TaskRef;
use crate::core::worker::Worker;
use crate::host::descriptor::descriptor_table::DescriptorTable;
use crate::host::descriptor::Descriptor;
use crate::host::futex_table::FutexTable;
use crate::host::process::{Process, ProcessId};
use crate::network::interface::NetworkInterface;
use crate::network::packet::Packet;
use crate::utility::callback_queue::CallbackQueue;
use crate::utility::random::Random;

/// Immutable information about the Host, cheap to clone into the logger.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub id: HostId,
    pub name: String,
    pub default_ip: Ipv4Addr,
}

pub struct HostParameters {
    pub id: HostId,
    pub name: String,
    pub ip: Ipv4Addr,
    /// Derived from the global seed and the host id, so host behavior is
    /// independent of scheduling.
    pub seed: u64,
}

/// An application to launch on a host at a given simulated time.
#[derive(Debug, Clone)]
pub struct Application {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub start_time: SimulationTime,
}

/// A simulated Host.
pub struct Host {
    id: HostId,
    name: String,
    default_ip: Ipv4Addr,

    info: OnceCell<Arc<HostInfo>>,

    /// This host's portion of the simulation's event queue. Shared so that
    /// packets from other hosts can be pushed into it at round boundaries.
    event_queue: Arc<Mutex<EventQueue>>,

    random: RefCell<Random>,
    descriptor_table: RefCell<DescriptorTable>,
    interface: NetworkInterface,
    futex_table: RefCell<FutexTable>,
    processes: RefCell<BTreeMap<ProcessId, Process>>,
    applications: RefCell<Vec<Application>>,

    // Monotonic counters. The event id counter is shared with schedule
    // handles so parked continuations can mint ids without the host.
    next_event_id: Arc<AtomicU64>,
    next_packet_id: Cell<u64>,
    next_deterministic_sequence: Cell<u64>,
    next_process_id: Cell<u32>,
}

// Host is moved between workers across rounds.
impl crate::utility::IsSend for Host {}

impl Host {
    pub fn new(params: HostParameters) -> Self {
        Self {
            id: params.id,
            name: params.name,
            default_ip: params.ip,
            info: OnceCell::new(),
            event_queue: Arc::new(Mutex::new(EventQueue::new())),
            random: RefCell::new(Random::new(params.seed)),
            descriptor_table: RefCell::new(DescriptorTable::new()),
            interface: NetworkInterface::new(params.ip),
            futex_table: RefCell::new(FutexTable::new()),
            processes: RefCell::new(BTreeMap::new()),
            applications: RefCell::new(Vec::new()),
            next_event_id: Arc::new(AtomicU64::new(0)),
            next_packet_id: Cell::new(0),
            next_deterministic_sequence: Cell::new(0),
            next_process_id: Cell::new(0),
        }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_ip(&self) -> Ipv4Addr {
        self.default_ip
    }

    /// Information about the Host, made available as an Arc for cheap cloning
    /// into e.g. the logger.
    pub fn info(&self) -> &Arc<HostInfo> {
        self.info.get_or_init(|| {
            Arc::new(HostInfo {
                id: self.id,
                name: self.name.clone(),
                default_ip: self.default_ip,
            })
        })
    }

    pub fn with_random_mut<T>(&self, f: impl FnOnce(&mut Random) -> T) -> T {
        f(&mut self.random.borrow_mut())
    }

    pub fn get_new_event_id(&self) -> u64 {
        self.next_event_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get_new_packet_id(&self) -> u64 {
        let id = self.next_packet_id.get();
        self.next_packet_id.set(id + 1);
        id
    }

    /// The next value of a monotonically increasing determinism sequence.
    /// Sorting by these values establishes a deterministic order for items
    /// that are otherwise inconsistently ordered (e.g. hash table iterators).
    pub fn next_deterministic_sequence_value(&self) -> u64 {
        let id = self.next_deterministic_sequence.get();
        self.next_deterministic_sequence.set(id + 1);
        id
    }

    pub fn event_queue(&self) -> &Arc<Mutex<EventQueue>> {
        &self.event_queue
    }

    pub fn interface(&self) -> &NetworkInterface {
        &self.interface
    }

    pub fn with_descriptor_table<T>(&self, f: impl FnOnce(&DescriptorTable) -> T) -> T {
        f(&self.descriptor_table.borrow())
    }

    pub fn with_descriptor_table_mut<T>(&self, f: impl FnOnce(&mut DescriptorTable) -> T) -> T {
        f(&mut self.descriptor_table.borrow_mut())
    }

    /// Register a descriptor at the lowest free handle at or above 3,
    /// leaving the conventional stdio handles alone.
    pub fn register_descriptor(&self, descriptor: Descriptor) -> u32 {
        self.descriptor_table.borrow_mut().add(descriptor, 3)
    }

    /// A clone of the descriptor at `handle`, if any. Cheap: descriptors are
    /// reference handles to their files.
    pub fn descriptor(&self, handle: u32) -> Option<Descriptor> {
        self.descriptor_table.borrow().get(handle).cloned()
    }

    pub fn deregister_descriptor(&self, handle: u32) -> Option<Descriptor> {
        self.descriptor_table.borrow_mut().remove(handle)
    }

    pub fn with_futex_table_mut<T>(&self, f: impl FnOnce(&mut FutexTable) -> T) -> T {
        f(&mut self.futex_table.borrow_mut())
    }

    /// A handle that can schedule tasks onto this host without holding a
    /// reference to it. Used by parked syscall conditions.
    pub fn schedule_handle(&self) -> HostScheduleHandle {
        HostScheduleHandle {
            host_id: self.id,
            queue: Arc::clone(&self.event_queue),
            next_event_id: Arc::clone(&self.next_event_id),
        }
    }

    /// Schedule a task for this host at time `t`. Returns false if `t` is
    /// beyond the end of the simulation.
    pub fn schedule_task_at_emulated_time(&self, task: TaskRef, t: EmulatedTime) -> bool {
        if let Some(end_time) = Worker::with_shared(|shared| shared.sim_end_time) {
            if t >= end_time {
                return false;
            }
        }

        let event = Event::new(task, t, self, self.id);
        self.event_queue.lock().unwrap().push(event);
        true
    }

    /// Schedule a task for this host at a time `delay` from now.
    pub fn schedule_task_with_delay(&self, task: TaskRef, delay: SimulationTime) -> bool {
        let now = Worker::current_time().unwrap();
        self.schedule_task_at_emulated_time(task, now + delay)
    }

    pub fn next_event_time(&self) -> Option<EmulatedTime> {
        self.event_queue.lock().unwrap().next_event_time()
    }

    /// Drain and execute this host's events with times strictly before
    /// `until`. The worker granted us the window, so no event outside it may
    /// run (the safe-time horizon).
    pub fn execute(&self, until: EmulatedTime) {
        Worker::set_active_host(self);
        Worker::set_active_host_info(Some(Arc::clone(self.info())));

        loop {
            if Worker::shutdown_requested() {
                break;
            }

            let event = self.event_queue.lock().unwrap().pop_due(until);
            let Some(event) = event else {
                break;
            };

            Worker::set_current_time(event.time());
            event.execute(self);
        }

        Worker::clear_current_time();
        Worker::set_active_host_info(None);
        Worker::clear_active_host();
    }

    /// Hand a packet that arrived from the fabric to the owning socket.
    pub fn deliver_packet(&self, packet: Packet) {
        log::trace!("Host {} received {packet}", self.name);
        self.interface.deliver(self, packet);
    }

    pub fn add_application(&self, application: Application) {
        self.applications.borrow_mut().push(application);
    }

    /// Schedule the launch of every configured application.
    pub fn boot(&self) {
        for application in self.applications.borrow().iter() {
            let start_time = EmulatedTime::SIMULATION_START + application.start_time;
            let application_clone = application.clone();
            let task = TaskRef::new(move |host: &Host| host.spawn_process(&application_clone));
            if !self.schedule_task_at_emulated_time(task, start_time) {
                log::warn!(
                    "Application {:?} on host {} starts after the simulation ends",
                    application.path,
                    self.name
                );
            }
        }
    }

    fn spawn_process(&self, application: &Application) {
        let pid = ProcessId::from(self.next_process_id.get());
        self.next_process_id.set(self.next_process_id.get() + 1);

        match Process::spawn(self, pid, application) {
            Ok(process) => {
                log::debug!(
                    "Host {} launched process {} ({:?})",
                    self.name,
                    pid,
                    application.path
                );
                self.processes.borrow_mut().insert(pid, process);
                self.resume_process(pid);
            }
            Err(e) => {
                log::error!(
                    "Host {} failed to launch {:?}: {e}",
                    self.name,
                    application.path
                );
                Worker::increment_process_error_count();
            }
        }
    }

    /// Run the given process until it blocks, exits, or dies. The process is
    /// temporarily removed from the table so that its syscalls can reach the
    /// rest of the host without aliasing it.
    pub fn resume_process(&self, pid: ProcessId) {
        let Some(mut process) = self.processes.borrow_mut().remove(&pid) else {
            // exited before a stale resume event fired
            return;
        };

        process.resume(self);

        if process.has_exited() {
            log::debug!("Host {}: process {} exited", self.name, pid);
        } else {
            self.processes.borrow_mut().insert(pid, process);
        }
    }

    /// Kill remaining processes and close all descriptors. Called once at
    /// the end of the simulation.
    pub fn shutdown(&self) {
        // dropping a process kills and reaps its native child
        self.processes.borrow_mut().clear();

        CallbackQueue::queue_and_run(|cb_queue| {
            for descriptor in self.descriptor_table.borrow_mut().remove_all() {
                descriptor.close(cb_queue);
            }
        });
    }

    /// Pick an unused ephemeral port deterministically.
    pub fn select_ephemeral_port(
        &self,
        protocol: crate::network::packet::ProtocolType,
    ) -> Option<u16> {
        let mut random = self.random.borrow_mut();
        self.interface.select_ephemeral_port(protocol, &mut random)
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ip", &self.default_ip)
            .finish_non_exhaustive()
    }
}

/// Schedules tasks onto a host's event queue without borrowing the host.
#[derive(Clone)]
pub struct HostScheduleHandle {
    host_id: HostId,
    queue: Arc<Mutex<EventQueue>>,
    next_event_id: Arc<AtomicU64>,
}

impl HostScheduleHandle {
    pub fn schedule(&self, task: TaskRef, time: EmulatedTime) {
        let event_id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let event = Event::from_parts(task, time, self.host_id, self.host_id, event_id);
        self.queue.lock().unwrap().push(event);
    }
}
