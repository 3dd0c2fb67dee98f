//! Simulation bootstrap and the top-level round loop.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Context;
use rand::RngCore;
use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::simulation_time::SimulationTime;
use umbra_shim_helper::HostId;

use crate::core::configuration::ConfigOptions;
use crate::core::runahead::Runahead;
use crate::core::scheduler::Scheduler;
use crate::core::worker::WorkerShared;
use crate::host::host::{Application, Host, HostParameters};
use crate::network::graph::{IpAssignment, NetworkGraph, PathProperties, RoutingInfo};
use crate::utility::random::Random;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimulationOutcome {
    Completed,
    Interrupted,
}

pub struct Controller {
    scheduler: Scheduler,
    shared: Arc<WorkerShared>,
    end_time: EmulatedTime,
}

impl Controller {
    pub fn new(config: &ConfigOptions, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<Self> {
        let graph = NetworkGraph::build(&config.network.graph)
            .map_err(|e| anyhow::anyhow!("Building the network graph: {e}"))?;

        // the graph nodes that hosts actually attach to
        let mut used_nodes = Vec::new();
        for (name, host_options) in &config.hosts {
            let index = *graph
                .node_id_to_index(host_options.network_node_id)
                .with_context(|| {
                    format!(
                        "Host '{name}' refers to unknown network node {}",
                        host_options.network_node_id
                    )
                })?;
            if !used_nodes.contains(&index) {
                used_nodes.push(index);
            }
        }
        if used_nodes.is_empty() {
            anyhow::bail!("The configuration contains no hosts");
        }

        let paths = graph
            .compute_shortest_paths(&used_nodes)
            .map_err(|e| anyhow::anyhow!("Computing routing paths: {e}"))?;

        // re-key the paths by configured node id
        let paths: HashMap<(u32, u32), PathProperties> = paths
            .into_iter()
            .map(|((src, dst), path)| {
                (
                    (
                        graph.node_index_to_id(src).unwrap(),
                        graph.node_index_to_id(dst).unwrap(),
                    ),
                    path,
                )
            })
            .collect();
        let routing_info = RoutingInfo::new(paths);

        let min_latency = routing_info
            .get_smallest_latency_ns()
            .map(SimulationTime::from_nanos)
            .unwrap();
        anyhow::ensure!(
            min_latency > SimulationTime::ZERO,
            "The smallest path latency must be positive"
        );

        // derive per-host seeds from the root seed in deterministic host order
        let mut root_rng = Random::new(config.general.seed);

        let mut ip_assignment: IpAssignment<u32> = IpAssignment::new();
        let mut ip_to_host = HashMap::new();
        let mut event_queues = HashMap::new();
        let mut hosts = Vec::new();

        for (index, (name, host_options)) in config.hosts.iter().enumerate() {
            let host_id = HostId::from(index as u32);
            let node_id = host_options.network_node_id;

            let ip = match host_options.ip_addr {
                Some(ip) => {
                    ip_assignment
                        .assign_ip(node_id, IpAddr::V4(ip))
                        .map_err(|e| anyhow::anyhow!("Assigning address for '{name}': {e}"))?;
                    ip
                }
                None => match ip_assignment.assign(node_id) {
                    IpAddr::V4(ip) => ip,
                    IpAddr::V6(_) => unreachable!(),
                },
            };
            ip_to_host.insert(ip, host_id);

            let host = Box::new(Host::new(HostParameters {
                id: host_id,
                name: name.clone(),
                ip,
                seed: root_rng.next_u64(),
            }));

            for process in &host_options.processes {
                host.add_application(Application {
                    path: PathBuf::from(&process.path),
                    args: process.args.clone(),
                    environment: process.environment.clone(),
                    start_time: SimulationTime::from_secs(process.start_time),
                });
            }

            event_queues.insert(host_id, Arc::clone(host.event_queue()));
            hosts.push(host);
        }

        // every pair of hosts must be routable before we start
        for src in hosts.iter() {
            for dst in hosts.iter() {
                let src_node = ip_assignment
                    .get_node(IpAddr::V4(src.default_ip()))
                    .unwrap();
                let dst_node = ip_assignment
                    .get_node(IpAddr::V4(dst.default_ip()))
                    .unwrap();
                anyhow::ensure!(
                    routing_info.path(src_node, dst_node).is_some(),
                    "No path between hosts '{}' and '{}'; the graph needs an edge \
                     (or a self-loop for hosts on the same node)",
                    src.name(),
                    dst.name(),
                );
            }
        }

        let end_time = config.stop_time();

        let shared = Arc::new(WorkerShared {
            ip_assignment,
            ip_to_host,
            routing_info,
            event_queues,
            runahead: Runahead::new(
                config.general.use_dynamic_runahead,
                min_latency,
                config.general.runahead.map(SimulationTime::from_millis),
            ),
            bootstrap_end_time: config.bootstrap_end_time(),
            sim_end_time: end_time,
            shutdown_requested: shutdown_flag,
            num_process_errors: AtomicU32::new(0),
        });

        // schedule application launches before the workers start
        for host in &hosts {
            host.boot();
        }

        let scheduler = Scheduler::new(config.parallelism(), hosts, Arc::clone(&shared));

        Ok(Self {
            scheduler,
            shared,
            end_time,
        })
    }

    /// Run the simulation to completion. The round loop: pick the earliest
    /// pending event time, grant every host a window bounded by the runahead,
    /// run the round in parallel, repeat.
    pub fn run(self) -> anyhow::Result<SimulationOutcome> {
        log::info!(
            "Simulation running to {:?} with {} workers",
            self.end_time.to_abs_simtime().as_millis(),
            self.scheduler.parallelism()
        );

        let mut interrupted = false;
        let mut num_rounds: u64 = 0;

        loop {
            if self.shared.shutdown_requested.load(Ordering::Relaxed) {
                log::info!("Shutdown requested; stopping after {num_rounds} rounds");
                interrupted = true;
                break;
            }

            let Some(next_event_time) = self.scheduler.min_next_event_time() else {
                log::info!("All event queues are empty after {num_rounds} rounds");
                break;
            };

            if next_event_time >= self.end_time {
                log::info!("Next event is at or past the stop time; simulation is done");
                break;
            }

            let runahead = self.shared.runahead.get();
            let window_end = std::cmp::min(
                next_event_time.saturating_add(runahead),
                self.end_time,
            );

            log::trace!(
                "Round {num_rounds}: window [{:?}, {:?})",
                next_event_time.to_abs_simtime().as_nanos(),
                window_end.to_abs_simtime().as_nanos(),
            );

            self.scheduler.run_round(window_end);
            num_rounds += 1;
        }

        self.shared.routing_info.log_packet_counts();

        let num_process_errors = self.shared.process_error_count();
        if num_process_errors > 0 {
            // managed process failures are reported but do not fail the engine
            log::warn!("{num_process_errors} managed processes exited with errors");
        }

        self.scheduler.shutdown_hosts();
        self.scheduler.join();

        if interrupted {
            Ok(SimulationOutcome::Interrupted)
        } else {
            Ok(SimulationOutcome::Completed)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    use atomic_refcell::AtomicRefCell;

    use super::*;
    use crate::core::work::task::TaskRef;
    use crate::core::worker::Worker;
    use crate::host::descriptor::listener::StateListenerFilter;
    use crate::host::descriptor::socket::tcp::TcpSocket;
    use crate::host::descriptor::socket::udp::UdpSocket;
    use crate::host::descriptor::socket::Socket;
    use crate::host::descriptor::timerfd::TimerFd;
    use crate::host::descriptor::{File, FileState, FileStatus};
    use crate::host::syscall::condition::SyscallCondition;
    use crate::utility::callback_queue::CallbackQueue;

    /// Build a simulation of `num_hosts` hosts attached to one graph node
    /// whose self-loop edge has the given latency and loss. `setup` may
    /// schedule initial events on the hosts before the workers start.
    fn build_controller(
        num_hosts: usize,
        latency: SimulationTime,
        packet_loss: f32,
        seed: u64,
        parallelism: usize,
        stop: SimulationTime,
        setup: impl FnOnce(&[Box<Host>]),
    ) -> Controller {
        let mut root_rng = Random::new(seed);

        let mut ip_assignment: IpAssignment<u32> = IpAssignment::new();
        let mut ip_to_host = HashMap::new();
        let mut event_queues = HashMap::new();
        let mut hosts = Vec::new();

        for i in 0..num_hosts {
            let id = umbra_shim_helper::HostId::from(i as u32);
            let IpAddr::V4(ip) = ip_assignment.assign(0u32) else {
                unreachable!()
            };
            ip_to_host.insert(ip, id);

            let host = Box::new(Host::new(HostParameters {
                id,
                name: format!("host{i}"),
                ip,
                seed: root_rng.next_u64(),
            }));
            event_queues.insert(id, Arc::clone(host.event_queue()));
            hosts.push(host);
        }

        let mut paths = HashMap::new();
        paths.insert(
            (0u32, 0u32),
            PathProperties {
                latency_ns: latency.as_nanos() as u64,
                packet_loss,
            },
        );

        let end_time = EmulatedTime::SIMULATION_START + stop;

        let shared = Arc::new(WorkerShared {
            ip_assignment,
            ip_to_host,
            routing_info: RoutingInfo::new(paths),
            event_queues,
            runahead: Runahead::new(false, latency, None),
            // loss applies from the very start
            bootstrap_end_time: EmulatedTime::SIMULATION_START,
            sim_end_time: end_time,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            num_process_errors: AtomicU32::new(0),
        });

        setup(&hosts);

        let scheduler = Scheduler::new(parallelism, hosts, Arc::clone(&shared));

        Controller {
            scheduler,
            shared,
            end_time,
        }
    }

    fn at(offset: SimulationTime) -> EmulatedTime {
        EmulatedTime::SIMULATION_START + offset
    }

    /// A timer armed at t=0 with first expiry at 0.5s and a 1s interval has
    /// expired exactly 5 times when read just before the 5s stop time.
    #[test]
    fn test_repeating_timerfd() {
        let timerfd_slot: Arc<StdMutex<Option<Arc<AtomicRefCell<TimerFd>>>>> =
            Arc::new(StdMutex::new(None));
        let read_count = Arc::new(StdMutex::new(0u64));

        let controller = build_controller(
            1,
            SimulationTime::from_millis(10),
            0.0,
            1,
            1,
            SimulationTime::from_secs(5),
            |hosts| {
                let host = &hosts[0];

                let slot = Arc::clone(&timerfd_slot);
                host.schedule_task_at_emulated_time(
                    TaskRef::new(move |host| {
                        let timerfd = TimerFd::new(FileStatus::empty());
                        CallbackQueue::queue_and_run(|cb_queue| {
                            let now = Worker::current_time().unwrap();
                            timerfd.borrow_mut().set_time(
                                host,
                                Some(now + SimulationTime::from_millis(500)),
                                SimulationTime::SECOND,
                                cb_queue,
                            );
                        });
                        *slot.lock().unwrap() = Some(timerfd);
                    }),
                    at(SimulationTime::ZERO),
                );

                let slot = Arc::clone(&timerfd_slot);
                let read_count = Arc::clone(&read_count);
                host.schedule_task_at_emulated_time(
                    TaskRef::new(move |_host| {
                        let timerfd = slot.lock().unwrap().clone().unwrap();
                        CallbackQueue::queue_and_run(|cb_queue| {
                            let mut buf = [0u8; 8];
                            timerfd.borrow_mut().read(&mut buf, cb_queue).unwrap();
                            *read_count.lock().unwrap() = u64::from_ne_bytes(buf);
                        });
                    }),
                    at(SimulationTime::from_millis(4900)),
                );
            },
        );

        assert_eq!(controller.run().unwrap(), SimulationOutcome::Completed);
        assert_eq!(*read_count.lock().unwrap(), 5);
    }

    /// Set up an echoing UDP socket bound to `port` on the host.
    fn setup_udp_echo(host: &Host, port: u16) {
        let addr = std::net::SocketAddrV4::new(host.default_ip(), port);
        host.schedule_task_at_emulated_time(
            TaskRef::new(move |host| {
                let sock = Arc::new(AtomicRefCell::new(UdpSocket::new(FileStatus::empty())));
                sock.borrow_mut().set_bound_addr(addr).unwrap();
                host.interface()
                    .associate_udp(addr.port(), Socket::Udp(Arc::clone(&sock)))
                    .unwrap();

                let handle = host.schedule_handle();
                let sock_for_listener = Arc::clone(&sock);
                let listen_handle = sock.borrow_mut().add_listener(
                    FileState::READABLE,
                    StateListenerFilter::OffToOn,
                    move |_state, _changed, _cb_queue| {
                        let sock = Arc::clone(&sock_for_listener);
                        handle.schedule(
                            TaskRef::new(move |host| {
                                CallbackQueue::queue_and_run(|cb_queue| {
                                    let mut buf = [0u8; 1500];
                                    while let Ok((n, src)) =
                                        sock.borrow_mut().recvfrom(&mut buf, cb_queue)
                                    {
                                        sock.borrow_mut()
                                            .sendto(host, &buf[..n], Some(src))
                                            .unwrap();
                                    }
                                });
                            }),
                            Worker::current_time().unwrap(),
                        );
                    },
                );
                // the socket and listener live for the whole simulation
                std::mem::forget(listen_handle);
            }),
            at(SimulationTime::ZERO),
        );
    }

    /// Two-host UDP ping over a 10ms link: the reply is observed exactly one
    /// round trip after the request.
    #[test]
    fn test_udp_ping() {
        let reply_times: Arc<StdMutex<Vec<SimulationTime>>> = Arc::new(StdMutex::new(Vec::new()));

        let controller = build_controller(
            2,
            SimulationTime::from_millis(10),
            0.0,
            1,
            1,
            SimulationTime::from_secs(1),
            |hosts| {
                let server_addr = std::net::SocketAddrV4::new(hosts[1].default_ip(), 9000);
                setup_udp_echo(&hosts[1], 9000);

                let client = &hosts[0];
                let client_ip = client.default_ip();
                let reply_times = Arc::clone(&reply_times);
                client.schedule_task_at_emulated_time(
                    TaskRef::new(move |host| {
                        let sock =
                            Arc::new(AtomicRefCell::new(UdpSocket::new(FileStatus::empty())));
                        let port = host
                            .select_ephemeral_port(crate::network::packet::ProtocolType::Udp)
                            .unwrap();
                        let addr = std::net::SocketAddrV4::new(client_ip, port);
                        sock.borrow_mut().set_bound_addr(addr).unwrap();
                        host.interface()
                            .associate_udp(port, Socket::Udp(Arc::clone(&sock)))
                            .unwrap();

                        let handle = host.schedule_handle();
                        let sock_for_listener = Arc::clone(&sock);
                        let reply_times = Arc::clone(&reply_times);
                        let listen_handle = sock.borrow_mut().add_listener(
                            FileState::READABLE,
                            StateListenerFilter::OffToOn,
                            move |_state, _changed, _cb_queue| {
                                let sock = Arc::clone(&sock_for_listener);
                                let reply_times = Arc::clone(&reply_times);
                                handle.schedule(
                                    TaskRef::new(move |_host| {
                                        CallbackQueue::queue_and_run(|cb_queue| {
                                            let mut buf = [0u8; 1500];
                                            while sock
                                                .borrow_mut()
                                                .recvfrom(&mut buf, cb_queue)
                                                .is_ok()
                                            {
                                                let now = Worker::current_time().unwrap();
                                                reply_times
                                                    .lock()
                                                    .unwrap()
                                                    .push(now.to_abs_simtime());
                                            }
                                        });
                                    }),
                                    Worker::current_time().unwrap(),
                                );
                            },
                        );
                        std::mem::forget(listen_handle);

                        CallbackQueue::queue_and_run(|_cb_queue| {
                            sock.borrow_mut()
                                .sendto(host, &[0u8; 100], Some(server_addr))
                                .unwrap();
                        });
                        std::mem::forget(sock);
                    }),
                    at(SimulationTime::ZERO),
                );
            },
        );

        assert_eq!(controller.run().unwrap(), SimulationOutcome::Completed);

        let reply_times = reply_times.lock().unwrap();
        assert_eq!(reply_times.len(), 1);
        // one link latency out, one back
        assert!(reply_times[0] >= SimulationTime::from_millis(20));
        assert!(reply_times[0] < SimulationTime::from_millis(30));
    }

    /// A lossy-link burst: the number of datagrams delivered is a
    /// deterministic function of the seed and the worker count.
    fn run_lossy_burst(seed: u64, parallelism: usize) -> usize {
        let received: Arc<StdMutex<usize>> = Arc::new(StdMutex::new(0));

        let controller = build_controller(
            2,
            SimulationTime::from_millis(10),
            0.5,
            seed,
            parallelism,
            SimulationTime::from_secs(2),
            |hosts| {
                let receiver = &hosts[1];
                let receiver_addr = std::net::SocketAddrV4::new(receiver.default_ip(), 9000);
                let received = Arc::clone(&received);
                receiver.schedule_task_at_emulated_time(
                    TaskRef::new(move |host| {
                        let sock =
                            Arc::new(AtomicRefCell::new(UdpSocket::new(FileStatus::empty())));
                        sock.borrow_mut().set_bound_addr(receiver_addr).unwrap();
                        host.interface()
                            .associate_udp(receiver_addr.port(), Socket::Udp(Arc::clone(&sock)))
                            .unwrap();

                        let handle = host.schedule_handle();
                        let sock_for_listener = Arc::clone(&sock);
                        let received = Arc::clone(&received);
                        let listen_handle = sock.borrow_mut().add_listener(
                            FileState::READABLE,
                            StateListenerFilter::OffToOn,
                            move |_state, _changed, _cb_queue| {
                                let sock = Arc::clone(&sock_for_listener);
                                let received = Arc::clone(&received);
                                handle.schedule(
                                    TaskRef::new(move |_host| {
                                        CallbackQueue::queue_and_run(|cb_queue| {
                                            let mut buf = [0u8; 1500];
                                            while sock
                                                .borrow_mut()
                                                .recvfrom(&mut buf, cb_queue)
                                                .is_ok()
                                            {
                                                *received.lock().unwrap() += 1;
                                            }
                                        });
                                    }),
                                    Worker::current_time().unwrap(),
                                );
                            },
                        );
                        std::mem::forget(listen_handle);
                        std::mem::forget(sock);
                    }),
                    at(SimulationTime::ZERO),
                );

                let sender = &hosts[0];
                let sender_ip = sender.default_ip();
                sender.schedule_task_at_emulated_time(
                    TaskRef::new(move |host| {
                        let sock =
                            Arc::new(AtomicRefCell::new(UdpSocket::new(FileStatus::empty())));
                        let port = host
                            .select_ephemeral_port(crate::network::packet::ProtocolType::Udp)
                            .unwrap();
                        sock.borrow_mut()
                            .set_bound_addr(std::net::SocketAddrV4::new(sender_ip, port))
                            .unwrap();
                        host.interface()
                            .associate_udp(port, Socket::Udp(Arc::clone(&sock)))
                            .unwrap();

                        for _ in 0..1000 {
                            sock.borrow_mut()
                                .sendto(host, &[7u8; 100], Some(receiver_addr))
                                .unwrap();
                        }
                        std::mem::forget(sock);
                    }),
                    at(SimulationTime::from_millis(1)),
                );
            },
        );

        assert_eq!(controller.run().unwrap(), SimulationOutcome::Completed);
        let count = *received.lock().unwrap();
        count
    }

    /// The fixed reference count for a lossy-burst seed. The burst's
    /// received count is a pure function of the sender host's random
    /// sequence, which this replays draw for draw: the host's seed comes
    /// from the root rng in host creation order, the first draw binds the
    /// sender's ephemeral port, and each of the 1000 datagrams then
    /// survives on a single uniform draw against the path reliability of
    /// 0.5. Any change to the seed-derivation, port-selection or
    /// loss-sampling contracts shifts these values and fails the test.
    fn reference_received_count(seed: u64) -> usize {
        use rand::Rng;

        let mut root_rng = Random::new(seed);
        // the sender is host 0, so its seed is the root rng's first draw
        let sender_seed = root_rng.next_u64();
        let mut sender_rng = Random::new(sender_seed);

        // the ephemeral bind consumes one draw from the port range
        let _port: u16 = sender_rng.gen_range(32768..=u16::MAX);

        (0..1000)
            .filter(|_| sender_rng.gen::<f64>() < 0.5)
            .count()
    }

    #[test]
    fn test_lossy_link_matches_reference_counts() {
        for seed in [1, 2, 3] {
            let expected = reference_received_count(seed);

            // the reference itself must be plausible for loss 0.5
            assert!(
                (300..700).contains(&expected),
                "implausible reference count {expected} for seed {seed}"
            );

            assert_eq!(
                run_lossy_burst(seed, 1),
                expected,
                "seed {seed} diverged from its reference count"
            );
            // and a repeat run reproduces it exactly
            assert_eq!(
                run_lossy_burst(seed, 1),
                expected,
                "seed {seed} was not deterministic across runs"
            );
        }
    }

    #[test]
    fn test_lossy_link_independent_of_worker_count() {
        let expected = reference_received_count(42);
        for parallelism in [1, 2, 8] {
            assert_eq!(
                run_lossy_burst(42, parallelism),
                expected,
                "results changed with {parallelism} workers"
            );
        }
    }

    /// A parked continuation waiting on an eventfd becomes runnable at the
    /// exact virtual time a writer makes the eventfd readable.
    #[test]
    fn test_blocked_condition_wakes_at_write_time() {
        let eventfd_slot: Arc<
            StdMutex<Option<Arc<AtomicRefCell<crate::host::descriptor::eventfd::EventFd>>>>,
        > = Arc::new(StdMutex::new(None));
        let condition_slot: Arc<StdMutex<Option<SyscallCondition>>> =
            Arc::new(StdMutex::new(None));
        let wake_time: Arc<StdMutex<Option<SimulationTime>>> = Arc::new(StdMutex::new(None));

        let controller = build_controller(
            1,
            SimulationTime::from_millis(10),
            0.0,
            1,
            1,
            SimulationTime::from_secs(1),
            |hosts| {
                let host = &hosts[0];

                let eventfd_slot_clone = Arc::clone(&eventfd_slot);
                let condition_slot_clone = Arc::clone(&condition_slot);
                let wake_time_clone = Arc::clone(&wake_time);
                host.schedule_task_at_emulated_time(
                    TaskRef::new(move |host| {
                        let eventfd = Arc::new(AtomicRefCell::new(
                            crate::host::descriptor::eventfd::EventFd::new(
                                0,
                                false,
                                FileStatus::empty(),
                            ),
                        ));

                        // the "blocked reader": a condition on READABLE whose
                        // resume records when it ran
                        let mut condition = SyscallCondition::new_from_file(
                            File::EventFd(Arc::clone(&eventfd)),
                            FileState::READABLE,
                        );
                        let wake_time = Arc::clone(&wake_time_clone);
                        condition.arm(
                            host,
                            TaskRef::new(move |_host| {
                                let now = Worker::current_time().unwrap();
                                *wake_time.lock().unwrap() = Some(now.to_abs_simtime());
                            }),
                        );

                        *eventfd_slot_clone.lock().unwrap() = Some(eventfd);
                        *condition_slot_clone.lock().unwrap() = Some(condition);
                    }),
                    at(SimulationTime::ZERO),
                );

                let eventfd_slot_clone = Arc::clone(&eventfd_slot);
                host.schedule_task_at_emulated_time(
                    TaskRef::new(move |_host| {
                        let eventfd = eventfd_slot_clone.lock().unwrap().clone().unwrap();
                        CallbackQueue::queue_and_run(|cb_queue| {
                            eventfd
                                .borrow_mut()
                                .write(&1u64.to_ne_bytes(), cb_queue)
                                .unwrap();
                        });
                    }),
                    at(SimulationTime::from_millis(100)),
                );
            },
        );

        assert_eq!(controller.run().unwrap(), SimulationOutcome::Completed);
        assert_eq!(
            *wake_time.lock().unwrap(),
            Some(SimulationTime::from_millis(100))
        );
    }

    /// A TCP connection: handshake, a 50 kB transfer driven by acks through
    /// slow start, and the sender's clean close observed as EOF.
    #[test]
    fn test_tcp_transfer() {
        const TRANSFER_NBYTES: usize = 50_000;

        let received: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        let saw_eof = Arc::new(StdMutex::new(false));

        let controller = build_controller(
            2,
            SimulationTime::from_millis(10),
            0.0,
            1,
            2,
            SimulationTime::from_secs(10),
            |hosts| {
                let server = &hosts[1];
                let server_addr = std::net::SocketAddrV4::new(server.default_ip(), 80);

                let received_clone = Arc::clone(&received);
                let saw_eof_clone = Arc::clone(&saw_eof);
                server.schedule_task_at_emulated_time(
                    TaskRef::new(move |host| {
                        let listener = TcpSocket::new(FileStatus::empty());
                        listener.borrow_mut().set_bound_addr(server_addr).unwrap();
                        host.interface()
                            .associate_tcp(
                                server_addr.port(),
                                None,
                                Socket::Tcp(Arc::clone(&listener)),
                            )
                            .unwrap();
                        listener.borrow_mut().listen(4).unwrap();

                        // accept, then drain the child whenever it's readable
                        let handle = host.schedule_handle();
                        let listener_clone = Arc::clone(&listener);
                        let received = Arc::clone(&received_clone);
                        let saw_eof = Arc::clone(&saw_eof_clone);
                        let accept_handle = listener.borrow_mut().add_listener(
                            FileState::READABLE,
                            StateListenerFilter::OffToOn,
                            move |_state, _changed, _cb_queue| {
                                let listener = Arc::clone(&listener_clone);
                                let received = Arc::clone(&received);
                                let saw_eof = Arc::clone(&saw_eof);
                                let handle_inner = handle.clone();
                                handle.schedule(
                                    TaskRef::new(move |_host| {
                                        let child = CallbackQueue::queue_and_run(|cb_queue| {
                                            listener.borrow_mut().accept(cb_queue)
                                        });
                                        let Ok(child) = child else { return };

                                        let drain = {
                                            let child = Arc::clone(&child);
                                            let received = Arc::clone(&received);
                                            let saw_eof = Arc::clone(&saw_eof);
                                            TaskRef::new(move |_host| {
                                                CallbackQueue::queue_and_run(|cb_queue| {
                                                    let mut buf = [0u8; 4096];
                                                    loop {
                                                        match child
                                                            .borrow_mut()
                                                            .read(&mut buf, cb_queue)
                                                        {
                                                            Ok(0) => {
                                                                *saw_eof.lock().unwrap() = true;
                                                                break;
                                                            }
                                                            Ok(n) => received
                                                                .lock()
                                                                .unwrap()
                                                                .extend_from_slice(&buf[..n]),
                                                            Err(_) => break,
                                                        }
                                                    }
                                                });
                                            })
                                        };

                                        // drain anything already buffered, and
                                        // again on every new arrival
                                        let child_handle = {
                                            let drain = drain.clone();
                                            let handle = handle_inner.clone();
                                            child.borrow_mut().add_listener(
                                                FileState::READABLE,
                                                StateListenerFilter::OffToOn,
                                                move |_state, _changed, _cb_queue| {
                                                    handle.schedule(
                                                        drain.clone(),
                                                        Worker::current_time().unwrap(),
                                                    );
                                                },
                                            )
                                        };
                                        std::mem::forget(child_handle);
                                        handle_inner
                                            .schedule(drain, Worker::current_time().unwrap());
                                    }),
                                    Worker::current_time().unwrap(),
                                );
                            },
                        );
                        std::mem::forget(accept_handle);
                        std::mem::forget(listener);
                    }),
                    at(SimulationTime::ZERO),
                );

                let client = &hosts[0];
                let client_ip = client.default_ip();
                client.schedule_task_at_emulated_time(
                    TaskRef::new(move |host| {
                        let sock = TcpSocket::new(FileStatus::empty());
                        let port = host
                            .select_ephemeral_port(crate::network::packet::ProtocolType::Tcp)
                            .unwrap();
                        sock.borrow_mut()
                            .set_bound_addr(std::net::SocketAddrV4::new(client_ip, port))
                            .unwrap();
                        host.interface()
                            .associate_tcp(
                                port,
                                Some(server_addr),
                                Socket::Tcp(Arc::clone(&sock)),
                            )
                            .unwrap();

                        // once writable (established), push the whole payload
                        // and then close to send our FIN
                        let handle = host.schedule_handle();
                        let sock_clone = Arc::clone(&sock);
                        let write_handle = sock.borrow_mut().add_listener(
                            FileState::WRITABLE,
                            StateListenerFilter::OffToOn,
                            move |_state, _changed, _cb_queue| {
                                let sock = Arc::clone(&sock_clone);
                                handle.schedule(
                                    TaskRef::new(move |host| {
                                        CallbackQueue::queue_and_run(|cb_queue| {
                                            let payload = vec![0xabu8; TRANSFER_NBYTES];
                                            let written = sock
                                                .borrow_mut()
                                                .write(host, &payload, cb_queue)
                                                .unwrap();
                                            assert_eq!(written, TRANSFER_NBYTES);
                                            sock.borrow_mut().close(cb_queue).unwrap();
                                        });
                                    }),
                                    Worker::current_time().unwrap(),
                                );
                            },
                        );
                        std::mem::forget(write_handle);

                        CallbackQueue::queue_and_run(|_cb_queue| {
                            sock.borrow_mut().connect(host, server_addr).unwrap();
                        });
                        std::mem::forget(sock);
                    }),
                    at(SimulationTime::ZERO),
                );
            },
        );

        assert_eq!(controller.run().unwrap(), SimulationOutcome::Completed);

        let received = received.lock().unwrap();
        assert_eq!(received.len(), TRANSFER_NBYTES);
        assert!(received.iter().all(|b| *b == 0xab));
        assert!(*saw_eof.lock().unwrap());
    }
}
