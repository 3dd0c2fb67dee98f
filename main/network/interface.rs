use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use nix::errno::Errno;
use rand::Rng;

use crate::host::descriptor::socket::Socket;
use crate::host::host::Host;
use crate::network::packet::{Packet, ProtocolType};
use crate::utility::callback_queue::CallbackQueue;
use crate::utility::random::Random;

/// The first port considered for ephemeral binds, following the common Linux
/// range.
const EPHEMERAL_PORT_MIN: u16 = 32768;

/// A host's network interface: the association table from ports to sockets,
/// and the receive path from the fabric into those sockets.
pub struct NetworkInterface {
    addr: Ipv4Addr,
    udp_ports: RefCell<HashMap<u16, Socket>>,
    // TCP associations match on (local port, peer). `None` is the wildcard
    // used by listeners; established connections use an exact peer.
    tcp_ports: RefCell<HashMap<(u16, Option<SocketAddrV4>), Socket>>,
}

impl NetworkInterface {
    pub fn new(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            udp_ports: RefCell::new(HashMap::new()),
            tcp_ports: RefCell::new(HashMap::new()),
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn associate_udp(&self, port: u16, socket: Socket) -> Result<(), Errno> {
        let mut ports = self.udp_ports.borrow_mut();
        if ports.contains_key(&port) {
            return Err(Errno::EADDRINUSE);
        }
        ports.insert(port, socket);
        Ok(())
    }

    pub fn disassociate_udp(&self, port: u16) {
        self.udp_ports.borrow_mut().remove(&port);
    }

    pub fn associate_tcp(
        &self,
        port: u16,
        peer: Option<SocketAddrV4>,
        socket: Socket,
    ) -> Result<(), Errno> {
        let mut ports = self.tcp_ports.borrow_mut();
        if ports.contains_key(&(port, peer)) {
            return Err(Errno::EADDRINUSE);
        }
        ports.insert((port, peer), socket);
        Ok(())
    }

    pub fn disassociate_tcp(&self, port: u16, peer: Option<SocketAddrV4>) {
        self.tcp_ports.borrow_mut().remove(&(port, peer));
    }

    /// Pick an unused port for an ephemeral bind, deterministically from the
    /// host's random source.
    pub fn select_ephemeral_port(&self, protocol: ProtocolType, rng: &mut Random) -> Option<u16> {
        let is_free = |port: u16| match protocol {
            ProtocolType::Udp => !self.udp_ports.borrow().contains_key(&port),
            ProtocolType::Tcp => {
                // listeners and children share the port namespace on its wildcard entry
                !self.tcp_ports.borrow().contains_key(&(port, None))
            }
        };

        for _ in 0..100 {
            let port = rng.gen_range(EPHEMERAL_PORT_MIN..=u16::MAX);
            if is_free(port) {
                return Some(port);
            }
        }

        // the random probes all collided; fall back to a scan
        (EPHEMERAL_PORT_MIN..=u16::MAX).find(|port| is_free(*port))
    }

    /// Hand a packet received from the fabric to the owning socket.
    pub fn deliver(&self, host: &Host, packet: Packet) {
        let socket = match packet.protocol() {
            ProtocolType::Udp => self.udp_ports.borrow().get(&packet.dst().port()).cloned(),
            ProtocolType::Tcp => {
                let ports = self.tcp_ports.borrow();
                // an established connection takes priority over a listener
                ports
                    .get(&(packet.dst().port(), Some(packet.src())))
                    .or_else(|| ports.get(&(packet.dst().port(), None)))
                    .cloned()
            }
        };

        match socket {
            Some(socket) => {
                CallbackQueue::queue_and_run(|cb_queue| {
                    socket.borrow_mut().push_in_packet(host, packet, cb_queue)
                });
            }
            None => {
                log::trace!("No socket associated for {packet}; dropping");
            }
        }
    }
}
