use std::collections::VecDeque;
use std::net::SocketAddrV4;

use bytes::Bytes;
use nix::errno::Errno;

use crate::core::worker::Worker;
use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::{FileMode, FileState, FileStatus};
use crate::host::host::Host;
use crate::host::syscall::types::SyscallError;
use crate::network::packet::{Packet, UDP_MAX_PAYLOAD};
use crate::utility::callback_queue::CallbackQueue;

/// Receive-queue capacity in bytes, following Linux's default
/// `net.core.rmem_default`.
pub const UDP_RECV_BUF_SIZE: usize = 212_992;

/// An emulated UDP socket: a datagram queue with drop-on-overflow.
pub struct UdpSocket {
    event_source: StateEventSource,
    state: FileState,
    status: FileStatus,
    // should only be used by `OpenFile` to make sure there is only ever one `OpenFile` instance
    // for this file
    has_open_file: bool,
    bound: Option<SocketAddrV4>,
    peer: Option<SocketAddrV4>,
    recv_queue: VecDeque<Packet>,
    recv_queue_nbytes: usize,
    /// Datagrams dropped because the receive queue was full.
    dropped_packets: u64,
}

impl UdpSocket {
    pub fn new(status: FileStatus) -> Self {
        Self {
            event_source: StateEventSource::new(),
            // a UDP socket can always be written to
            state: FileState::ACTIVE | FileState::WRITABLE,
            status,
            has_open_file: false,
            bound: None,
            peer: None,
            recv_queue: VecDeque::new(),
            recv_queue_nbytes: 0,
            dropped_packets: 0,
        }
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FileStatus) {
        self.status = status;
    }

    pub fn mode(&self) -> FileMode {
        FileMode::READ | FileMode::WRITE
    }

    pub fn has_open_file(&self) -> bool {
        self.has_open_file
    }

    pub fn set_has_open_file(&mut self, val: bool) {
        self.has_open_file = val;
    }

    pub fn bound_addr(&self) -> Option<SocketAddrV4> {
        self.bound
    }

    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    /// Record the socket's local address. The caller is responsible for the
    /// interface association.
    pub fn set_bound_addr(&mut self, addr: SocketAddrV4) -> Result<(), SyscallError> {
        if self.bound.is_some() {
            return Err(Errno::EINVAL.into());
        }
        self.bound = Some(addr);
        Ok(())
    }

    /// A connected UDP socket just filters and defaults addresses.
    pub fn set_peer_addr(&mut self, addr: SocketAddrV4) {
        self.peer = Some(addr);
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        // the caller disassociates us from the interface
        self.recv_queue.clear();
        self.recv_queue_nbytes = 0;

        self.copy_state(
            FileState::CLOSED | FileState::ACTIVE | FileState::READABLE | FileState::WRITABLE,
            FileState::CLOSED,
            cb_queue,
        );

        Ok(())
    }

    /// Send a datagram. The socket must already be bound (the syscall layer
    /// performs ephemeral binds).
    pub fn sendto(
        &mut self,
        host: &Host,
        buf: &[u8],
        dst: Option<SocketAddrV4>,
    ) -> Result<usize, SyscallError> {
        let Some(dst) = dst.or(self.peer) else {
            return Err(Errno::EDESTADDRREQ.into());
        };

        if buf.len() > UDP_MAX_PAYLOAD {
            return Err(Errno::EMSGSIZE.into());
        }

        let src = self.bound.expect("sendto on an unbound socket");
        let packet = Packet::new_udp(host, src, dst, Bytes::copy_from_slice(buf));

        log::trace!("Sending {packet}");
        Worker::send_packet(host, packet);

        Ok(buf.len())
    }

    /// Receive a single datagram, truncating it to `dst` as `recvfrom(2)`
    /// does. Returns the number of bytes copied and the source address.
    pub fn recvfrom(
        &mut self,
        dst: &mut [u8],
        cb_queue: &mut CallbackQueue,
    ) -> Result<(usize, SocketAddrV4), SyscallError> {
        let Some(packet) = self.recv_queue.pop_front() else {
            return Err(Errno::EWOULDBLOCK.into());
        };
        self.recv_queue_nbytes -= packet.payload_len();

        let src = packet.src();
        let payload = packet.into_payload();
        let num_copied = std::cmp::min(dst.len(), payload.len());
        dst[..num_copied].copy_from_slice(&payload[..num_copied]);

        self.update_state(cb_queue);

        Ok((num_copied, src))
    }

    pub fn push_in_packet(&mut self, _host: &Host, packet: Packet, cb_queue: &mut CallbackQueue) {
        if self.state.contains(FileState::CLOSED) {
            return;
        }

        // datagram queue with drop-on-overflow
        if self.recv_queue_nbytes + packet.payload_len() > UDP_RECV_BUF_SIZE {
            log::trace!("UDP receive queue full; dropping {packet}");
            self.dropped_packets += 1;
            return;
        }

        self.recv_queue_nbytes += packet.payload_len();
        self.recv_queue.push_back(packet);

        self.update_state(cb_queue);
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
        new_state.set(FileState::READABLE, !self.recv_queue.is_empty());

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
