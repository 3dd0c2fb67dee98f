//! An emulated TCP socket: the connection state machine, finite send and
//! receive buffers, and Reno-style congestion control. Retransmissions and
//! the time-wait expiry are scheduled as future events on the owning host.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::{Arc, Weak};

use atomic_refcell::AtomicRefCell;
use bytes::Bytes;
use nix::errno::Errno;
use rand::Rng;
use umbra_shim_helper::simulation_time::SimulationTime;

use crate::core::work::task::TaskRef;
use crate::core::worker::Worker;
use crate::host::descriptor::listener::{StateEventSource, StateListenHandle, StateListenerFilter};
use crate::host::descriptor::socket::Socket;
use crate::host::descriptor::{FileMode, FileState, FileStatus};
use crate::host::host::Host;
use crate::host::syscall::types::SyscallError;
use crate::network::packet::{Packet, TcpFlags, TcpHeader, TCP_MSS};
use crate::utility::byte_queue::ByteQueue;
use crate::utility::callback_queue::CallbackQueue;

pub const TCP_SEND_BUF_SIZE: usize = 131_072;
pub const TCP_RECV_BUF_SIZE: usize = 131_072;

/// Initial congestion window, following RFC 6928.
const INITIAL_CWND: u32 = 10 * TCP_MSS as u32;

const INITIAL_RTO: SimulationTime = SimulationTime::SECOND;
const MAX_RTO: SimulationTime = SimulationTime::from_duration(std::time::Duration::from_secs(60));

/// 2 * MSL, the time spent in TimeWait.
const TIME_WAIT_DURATION: SimulationTime =
    SimulationTime::from_duration(std::time::Duration::from_secs(60));

// sequence-space comparisons, wrapping as in RFC 793
fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// An in-flight segment kept for retransmission.
struct Segment {
    seq: u32,
    payload: Bytes,
    flags: TcpFlags,
}

impl Segment {
    /// The sequence number just past this segment, counting SYN/FIN.
    fn end_seq(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.intersects(TcpFlags::SYN | TcpFlags::FIN) {
            len += 1;
        }
        self.seq.wrapping_add(len)
    }
}

pub struct TcpSocket {
    event_source: StateEventSource,
    state: FileState,
    status: FileStatus,
    // should only be used by `OpenFile` to make sure there is only ever one `OpenFile` instance
    // for this file
    has_open_file: bool,
    // so that retransmit events and child sockets can refer back to us
    weak: Weak<AtomicRefCell<TcpSocket>>,

    tcp_state: TcpState,
    bound: Option<SocketAddrV4>,
    peer: Option<SocketAddrV4>,
    /// For sockets spawned by a listener: the listener to report to once
    /// established.
    listener: Option<Weak<AtomicRefCell<TcpSocket>>>,
    accept_queue: VecDeque<Arc<AtomicRefCell<TcpSocket>>>,
    backlog: u32,

    // sequence space
    snd_una: u32,
    snd_nxt: u32,
    /// The peer's advertised receive window.
    snd_wnd: u32,
    rcv_nxt: u32,

    send_buffer: ByteQueue,
    recv_buffer: ByteQueue,
    unacked: VecDeque<Segment>,

    // Reno congestion control
    cwnd: u32,
    ssthresh: u32,
    dup_ack_count: u32,

    rto: SimulationTime,
    rto_armed: bool,
    rto_generation: u64,

    fin_pending: bool,
    fin_sent: bool,
    fin_seq: u32,
    /// We received the peer's FIN; reads past the buffered data return EOF.
    peer_closed: bool,
    /// A fatal connection error (reset, refused) to report to the next caller.
    error: Option<Errno>,
}

impl TcpSocket {
    pub fn new(status: FileStatus) -> Arc<AtomicRefCell<Self>> {
        Arc::new_cyclic(|weak| {
            AtomicRefCell::new(Self {
                event_source: StateEventSource::new(),
                state: FileState::ACTIVE,
                status,
                has_open_file: false,
                weak: weak.clone(),
                tcp_state: TcpState::Closed,
                bound: None,
                peer: None,
                listener: None,
                accept_queue: VecDeque::new(),
                backlog: 0,
                snd_una: 0,
                snd_nxt: 0,
                snd_wnd: TCP_RECV_BUF_SIZE as u32,
                rcv_nxt: 0,
                send_buffer: ByteQueue::new(),
                recv_buffer: ByteQueue::new(),
                unacked: VecDeque::new(),
                cwnd: INITIAL_CWND,
                ssthresh: u32::MAX,
                dup_ack_count: 0,
                rto: INITIAL_RTO,
                rto_armed: false,
                rto_generation: 0,
                fin_pending: false,
                fin_sent: false,
                fin_seq: 0,
                peer_closed: false,
                error: None,
            })
        })
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

    pub fn tcp_state(&self) -> TcpState {
        self.tcp_state
    }

    /// Consume a recorded fatal connection error, if any.
    pub fn take_error(&mut self) -> Option<Errno> {
        self.error.take()
    }

    /// Finish the write side: send a FIN once the send buffer drains, but
    /// keep the descriptor itself open.
    pub fn shutdown_write(
        &mut self,
        host: &Host,
        cb_queue: &mut CallbackQueue,
    ) -> Result<(), SyscallError> {
        match self.tcp_state {
            TcpState::Established => {
                self.fin_pending = true;
                self.tcp_state = TcpState::FinWait1;
                self.try_transmit(host, cb_queue);
                Ok(())
            }
            TcpState::CloseWait => {
                self.fin_pending = true;
                self.tcp_state = TcpState::LastAck;
                self.try_transmit(host, cb_queue);
                Ok(())
            }
            TcpState::Closed | TcpState::Listen => Err(Errno::ENOTCONN.into()),
            // connecting or already closing: nothing further to do
            _ => Ok(()),
        }
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn add_listener(
        &mut self,
        monitoring: FileState,
        filter: StateListenerFilter,
        notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
    ) -> StateListenHandle {
        self.event_source.add_listener(monitoring, filter, notify_fn)
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

    /// Begin the three-way handshake. The socket must be bound and must have
    /// a peer address set.
    pub fn connect(&mut self, host: &Host, peer: SocketAddrV4) -> Result<(), SyscallError> {
        match self.tcp_state {
            TcpState::Closed => (),
            TcpState::SynSent | TcpState::SynReceived => return Err(Errno::EALREADY.into()),
            _ => return Err(Errno::EISCONN.into()),
        }
        assert!(self.bound.is_some());

        self.peer = Some(peer);

        let iss: u32 = host.with_random_mut(|rng| rng.gen());
        self.snd_una = iss;
        self.snd_nxt = iss.wrapping_add(1);

        self.send_segment(host, TcpFlags::SYN, iss, Bytes::new());
        self.unacked.push_back(Segment {
            seq: iss,
            payload: Bytes::new(),
            flags: TcpFlags::SYN,
        });
        self.tcp_state = TcpState::SynSent;
        self.arm_rto(host);

        Ok(())
    }

    pub fn listen(&mut self, backlog: u32) -> Result<(), SyscallError> {
        match self.tcp_state {
            TcpState::Closed | TcpState::Listen => (),
            _ => return Err(Errno::EINVAL.into()),
        }
        assert!(self.bound.is_some());

        self.backlog = std::cmp::max(backlog, 1);
        self.tcp_state = TcpState::Listen;
        Ok(())
    }

    /// Pop an established connection off the accept queue.
    pub fn accept(
        &mut self,
        cb_queue: &mut CallbackQueue,
    ) -> Result<Arc<AtomicRefCell<TcpSocket>>, SyscallError> {
        if self.tcp_state != TcpState::Listen {
            return Err(Errno::EINVAL.into());
        }

        let Some(child) = self.accept_queue.pop_front() else {
            return Err(Errno::EWOULDBLOCK.into());
        };

        self.update_state(cb_queue);
        Ok(child)
    }

    pub fn read(
        &mut self,
        dst: &mut [u8],
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        if let Some(errno) = self.error.take() {
            return Err(errno.into());
        }

        if self.recv_buffer.has_bytes() {
            let max = dst.len();
            let num_read = self.recv_buffer.pop(&mut *dst, max).unwrap();
            self.update_state(cb_queue);
            return Ok(num_read);
        }

        if self.peer_closed {
            // EOF
            return Ok(0);
        }

        match self.tcp_state {
            TcpState::Closed | TcpState::Listen => Err(Errno::ENOTCONN.into()),
            _ => Err(Errno::EWOULDBLOCK.into()),
        }
    }

    pub fn write(
        &mut self,
        host: &Host,
        src: &[u8],
        cb_queue: &mut CallbackQueue,
    ) -> Result<usize, SyscallError> {
        if let Some(errno) = self.error.take() {
            return Err(errno.into());
        }

        match self.tcp_state {
            TcpState::Established | TcpState::CloseWait => (),
            // not yet connected; the caller blocks until we are
            TcpState::SynSent | TcpState::SynReceived => return Err(Errno::EWOULDBLOCK.into()),
            TcpState::Closed | TcpState::Listen => return Err(Errno::ENOTCONN.into()),
            // we initiated a close; writing is over
            _ => return Err(Errno::EPIPE.into()),
        }

        let space = TCP_SEND_BUF_SIZE - self.send_buffer.num_bytes();
        if space == 0 {
            return Err(Errno::EWOULDBLOCK.into());
        }

        let num_written = std::cmp::min(space, src.len());
        self.send_buffer.push_stream(&src[..num_written]).unwrap();

        self.try_transmit(host, cb_queue);

        Ok(num_written)
    }

    pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError> {
        if self.state.contains(FileState::CLOSED) {
            return Ok(());
        }

        match self.tcp_state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                self.tcp_state = TcpState::Closed;
                self.rto_armed = false;
                let _ = Worker::with_active_host(|host| self.cleanup_association(host));
            }
            TcpState::SynReceived | TcpState::Established => {
                self.fin_pending = true;
                self.tcp_state = TcpState::FinWait1;
                let _ = Worker::with_active_host(|host| {
                    CallbackQueue::queue_and_run(|inner| self.try_transmit(host, inner))
                });
            }
            TcpState::CloseWait => {
                self.fin_pending = true;
                self.tcp_state = TcpState::LastAck;
                let _ = Worker::with_active_host(|host| {
                    CallbackQueue::queue_and_run(|inner| self.try_transmit(host, inner))
                });
            }
            // already tearing down
            _ => (),
        }

        self.accept_queue.clear();

        // the descriptor-facing side is closed regardless of where the
        // machine is in its teardown
        self.copy_state(FileState::all(), FileState::CLOSED, cb_queue);
        Ok(())
    }

    /// A packet from the fabric addressed to this socket.
    pub fn push_in_packet(&mut self, host: &Host, packet: Packet, cb_queue: &mut CallbackQueue) {
        let Some(header) = packet.tcp_header().copied() else {
            log::trace!("Non-TCP packet delivered to a TCP socket; dropping");
            return;
        };

        log::trace!(
            "{:?} socket in state {:?} received {packet}",
            self.bound,
            self.tcp_state
        );

        match self.tcp_state {
            TcpState::Closed => (),
            TcpState::Listen => self.handle_listen(host, &packet, header),
            TcpState::SynSent => self.handle_syn_sent(host, header, cb_queue),
            _ => self.handle_segment(host, packet, header, cb_queue),
        }
    }

    /// A SYN arriving at a listening socket creates a half-open child
    /// connection that answers with SYN|ACK.
    fn handle_listen(&mut self, host: &Host, packet: &Packet, header: TcpHeader) {
        if !header.flags.contains(TcpFlags::SYN) || header.flags.contains(TcpFlags::ACK) {
            return;
        }

        if self.accept_queue.len() >= self.backlog as usize {
            log::trace!("Accept queue full; dropping SYN from {}", packet.src());
            return;
        }

        let child = TcpSocket::new(self.status);
        {
            let mut child_ref = child.borrow_mut();
            child_ref.bound = self.bound;
            child_ref.peer = Some(packet.src());
            child_ref.listener = Some(self.weak.clone());
            child_ref.rcv_nxt = header.seq.wrapping_add(1);
            child_ref.snd_wnd = header.window;

            let iss: u32 = host.with_random_mut(|rng| rng.gen());
            child_ref.snd_una = iss;
            child_ref.snd_nxt = iss.wrapping_add(1);
            child_ref.tcp_state = TcpState::SynReceived;

            child_ref.send_segment(host, TcpFlags::SYN | TcpFlags::ACK, iss, Bytes::new());
            child_ref.unacked.push_back(Segment {
                seq: iss,
                payload: Bytes::new(),
                flags: TcpFlags::SYN | TcpFlags::ACK,
            });
            child_ref.arm_rto(host);
        }

        // future packets of this four-tuple go straight to the child
        let local_port = self.bound.unwrap().port();
        if host
            .interface()
            .associate_tcp(local_port, Some(packet.src()), Socket::Tcp(child))
            .is_err()
        {
            log::trace!("Connection from {} already exists; dropping SYN", packet.src());
        }
    }

    fn handle_syn_sent(&mut self, host: &Host, header: TcpHeader, cb_queue: &mut CallbackQueue) {
        if header.flags.contains(TcpFlags::RST) {
            self.fail_connection(Errno::ECONNREFUSED, cb_queue);
            return;
        }

        if !header.flags.contains(TcpFlags::SYN)
            || !header.flags.contains(TcpFlags::ACK)
            || header.ack != self.snd_nxt
        {
            return;
        }

        self.snd_una = header.ack;
        self.snd_wnd = header.window;
        self.rcv_nxt = header.seq.wrapping_add(1);
        self.unacked.clear();
        self.rto_armed = false;
        self.tcp_state = TcpState::Established;

        self.send_control(host, TcpFlags::ACK);
        self.try_transmit(host, cb_queue);
        self.update_state(cb_queue);
    }

    fn handle_segment(
        &mut self,
        host: &Host,
        packet: Packet,
        header: TcpHeader,
        cb_queue: &mut CallbackQueue,
    ) {
        if header.flags.contains(TcpFlags::RST) {
            self.reset(Errno::ECONNRESET, cb_queue);
            return;
        }

        if header.flags.contains(TcpFlags::ACK) {
            if self.tcp_state == TcpState::SynReceived && header.ack == self.snd_nxt {
                self.establish_from_syn_received(cb_queue);
            }
            self.process_ack(host, header.ack, header.window, cb_queue);
        }

        let payload = packet.into_payload();

        if !payload.is_empty() {
            if header.seq == self.rcv_nxt {
                // in order: accept what fits in the receive buffer and
                // acknowledge only that much; the rest is retransmitted
                let space = TCP_RECV_BUF_SIZE - self.recv_buffer.num_bytes();
                let num_accepted = std::cmp::min(space, payload.len());
                if num_accepted > 0 {
                    self.recv_buffer
                        .push_stream(&payload[..num_accepted])
                        .unwrap();
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(num_accepted as u32);
                }
            }
            // in order or not, tell the peer where we are
            self.send_control(host, TcpFlags::ACK);
        }

        if header.flags.contains(TcpFlags::FIN) {
            let fin_seq = header.seq.wrapping_add(payload.len() as u32);
            if fin_seq == self.rcv_nxt {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                self.peer_closed = true;
                self.send_control(host, TcpFlags::ACK);

                match self.tcp_state {
                    TcpState::Established => self.tcp_state = TcpState::CloseWait,
                    // simultaneous close; our FIN is not yet acknowledged
                    TcpState::FinWait1 => self.tcp_state = TcpState::Closing,
                    TcpState::FinWait2 => self.enter_time_wait(host),
                    _ => (),
                }
            } else {
                // FIN beyond what we've received; re-ack
                self.send_control(host, TcpFlags::ACK);
            }
        }

        self.update_state(cb_queue);
    }

    fn process_ack(&mut self, host: &Host, ack: u32, window: u32, cb_queue: &mut CallbackQueue) {
        self.snd_wnd = window;

        if seq_gt(ack, self.snd_una) && seq_le(ack, self.snd_nxt) {
            self.snd_una = ack;
            self.dup_ack_count = 0;

            // drop fully acknowledged segments
            while let Some(segment) = self.unacked.front() {
                if seq_le(segment.end_seq(), ack) {
                    self.unacked.pop_front();
                } else {
                    break;
                }
            }

            // Reno: slow start below ssthresh, additive increase above
            let mss = TCP_MSS as u32;
            if self.cwnd < self.ssthresh {
                self.cwnd += mss;
            } else {
                self.cwnd += std::cmp::max(1, mss * mss / self.cwnd);
            }

            // was our FIN acknowledged?
            if self.fin_sent && seq_gt(self.snd_una, self.fin_seq) {
                match self.tcp_state {
                    TcpState::FinWait1 => self.tcp_state = TcpState::FinWait2,
                    TcpState::Closing => self.enter_time_wait(host),
                    TcpState::LastAck => self.enter_closed(host),
                    _ => (),
                }
            }

            if self.snd_una == self.snd_nxt {
                // everything acknowledged
                self.rto_armed = false;
                self.rto = INITIAL_RTO;
            } else {
                // restart the retransmission timer for the remaining data
                self.arm_rto(host);
            }

            self.try_transmit(host, cb_queue);
        } else if ack == self.snd_una && !self.unacked.is_empty() {
            self.dup_ack_count += 1;
            if self.dup_ack_count == 3 {
                // fast retransmit: halve the window per Reno
                let mss = TCP_MSS as u32;
                let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
                self.ssthresh = std::cmp::max(in_flight / 2, 2 * mss);
                self.cwnd = self.ssthresh;
                self.retransmit_first(host);
            }
        }
    }

    /// Move data (and a pending FIN) from the send buffer into flight, up to
    /// the congestion and receive windows.
    fn try_transmit(&mut self, host: &Host, cb_queue: &mut CallbackQueue) {
        match self.tcp_state {
            TcpState::Established
            | TcpState::CloseWait
            | TcpState::FinWait1
            | TcpState::Closing
            | TcpState::LastAck => (),
            _ => return,
        }

        loop {
            let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
            // a zero peer window degrades to one probe segment per RTO
            let window = std::cmp::min(self.cwnd, std::cmp::max(self.snd_wnd, TCP_MSS as u32));
            if in_flight >= window {
                break;
            }

            let budget = std::cmp::min((window - in_flight) as usize, TCP_MSS);
            let chunk = self.send_buffer.pop_bytes(budget);

            if chunk.is_empty() {
                // the stream is drained; follow with our FIN if one is due
                if self.fin_pending && !self.fin_sent {
                    self.fin_seq = self.snd_nxt;
                    self.send_segment(
                        host,
                        TcpFlags::FIN | TcpFlags::ACK,
                        self.snd_nxt,
                        Bytes::new(),
                    );
                    self.unacked.push_back(Segment {
                        seq: self.snd_nxt,
                        payload: Bytes::new(),
                        flags: TcpFlags::FIN | TcpFlags::ACK,
                    });
                    self.snd_nxt = self.snd_nxt.wrapping_add(1);
                    self.fin_sent = true;
                    self.arm_rto(host);
                }
                break;
            }

            self.send_segment(host, TcpFlags::ACK, self.snd_nxt, chunk.clone());
            self.unacked.push_back(Segment {
                seq: self.snd_nxt,
                payload: chunk.clone(),
                flags: TcpFlags::empty(),
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(chunk.len() as u32);
            self.arm_rto(host);
        }

        // buffer space may have been freed
        self.update_state(cb_queue);
    }

    fn send_segment(&self, host: &Host, flags: TcpFlags, seq: u32, payload: Bytes) {
        let header = TcpHeader {
            flags,
            seq,
            ack: self.rcv_nxt,
            window: (TCP_RECV_BUF_SIZE - self.recv_buffer.num_bytes()) as u32,
        };
        let packet = Packet::new_tcp(host, self.bound.unwrap(), self.peer.unwrap(), header, payload);
        Worker::send_packet(host, packet);
    }

    /// Send a control segment carrying no sequence space (a pure ACK).
    fn send_control(&self, host: &Host, flags: TcpFlags) {
        self.send_segment(host, flags, self.snd_nxt, Bytes::new());
    }

    fn retransmit_first(&mut self, host: &Host) {
        if let Some(segment) = self.unacked.front() {
            log::trace!("Retransmitting segment seq={}", segment.seq);
            let flags = if segment.flags.is_empty() {
                TcpFlags::ACK
            } else {
                segment.flags
            };
            self.send_segment(host, flags, segment.seq, segment.payload.clone());
        }
    }

    fn arm_rto(&mut self, host: &Host) {
        self.rto_generation += 1;
        self.rto_armed = true;

        let generation = self.rto_generation;
        let weak = self.weak.clone();
        let task = TaskRef::new(move |host| {
            if let Some(socket) = weak.upgrade() {
                CallbackQueue::queue_and_run(|cb_queue| {
                    socket.borrow_mut().rto_expired(host, generation, cb_queue)
                });
            }
        });
        host.schedule_task_with_delay(task, self.rto);
    }

    fn rto_expired(&mut self, host: &Host, generation: u64, cb_queue: &mut CallbackQueue) {
        // a newer timer or an acknowledgment superseded this one
        if generation != self.rto_generation || !self.rto_armed {
            return;
        }
        if self.unacked.is_empty() {
            self.rto_armed = false;
            return;
        }

        log::trace!("Retransmission timeout for {:?}", self.bound);

        // multiplicative backoff and slow-start restart
        let mss = TCP_MSS as u32;
        let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
        self.ssthresh = std::cmp::max(in_flight / 2, 2 * mss);
        self.cwnd = mss;
        self.dup_ack_count = 0;
        self.rto = std::cmp::min(self.rto.saturating_mul(2), MAX_RTO);

        self.retransmit_first(host);
        self.arm_rto(host);

        self.update_state(cb_queue);
    }

    fn establish_from_syn_received(&mut self, cb_queue: &mut CallbackQueue) {
        self.tcp_state = TcpState::Established;
        self.unacked.retain(|s| !s.flags.contains(TcpFlags::SYN));

        // report ourselves to the listener's accept queue
        if let Some(listener) = self.listener.take().and_then(|weak| weak.upgrade()) {
            let self_arc = self.weak.upgrade().unwrap();
            listener.borrow_mut().enqueue_incoming(self_arc, cb_queue);
        }

        self.update_state(cb_queue);
    }

    fn enqueue_incoming(
        &mut self,
        child: Arc<AtomicRefCell<TcpSocket>>,
        cb_queue: &mut CallbackQueue,
    ) {
        if self.tcp_state != TcpState::Listen {
            // the listener closed while the handshake completed
            return;
        }
        self.accept_queue.push_back(child);
        self.update_state(cb_queue);
    }

    fn enter_time_wait(&mut self, host: &Host) {
        self.tcp_state = TcpState::TimeWait;
        self.rto_armed = false;

        let weak = self.weak.clone();
        let task = TaskRef::new(move |host| {
            if let Some(socket) = weak.upgrade() {
                socket.borrow_mut().enter_closed(host);
            }
        });
        host.schedule_task_with_delay(task, TIME_WAIT_DURATION);
    }

    fn enter_closed(&mut self, host: &Host) {
        self.tcp_state = TcpState::Closed;
        self.rto_armed = false;
        self.cleanup_association(host);
    }

    fn cleanup_association(&self, host: &Host) {
        let Some(bound) = self.bound else {
            return;
        };
        if self.peer.is_some() {
            host.interface().disassociate_tcp(bound.port(), self.peer);
        } else {
            host.interface().disassociate_tcp(bound.port(), None);
        }
    }

    fn fail_connection(&mut self, errno: Errno, cb_queue: &mut CallbackQueue) {
        self.tcp_state = TcpState::Closed;
        self.error = Some(errno);
        self.unacked.clear();
        self.rto_armed = false;
        let _ = Worker::with_active_host(|host| self.cleanup_association(host));

        // wake anything waiting on this socket
        self.copy_state(
            FileState::READABLE | FileState::WRITABLE,
            FileState::READABLE | FileState::WRITABLE,
            cb_queue,
        );
    }

    fn reset(&mut self, errno: Errno, cb_queue: &mut CallbackQueue) {
        log::trace!("Connection {:?} reset by peer", self.bound);
        self.fail_connection(errno, cb_queue);
    }

    fn update_state(&mut self, cb_queue: &mut CallbackQueue) {
        if self.state.contains(FileState::CLOSED) {
            return;
        }

        let mut new_state = FileState::empty();

        match self.tcp_state {
            TcpState::Listen => {
                new_state.set(FileState::READABLE, !self.accept_queue.is_empty());
            }
            TcpState::Established
            | TcpState::CloseWait
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::TimeWait => {
                new_state.set(
                    FileState::READABLE,
                    self.recv_buffer.has_bytes() || self.peer_closed || self.error.is_some(),
                );
                let can_write = matches!(
                    self.tcp_state,
                    TcpState::Established | TcpState::CloseWait
                );
                new_state.set(
                    FileState::WRITABLE,
                    can_write && self.send_buffer.num_bytes() < TCP_SEND_BUF_SIZE,
                );
            }
            // connecting or closed: neither readable nor writable
            _ => (),
        }

        self.copy_state(FileState::READABLE | FileState::WRITABLE, new_state, cb_queue);
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
