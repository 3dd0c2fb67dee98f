use std::net::SocketAddrV4;

use bytes::Bytes;

use crate::host::host::Host;

/// The maximum transmission unit of every emulated link.
pub const MTU: usize = 1500;

/// MTU minus the emulated IP (20) and UDP (8) headers.
pub const UDP_MAX_PAYLOAD: usize = MTU - 28;

/// MTU minus the emulated IP (20) and TCP (40, with options) headers; the
/// maximum TCP segment size.
pub const TCP_MSS: usize = MTU - 40;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ProtocolType {
    Udp,
    Tcp,
}

bitflags::bitflags! {
    #[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
    pub struct TcpFlags: u8 {
        const SYN = 1 << 0;
        const ACK = 1 << 1;
        const FIN = 1 << 2;
        const RST = 1 << 3;
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct TcpHeader {
    pub flags: TcpFlags,
    pub seq: u32,
    pub ack: u32,
    /// The sender's advertised receive window, in bytes.
    pub window: u32,
}

// the emulated header must stay small; it's cloned with every segment
static_assertions::const_assert!(std::mem::size_of::<TcpHeader>() <= 16);

#[derive(Clone, Debug)]
pub enum PacketHeader {
    Udp,
    Tcp(TcpHeader),
}

/// An emulated packet. No real network packet ever leaves the machine; these
/// only travel between hosts through scheduled events.
#[derive(Clone, Debug)]
pub struct Packet {
    /// Sequence number within the sending host, for tie-breaks and tracing.
    id: u64,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    header: PacketHeader,
    payload: Bytes,
}

impl Packet {
    pub fn new_udp(host: &Host, src: SocketAddrV4, dst: SocketAddrV4, payload: Bytes) -> Self {
        assert!(payload.len() <= UDP_MAX_PAYLOAD);
        Self {
            id: host.get_new_packet_id(),
            src,
            dst,
            header: PacketHeader::Udp,
            payload,
        }
    }

    pub fn new_tcp(
        host: &Host,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        header: TcpHeader,
        payload: Bytes,
    ) -> Self {
        assert!(payload.len() <= TCP_MSS);
        Self {
            id: host.get_new_packet_id(),
            src,
            dst,
            header: PacketHeader::Tcp(header),
            payload,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn src(&self) -> SocketAddrV4 {
        self.src
    }

    pub fn dst(&self) -> SocketAddrV4 {
        self.dst
    }

    pub fn protocol(&self) -> ProtocolType {
        match self.header {
            PacketHeader::Udp => ProtocolType::Udp,
            PacketHeader::Tcp(_) => ProtocolType::Tcp,
        }
    }

    pub fn tcp_header(&self) -> Option<&TcpHeader> {
        match &self.header {
            PacketHeader::Udp => None,
            PacketHeader::Tcp(header) => Some(header),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} packet #{} {} -> {} ({} bytes)",
            self.protocol(),
            self.id,
            self.src,
            self.dst,
            self.payload.len(),
        )
    }
}
