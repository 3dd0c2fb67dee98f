use std::net::SocketAddrV4;

use crate::host::descriptor::listener::{StateListenHandle, StateListenerFilter};
use crate::host::descriptor::{FileMode, FileState, FileStatus};
use crate::host::host::Host;
use crate::host::syscall::types::SyscallError;
use crate::network::packet::Packet;
use crate::utility::callback_queue::CallbackQueue;

pub mod tcp;
pub mod udp;

use self::tcp::TcpSocket;
use self::udp::UdpSocket;

use std::sync::Arc;

use atomic_refcell::AtomicRefCell;

/// A wrapper for any socket object.
#[derive(Clone)]
pub enum Socket {
    Udp(Arc<AtomicRefCell<UdpSocket>>),
    Tcp(Arc<AtomicRefCell<TcpSocket>>),
}

impl Socket {
    pub fn borrow(&self) -> SocketRef {
        match self {
            Self::Udp(ref f) => SocketRef::Udp(f.borrow()),
            Self::Tcp(ref f) => SocketRef::Tcp(f.borrow()),
        }
    }

    pub fn borrow_mut(&self) -> SocketRefMut {
        match self {
            Self::Udp(ref f) => SocketRefMut::Udp(f.borrow_mut()),
            Self::Tcp(ref f) => SocketRefMut::Tcp(f.borrow_mut()),
        }
    }

    pub fn canonical_handle(&self) -> usize {
        match self {
            Self::Udp(f) => Arc::as_ptr(f) as usize,
            Self::Tcp(f) => Arc::as_ptr(f) as usize,
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp(_) => write!(f, "UdpSocket"),
            Self::Tcp(_) => write!(f, "TcpSocket"),
        }
    }
}

/// Wraps an immutably borrowed [`Socket`].
pub enum SocketRef<'a> {
    Udp(atomic_refcell::AtomicRef<'a, UdpSocket>),
    Tcp(atomic_refcell::AtomicRef<'a, TcpSocket>),
}

/// Wraps a mutably borrowed [`Socket`].
pub enum SocketRefMut<'a> {
    Udp(atomic_refcell::AtomicRefMut<'a, UdpSocket>),
    Tcp(atomic_refcell::AtomicRefMut<'a, TcpSocket>),
}

impl SocketRef<'_> {
    enum_passthrough!(self, (), Udp, Tcp;
        pub fn state(&self) -> FileState
    );
    enum_passthrough!(self, (), Udp, Tcp;
        pub fn mode(&self) -> FileMode
    );
    enum_passthrough!(self, (), Udp, Tcp;
        pub fn status(&self) -> FileStatus
    );
    enum_passthrough!(self, (), Udp, Tcp;
        pub fn has_open_file(&self) -> bool
    );
    enum_passthrough!(self, (), Udp, Tcp;
        pub fn bound_addr(&self) -> Option<SocketAddrV4>
    );
    enum_passthrough!(self, (), Udp, Tcp;
        pub fn peer_addr(&self) -> Option<SocketAddrV4>
    );
}

impl SocketRefMut<'_> {
    enum_passthrough!(self, (), Udp, Tcp;
        pub fn state(&self) -> FileState
    );
    enum_passthrough!(self, (), Udp, Tcp;
        pub fn mode(&self) -> FileMode
    );
    enum_passthrough!(self, (), Udp, Tcp;
        pub fn status(&self) -> FileStatus
    );
    enum_passthrough!(self, (status), Udp, Tcp;
        pub fn set_status(&mut self, status: FileStatus)
    );
    enum_passthrough!(self, (), Udp, Tcp;
        pub fn has_open_file(&self) -> bool
    );
    enum_passthrough!(self, (val), Udp, Tcp;
        pub fn set_has_open_file(&mut self, val: bool)
    );
    enum_passthrough!(self, (), Udp, Tcp;
        pub fn bound_addr(&self) -> Option<SocketAddrV4>
    );
    enum_passthrough!(self, (), Udp, Tcp;
        pub fn peer_addr(&self) -> Option<SocketAddrV4>
    );
    enum_passthrough!(self, (cb_queue), Udp, Tcp;
        pub fn close(&mut self, cb_queue: &mut CallbackQueue) -> Result<(), SyscallError>
    );
    enum_passthrough!(self, (host, packet, cb_queue), Udp, Tcp;
        pub fn push_in_packet(&mut self, host: &Host, packet: Packet, cb_queue: &mut CallbackQueue)
    );
    enum_passthrough!(self, (monitoring, filter, notify_fn), Udp, Tcp;
        pub fn add_listener(
            &mut self,
            monitoring: FileState,
            filter: StateListenerFilter,
            notify_fn: impl Fn(FileState, FileState, &mut CallbackQueue) + Send + Sync + 'static,
        ) -> StateListenHandle
    );
}
