use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;
use umbra_shim_helper::syscall_types::ForeignPtr;

use crate::host::descriptor::socket::tcp::{TcpSocket, TcpState};
use crate::host::descriptor::socket::udp::UdpSocket;
use crate::host::descriptor::socket::Socket;
use crate::host::descriptor::{Descriptor, DescriptorFlags, File, FileState, FileStatus, OpenFile};
use crate::host::memory_manager::MemoryManager;
use crate::host::syscall::handler::unistd::file_as_socket;
use crate::host::syscall::handler::{block_on_would_block, descriptor, SyscallContext};
use crate::host::syscall::types::{SyscallError, SyscallResult};
use crate::network::packet::ProtocolType;

fn read_sockaddr(
    memory: &MemoryManager,
    addr_ptr: ForeignPtr,
    addr_len: usize,
) -> Result<SocketAddrV4, SyscallError> {
    if addr_len < std::mem::size_of::<libc::sockaddr_in>() {
        return Err(Errno::EINVAL.into());
    }

    let addr: libc::sockaddr_in = memory.read_val(addr_ptr)?;
    if addr.sin_family != libc::AF_INET as libc::sa_family_t {
        return Err(Errno::EAFNOSUPPORT.into());
    }

    Ok(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    ))
}

fn write_sockaddr(
    memory: &MemoryManager,
    addr: SocketAddrV4,
    addr_ptr: ForeignPtr,
    addr_len_ptr: ForeignPtr,
) -> Result<(), SyscallError> {
    if addr_ptr.is_null() || addr_len_ptr.is_null() {
        return Ok(());
    }

    let sockaddr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        },
        sin_zero: [0; 8],
    };

    let capacity: libc::socklen_t = memory.read_val(addr_len_ptr)?;
    let to_write = std::cmp::min(
        capacity as usize,
        std::mem::size_of::<libc::sockaddr_in>(),
    );
    let bytes = unsafe {
        std::slice::from_raw_parts(
            &sockaddr as *const libc::sockaddr_in as *const u8,
            std::mem::size_of::<libc::sockaddr_in>(),
        )
    };
    memory.write_ptr(addr_ptr, &bytes[..to_write])?;

    let actual_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    memory.write_val(addr_len_ptr, &actual_len)?;

    Ok(())
}

fn socket_for_fd(ctx: &SyscallContext, fd: i64) -> Result<(Descriptor, Socket), SyscallError> {
    let Some(desc) = descriptor(ctx.host, fd)? else {
        // socket syscalls are always emulated, so an unknown fd can't be a socket
        return Err(Errno::ENOTSOCK.into());
    };
    let socket = file_as_socket(desc.file())?.clone();
    Ok((desc, socket))
}

/// Bind the socket to an unused ephemeral port if it isn't bound yet.
fn autobind(ctx: &SyscallContext, socket: &Socket) -> Result<SocketAddrV4, SyscallError> {
    if let Some(bound) = socket.borrow().bound_addr() {
        return Ok(bound);
    }

    let protocol = match socket {
        Socket::Udp(_) => ProtocolType::Udp,
        Socket::Tcp(_) => ProtocolType::Tcp,
    };
    let port = ctx
        .host
        .select_ephemeral_port(protocol)
        .ok_or(Errno::EADDRINUSE)?;
    let addr = SocketAddrV4::new(ctx.host.default_ip(), port);

    match socket {
        Socket::Udp(udp) => {
            ctx.host
                .interface()
                .associate_udp(port, Socket::Udp(Arc::clone(udp)))?;
            udp.borrow_mut().set_bound_addr(addr)?;
        }
        Socket::Tcp(tcp) => {
            tcp.borrow_mut().set_bound_addr(addr)?;
        }
    }
    Ok(addr)
}

pub fn socket(ctx: &mut SyscallContext) -> SyscallResult {
    let domain = ctx.args.get(0).as_i32();
    let socket_type = ctx.args.get(1).as_i32();

    if domain != libc::AF_INET {
        log::debug!("Unsupported socket domain {domain}");
        return Err(Errno::EAFNOSUPPORT.into());
    }

    let mut status = FileStatus::empty();
    let mut desc_flags = DescriptorFlags::empty();
    let mut remaining = socket_type;
    if remaining & libc::SOCK_NONBLOCK != 0 {
        status.insert(FileStatus::NONBLOCK);
        remaining &= !libc::SOCK_NONBLOCK;
    }
    if remaining & libc::SOCK_CLOEXEC != 0 {
        desc_flags.insert(DescriptorFlags::CLOEXEC);
        remaining &= !libc::SOCK_CLOEXEC;
    }

    let file = match remaining {
        libc::SOCK_DGRAM => {
            File::Socket(Socket::Udp(Arc::new(AtomicRefCell::new(UdpSocket::new(
                status,
            )))))
        }
        libc::SOCK_STREAM => File::Socket(Socket::Tcp(TcpSocket::new(status))),
        _ => return Err(Errno::ESOCKTNOSUPPORT.into()),
    };

    let mut desc = Descriptor::new(OpenFile::new(file));
    desc.set_flags(desc_flags);

    let fd = ctx.host.register_descriptor(desc);
    Ok(fd.into())
}

pub fn bind(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let addr_ptr = ForeignPtr::from(ctx.args.get(1));
    let addr_len = ctx.args.get(2).as_usize();

    let (_desc, socket) = socket_for_fd(ctx, fd)?;

    if socket.borrow().bound_addr().is_some() {
        return Err(Errno::EINVAL.into());
    }

    let mut addr = read_sockaddr(ctx.process.memory(), addr_ptr, addr_len)?;

    // the only local addresses are INADDR_ANY and the host's own
    if *addr.ip() != Ipv4Addr::UNSPECIFIED && *addr.ip() != ctx.host.default_ip() {
        return Err(Errno::EADDRNOTAVAIL.into());
    }
    addr.set_ip(ctx.host.default_ip());

    if addr.port() == 0 {
        let protocol = match &socket {
            Socket::Udp(_) => ProtocolType::Udp,
            Socket::Tcp(_) => ProtocolType::Tcp,
        };
        let port = ctx
            .host
            .select_ephemeral_port(protocol)
            .ok_or(Errno::EADDRINUSE)?;
        addr.set_port(port);
    }

    match &socket {
        Socket::Udp(udp) => {
            ctx.host
                .interface()
                .associate_udp(addr.port(), Socket::Udp(Arc::clone(udp)))?;
            udp.borrow_mut().set_bound_addr(addr)?;
        }
        Socket::Tcp(tcp) => {
            // the wildcard association is claimed at listen/connect time, but
            // the port is reserved now
            ctx.host
                .interface()
                .associate_tcp(addr.port(), None, Socket::Tcp(Arc::clone(tcp)))?;
            tcp.borrow_mut().set_bound_addr(addr)?;
        }
    }

    Ok(0.into())
}

pub fn connect(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let addr_ptr = ForeignPtr::from(ctx.args.get(1));
    let addr_len = ctx.args.get(2).as_usize();

    let (desc, socket) = socket_for_fd(ctx, fd)?;
    let peer = read_sockaddr(ctx.process.memory(), addr_ptr, addr_len)?;

    match &socket {
        Socket::Udp(udp) => {
            // a connected datagram socket just gains a default destination
            autobind(ctx, &socket)?;
            udp.borrow_mut().set_peer_addr(peer);
            Ok(0.into())
        }
        Socket::Tcp(tcp) => {
            let state = tcp.borrow().tcp_state();
            let nonblock = tcp.borrow().status().contains(FileStatus::NONBLOCK);

            match state {
                TcpState::Closed => {
                    let local = autobind(ctx, &socket)?;
                    // replies are addressed to the four-tuple
                    ctx.host.interface().associate_tcp(
                        local.port(),
                        Some(peer),
                        Socket::Tcp(Arc::clone(tcp)),
                    )?;
                    tcp.borrow_mut().connect(ctx.host, peer)?;

                    if nonblock {
                        return Err(Errno::EINPROGRESS.into());
                    }
                    Err(SyscallError::new_blocked_on_file(
                        desc.file().clone(),
                        FileState::WRITABLE,
                        false,
                    ))
                }
                TcpState::SynSent | TcpState::SynReceived => {
                    if nonblock {
                        return Err(Errno::EALREADY.into());
                    }
                    // spurious wakeup of a blocking connect: wait some more
                    Err(SyscallError::new_blocked_on_file(
                        desc.file().clone(),
                        FileState::WRITABLE,
                        false,
                    ))
                }
                TcpState::Established => {
                    if ctx.rerun {
                        // the blocking connect completed
                        Ok(0.into())
                    } else {
                        Err(Errno::EISCONN.into())
                    }
                }
                _ => {
                    // the handshake failed; surface the recorded error
                    let errno = tcp
                        .borrow_mut()
                        .take_error()
                        .unwrap_or(Errno::ECONNREFUSED);
                    Err(errno.into())
                }
            }
        }
    }
}

pub fn listen(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let backlog = ctx.args.get(1).as_i32();

    let (_desc, socket) = socket_for_fd(ctx, fd)?;
    let Socket::Tcp(tcp) = &socket else {
        return Err(Errno::EOPNOTSUPP.into());
    };

    if tcp.borrow().bound_addr().is_none() {
        // listen without bind gets an ephemeral port, like Linux
        autobind(ctx, &socket)?;
        let local = tcp.borrow().bound_addr().unwrap();
        ctx.host.interface().associate_tcp(
            local.port(),
            None,
            Socket::Tcp(Arc::clone(tcp)),
        )?;
    }

    tcp.borrow_mut().listen(std::cmp::max(backlog, 0) as u32)?;
    Ok(0.into())
}

pub fn accept(ctx: &mut SyscallContext) -> SyscallResult {
    accept_helper(ctx, 0)
}

pub fn accept4(ctx: &mut SyscallContext) -> SyscallResult {
    let flags = ctx.args.get(3).as_i32();
    accept_helper(ctx, flags)
}

fn accept_helper(ctx: &mut SyscallContext, flags: i32) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let addr_ptr = ForeignPtr::from(ctx.args.get(1));
    let addr_len_ptr = ForeignPtr::from(ctx.args.get(2));

    let (desc, socket) = socket_for_fd(ctx, fd)?;
    let Socket::Tcp(tcp) = &socket else {
        return Err(Errno::EOPNOTSUPP.into());
    };

    let mut status = FileStatus::empty();
    let mut desc_flags = DescriptorFlags::empty();
    if flags & libc::SOCK_NONBLOCK != 0 {
        status.insert(FileStatus::NONBLOCK);
    }
    if flags & libc::SOCK_CLOEXEC != 0 {
        desc_flags.insert(DescriptorFlags::CLOEXEC);
    }

    let child = match tcp.borrow_mut().accept(ctx.cb_queue) {
        Ok(child) => child,
        Err(e) => {
            return Err(block_on_would_block(
                desc.file(),
                desc.file().borrow().status(),
                FileState::READABLE,
                e,
            ))
        }
    };

    let peer = child.borrow().peer_addr().unwrap();
    child.borrow_mut().set_status(status);

    let mut child_desc = Descriptor::new(OpenFile::new(File::Socket(Socket::Tcp(child))));
    child_desc.set_flags(desc_flags);
    let child_fd = ctx.host.register_descriptor(child_desc);

    write_sockaddr(ctx.process.memory(), peer, addr_ptr, addr_len_ptr)?;

    Ok(child_fd.into())
}

pub fn sendto(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let buf_ptr = ForeignPtr::from(ctx.args.get(1));
    let buf_len = ctx.args.get(2).as_usize();
    let addr_ptr = ForeignPtr::from(ctx.args.get(4));
    let addr_len = ctx.args.get(5).as_usize();

    let (desc, socket) = socket_for_fd(ctx, fd)?;

    // large enough that an oversized datagram still fails with EMSGSIZE in
    // the socket rather than being silently truncated here
    let mut buf = vec![0u8; std::cmp::min(buf_len, 1 << 16)];
    ctx.process.memory().read_ptr(buf_ptr, &mut buf)?;

    let result = match &socket {
        Socket::Udp(udp) => {
            let dst = if addr_ptr.is_null() || addr_len == 0 {
                None
            } else {
                Some(read_sockaddr(ctx.process.memory(), addr_ptr, addr_len)?)
            };
            autobind(ctx, &socket)?;
            udp.borrow_mut().sendto(ctx.host, &buf, dst)
        }
        Socket::Tcp(tcp) => tcp.borrow_mut().write(ctx.host, &buf, ctx.cb_queue),
    };

    match result {
        Ok(num_sent) => Ok(num_sent.into()),
        Err(e) => Err(block_on_would_block(
            desc.file(),
            desc.file().borrow().status(),
            FileState::WRITABLE,
            e,
        )),
    }
}

pub fn recvfrom(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let buf_ptr = ForeignPtr::from(ctx.args.get(1));
    let buf_len = ctx.args.get(2).as_usize();
    let addr_ptr = ForeignPtr::from(ctx.args.get(4));
    let addr_len_ptr = ForeignPtr::from(ctx.args.get(5));

    let (desc, socket) = socket_for_fd(ctx, fd)?;

    let mut buf = vec![0u8; std::cmp::min(buf_len, 1 << 20)];

    let result = match &socket {
        Socket::Udp(udp) => udp.borrow_mut().recvfrom(&mut buf, ctx.cb_queue),
        Socket::Tcp(tcp) => {
            let peer = tcp.borrow().peer_addr();
            tcp.borrow_mut()
                .read(&mut buf, ctx.cb_queue)
                .map(|n| (n, peer.unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))))
        }
    };

    match result {
        Ok((num_read, src)) => {
            ctx.process.memory().write_ptr(buf_ptr, &buf[..num_read])?;
            write_sockaddr(ctx.process.memory(), src, addr_ptr, addr_len_ptr)?;
            Ok(num_read.into())
        }
        Err(e) => Err(block_on_would_block(
            desc.file(),
            desc.file().borrow().status(),
            FileState::READABLE,
            e,
        )),
    }
}

pub fn getsockname(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let addr_ptr = ForeignPtr::from(ctx.args.get(1));
    let addr_len_ptr = ForeignPtr::from(ctx.args.get(2));

    let (_desc, socket) = socket_for_fd(ctx, fd)?;
    let addr = socket
        .borrow()
        .bound_addr()
        .unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

    write_sockaddr(ctx.process.memory(), addr, addr_ptr, addr_len_ptr)?;
    Ok(0.into())
}

pub fn getpeername(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let addr_ptr = ForeignPtr::from(ctx.args.get(1));
    let addr_len_ptr = ForeignPtr::from(ctx.args.get(2));

    let (_desc, socket) = socket_for_fd(ctx, fd)?;
    let Some(addr) = socket.borrow().peer_addr() else {
        return Err(Errno::ENOTCONN.into());
    };

    write_sockaddr(ctx.process.memory(), addr, addr_ptr, addr_len_ptr)?;
    Ok(0.into())
}

pub fn shutdown(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let how = ctx.args.get(1).as_i32();

    let (_desc, socket) = socket_for_fd(ctx, fd)?;
    let Socket::Tcp(tcp) = &socket else {
        // shutdown of a datagram socket is a no-op for us
        return Ok(0.into());
    };

    match how {
        libc::SHUT_RD => Ok(0.into()),
        libc::SHUT_WR | libc::SHUT_RDWR => {
            tcp.borrow_mut().shutdown_write(ctx.host, ctx.cb_queue)?;
            Ok(0.into())
        }
        _ => Err(Errno::EINVAL.into()),
    }
}
