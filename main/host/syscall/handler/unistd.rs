use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;
use umbra_shim_helper::syscall_types::ForeignPtr;

use crate::host::descriptor::pipe::Pipe;
use crate::host::descriptor::socket::Socket;
use crate::host::descriptor::{
    Descriptor, DescriptorFlags, File, FileState, FileStatus, OpenFile,
};
use crate::host::syscall::handler::{block_on_would_block, descriptor, SyscallContext};
use crate::host::syscall::types::{SyscallError, SyscallResult};

/// Largest single read/write we'll service; larger requests are truncated,
/// which the syscall contract allows.
const MAX_IO_NBYTES: usize = 1 << 20;

pub fn read(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let buf_ptr = ForeignPtr::from(ctx.args.get(1));
    let count = ctx.args.get(2).as_usize();

    let Some(desc) = descriptor(ctx.host, fd)? else {
        // not ours (e.g. a regular file): passthrough
        return Err(SyscallError::Native);
    };

    let file = desc.file().clone();
    let mut buf = vec![0u8; std::cmp::min(count, MAX_IO_NBYTES)];

    let result = match &file {
        File::Pipe(f) => f.borrow_mut().read(&mut buf, ctx.cb_queue),
        File::EventFd(f) => f.borrow_mut().read(&mut buf, ctx.cb_queue),
        File::TimerFd(f) => f.borrow_mut().read(&mut buf, ctx.cb_queue),
        File::Epoll(f) => f.borrow_mut().read(&mut buf, ctx.cb_queue),
        File::Socket(Socket::Udp(f)) => f
            .borrow_mut()
            .recvfrom(&mut buf, ctx.cb_queue)
            .map(|(n, _src)| n),
        File::Socket(Socket::Tcp(f)) => f.borrow_mut().read(&mut buf, ctx.cb_queue),
    };

    match result {
        Ok(num_read) => {
            ctx.process.memory().write_ptr(buf_ptr, &buf[..num_read])?;
            Ok(num_read.into())
        }
        Err(e) => Err(block_on_would_block(
            &file,
            file.borrow().status(),
            FileState::READABLE,
            e,
        )),
    }
}

pub fn write(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let buf_ptr = ForeignPtr::from(ctx.args.get(1));
    let count = ctx.args.get(2).as_usize();

    let Some(desc) = descriptor(ctx.host, fd)? else {
        return Err(SyscallError::Native);
    };

    let file = desc.file().clone();
    let mut buf = vec![0u8; std::cmp::min(count, MAX_IO_NBYTES)];
    ctx.process.memory().read_ptr(buf_ptr, &mut buf)?;

    let result = match &file {
        File::Pipe(f) => f.borrow_mut().write(&buf, ctx.cb_queue),
        File::EventFd(f) => f.borrow_mut().write(&buf, ctx.cb_queue),
        File::TimerFd(f) => f.borrow_mut().write(&buf, ctx.cb_queue),
        File::Epoll(f) => f.borrow_mut().write(&buf, ctx.cb_queue),
        File::Socket(Socket::Udp(f)) => f.borrow_mut().sendto(ctx.host, &buf, None),
        File::Socket(Socket::Tcp(f)) => f.borrow_mut().write(ctx.host, &buf, ctx.cb_queue),
    };

    match result {
        Ok(num_written) => Ok(num_written.into()),
        Err(e) => Err(block_on_would_block(
            &file,
            file.borrow().status(),
            FileState::WRITABLE,
            e,
        )),
    }
}

pub fn close(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();

    if descriptor(ctx.host, fd)?.is_none() {
        return Err(SyscallError::Native);
    }

    let desc = ctx.host.deregister_descriptor(fd as u32).unwrap();

    // a socket that disappears from the table also leaves the interface
    if let File::Socket(Socket::Udp(udp)) = desc.file() {
        if let Some(bound) = udp.borrow().bound_addr() {
            ctx.host.interface().disassociate_udp(bound.port());
        }
    }

    match desc.close(ctx.cb_queue) {
        Some(Ok(())) | None => Ok(0.into()),
        Some(Err(e)) => Err(e),
    }
}

pub fn pipe(ctx: &mut SyscallContext) -> SyscallResult {
    pipe_helper(ctx, 0)
}

pub fn pipe2(ctx: &mut SyscallContext) -> SyscallResult {
    let flags = ctx.args.get(1).as_i32();
    pipe_helper(ctx, flags)
}

fn pipe_helper(ctx: &mut SyscallContext, flags: i32) -> SyscallResult {
    let fds_ptr = ForeignPtr::from(ctx.args.get(0));

    let mut status = FileStatus::empty();
    let mut desc_flags = DescriptorFlags::empty();
    let mut remaining = flags;
    if remaining & libc::O_NONBLOCK != 0 {
        status.insert(FileStatus::NONBLOCK);
        remaining &= !libc::O_NONBLOCK;
    }
    if remaining & libc::O_CLOEXEC != 0 {
        desc_flags.insert(DescriptorFlags::CLOEXEC);
        remaining &= !libc::O_CLOEXEC;
    }
    if remaining != 0 {
        log::debug!("Invalid pipe2 flags: {flags}");
        return Err(Errno::EINVAL.into());
    }

    let (reader, writer) = Pipe::new_pair(status);

    let mut reader_desc = Descriptor::new(OpenFile::new(File::Pipe(reader)));
    let mut writer_desc = Descriptor::new(OpenFile::new(File::Pipe(writer)));
    reader_desc.set_flags(desc_flags);
    writer_desc.set_flags(desc_flags);

    let read_fd = ctx.host.register_descriptor(reader_desc) as i32;
    let write_fd = ctx.host.register_descriptor(writer_desc) as i32;

    let fds = [read_fd, write_fd];
    if let Err(e) = ctx.process.memory().write_val(fds_ptr, &fds) {
        // unwind the table on a bad pointer
        ctx.host.deregister_descriptor(read_fd as u32);
        ctx.host.deregister_descriptor(write_fd as u32);
        return Err(e.into());
    }

    Ok(0.into())
}

pub fn dup(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();

    let Some(desc) = descriptor(ctx.host, fd)? else {
        return Err(SyscallError::Native);
    };

    let dup = desc.dup(DescriptorFlags::empty());
    let dup_fd = ctx.host.register_descriptor(dup);
    Ok(dup_fd.into())
}

pub fn getpid(ctx: &mut SyscallContext) -> SyscallResult {
    Ok(ctx.process.virtual_pid().into())
}

/// Shared helper: the `Arc<AtomicRefCell<T>>` behind a [`File`] variant, for
/// handlers needing the concrete type.
pub(crate) fn file_as_socket(file: &File) -> Result<&Socket, SyscallError> {
    match file {
        File::Socket(s) => Ok(s),
        _ => Err(Errno::ENOTSOCK.into()),
    }
}

pub(crate) fn file_as_epoll(
    file: &File,
) -> Result<&Arc<AtomicRefCell<crate::host::descriptor::epoll::Epoll>>, SyscallError> {
    match file {
        File::Epoll(e) => Ok(e),
        _ => Err(Errno::EINVAL.into()),
    }
}
