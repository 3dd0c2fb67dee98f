//! The dispatch boundary for intercepted syscalls. Calls that only touch
//! process-local state are sent back for native execution; calls that read
//! time or touch I/O are emulated against the host's descriptor layer.

use nix::errno::Errno;
use umbra_shim_helper::syscall_types::SysCallArgs;

use crate::host::descriptor::{Descriptor, File, FileState, FileStatus};
use crate::host::host::Host;
use crate::host::process::Process;
use crate::host::syscall::types::{Failed, SyscallError, SyscallResult};
use crate::utility::callback_queue::CallbackQueue;

mod epoll;
mod eventfd;
mod futex;
mod socket;
mod time;
mod timerfd;
mod unistd;

/// The context handed to each syscall handler.
pub struct SyscallContext<'a> {
    pub host: &'a Host,
    pub process: &'a mut Process,
    pub args: &'a SysCallArgs,
    /// True when a previously blocked syscall is being re-run after its
    /// condition fired.
    pub rerun: bool,
    pub cb_queue: &'a mut CallbackQueue,
}

pub fn dispatch(
    host: &Host,
    process: &mut Process,
    args: &SysCallArgs,
    rerun: bool,
    cb_queue: &mut CallbackQueue,
) -> SyscallResult {
    let mut ctx = SyscallContext {
        host,
        process,
        args,
        rerun,
        cb_queue,
    };

    match args.number {
        libc::SYS_read => unistd::read(&mut ctx),
        libc::SYS_write => unistd::write(&mut ctx),
        libc::SYS_close => unistd::close(&mut ctx),
        libc::SYS_pipe => unistd::pipe(&mut ctx),
        libc::SYS_pipe2 => unistd::pipe2(&mut ctx),
        libc::SYS_dup => unistd::dup(&mut ctx),
        libc::SYS_getpid => unistd::getpid(&mut ctx),

        libc::SYS_eventfd => eventfd::eventfd(&mut ctx),
        libc::SYS_eventfd2 => eventfd::eventfd2(&mut ctx),

        libc::SYS_timerfd_create => timerfd::timerfd_create(&mut ctx),
        libc::SYS_timerfd_settime => timerfd::timerfd_settime(&mut ctx),
        libc::SYS_timerfd_gettime => timerfd::timerfd_gettime(&mut ctx),

        libc::SYS_epoll_create => epoll::epoll_create(&mut ctx),
        libc::SYS_epoll_create1 => epoll::epoll_create1(&mut ctx),
        libc::SYS_epoll_ctl => epoll::epoll_ctl(&mut ctx),
        libc::SYS_epoll_wait => epoll::epoll_wait(&mut ctx),
        libc::SYS_epoll_pwait => epoll::epoll_pwait(&mut ctx),

        libc::SYS_socket => socket::socket(&mut ctx),
        libc::SYS_bind => socket::bind(&mut ctx),
        libc::SYS_connect => socket::connect(&mut ctx),
        libc::SYS_listen => socket::listen(&mut ctx),
        libc::SYS_accept => socket::accept(&mut ctx),
        libc::SYS_accept4 => socket::accept4(&mut ctx),
        libc::SYS_sendto => socket::sendto(&mut ctx),
        libc::SYS_recvfrom => socket::recvfrom(&mut ctx),
        libc::SYS_getsockname => socket::getsockname(&mut ctx),
        libc::SYS_getpeername => socket::getpeername(&mut ctx),
        libc::SYS_shutdown => socket::shutdown(&mut ctx),

        libc::SYS_futex => futex::futex(&mut ctx),

        libc::SYS_clock_gettime => time::clock_gettime(&mut ctx),
        libc::SYS_gettimeofday => time::gettimeofday(&mut ctx),
        libc::SYS_time => time::time(&mut ctx),
        libc::SYS_nanosleep => time::nanosleep(&mut ctx),
        libc::SYS_clock_nanosleep => time::clock_nanosleep(&mut ctx),

        number => {
            // process-local or unsupported: let the process run it against
            // the real kernel
            log::trace!("Syscall {number} executes natively");
            Err(SyscallError::Native)
        }
    }
}

/// The descriptor behind a guest fd, or None if the fd is not in the table
/// (e.g. a regular file the process opened natively).
pub(crate) fn descriptor(host: &Host, fd: i64) -> Result<Option<Descriptor>, SyscallError> {
    if fd < 0 {
        return Err(Errno::EBADF.into());
    }
    Ok(host.descriptor(fd as u32))
}

/// Convert a would-block failure into a parked condition waiting for
/// `wait_state` on `file`, unless the file is non-blocking.
pub(crate) fn block_on_would_block(
    file: &File,
    status: FileStatus,
    wait_state: FileState,
    err: SyscallError,
) -> SyscallError {
    match &err {
        SyscallError::Failed(Failed { errno, .. })
            if *errno == Errno::EWOULDBLOCK && !status.contains(FileStatus::NONBLOCK) =>
        {
            SyscallError::new_blocked_on_file(file.clone(), wait_state, true)
        }
        _ => err,
    }
}
