//! Preloaded overrides of the libc wrappers managed programs actually call.
//! Every override funnels into [`shim_syscall`](crate::syscall::shim_syscall)
//! through the same argument packing, so the engine sees one uniform
//! interface.

use libc::{c_int, c_long, c_uint, c_void, size_t, socklen_t, ssize_t};

use crate::syscall::shim_syscall;

/// Convert a raw kernel-convention result into the libc convention:
/// -1 with errno set.
fn libc_ret(ret: i64) -> i64 {
    if ret < 0 {
        unsafe { *libc::__errno_location() = (-ret) as c_int };
        -1
    } else {
        ret
    }
}

fn raw(n: i64, args: [u64; 6]) -> i64 {
    libc_ret(shim_syscall(n, args))
}

// The variadic `syscall(2)` wrapper itself. Its C argument registers line up
// exactly with a seven-argument SysV function, so a bare jump from the
// exported symbol into the fixed-arity handler forwards everything,
// including the sixth syscall argument on the stack.
std::arch::global_asm!(
    ".globl syscall",
    ".type syscall, @function",
    "syscall:",
    "jmp {0}",
    sym syscall_varargs,
);

extern "C" fn syscall_varargs(n: c_long, a: u64, b: u64, c: u64, d: u64, e: u64, f: u64) -> c_long {
    libc_ret(shim_syscall(n, [a, b, c, d, e, f]))
}

#[no_mangle]
pub extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    raw(libc::SYS_read, [fd as u64, buf as u64, count as u64, 0, 0, 0]) as ssize_t
}

#[no_mangle]
pub extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    raw(libc::SYS_write, [fd as u64, buf as u64, count as u64, 0, 0, 0]) as ssize_t
}

#[no_mangle]
pub extern "C" fn close(fd: c_int) -> c_int {
    raw(libc::SYS_close, [fd as u64, 0, 0, 0, 0, 0]) as c_int
}

#[no_mangle]
pub extern "C" fn dup(fd: c_int) -> c_int {
    raw(libc::SYS_dup, [fd as u64, 0, 0, 0, 0, 0]) as c_int
}

#[no_mangle]
pub extern "C" fn pipe(fds: *mut c_int) -> c_int {
    raw(libc::SYS_pipe, [fds as u64, 0, 0, 0, 0, 0]) as c_int
}

#[no_mangle]
pub extern "C" fn pipe2(fds: *mut c_int, flags: c_int) -> c_int {
    raw(libc::SYS_pipe2, [fds as u64, flags as u64, 0, 0, 0, 0]) as c_int
}

#[no_mangle]
pub extern "C" fn eventfd(initval: c_uint, flags: c_int) -> c_int {
    raw(
        libc::SYS_eventfd2,
        [initval as u64, flags as u64, 0, 0, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn timerfd_create(clockid: c_int, flags: c_int) -> c_int {
    raw(
        libc::SYS_timerfd_create,
        [clockid as u64, flags as u64, 0, 0, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn timerfd_settime(
    fd: c_int,
    flags: c_int,
    new_value: *const libc::itimerspec,
    old_value: *mut libc::itimerspec,
) -> c_int {
    raw(
        libc::SYS_timerfd_settime,
        [
            fd as u64,
            flags as u64,
            new_value as u64,
            old_value as u64,
            0,
            0,
        ],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn timerfd_gettime(fd: c_int, curr_value: *mut libc::itimerspec) -> c_int {
    raw(
        libc::SYS_timerfd_gettime,
        [fd as u64, curr_value as u64, 0, 0, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn epoll_create(size: c_int) -> c_int {
    raw(libc::SYS_epoll_create, [size as u64, 0, 0, 0, 0, 0]) as c_int
}

#[no_mangle]
pub extern "C" fn epoll_create1(flags: c_int) -> c_int {
    raw(libc::SYS_epoll_create1, [flags as u64, 0, 0, 0, 0, 0]) as c_int
}

#[no_mangle]
pub extern "C" fn epoll_ctl(
    epfd: c_int,
    op: c_int,
    fd: c_int,
    event: *mut libc::epoll_event,
) -> c_int {
    raw(
        libc::SYS_epoll_ctl,
        [epfd as u64, op as u64, fd as u64, event as u64, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn epoll_wait(
    epfd: c_int,
    events: *mut libc::epoll_event,
    maxevents: c_int,
    timeout: c_int,
) -> c_int {
    raw(
        libc::SYS_epoll_wait,
        [
            epfd as u64,
            events as u64,
            maxevents as u64,
            timeout as u64,
            0,
            0,
        ],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn socket(domain: c_int, socket_type: c_int, protocol: c_int) -> c_int {
    raw(
        libc::SYS_socket,
        [domain as u64, socket_type as u64, protocol as u64, 0, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn bind(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    raw(
        libc::SYS_bind,
        [fd as u64, addr as u64, addrlen as u64, 0, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    raw(
        libc::SYS_connect,
        [fd as u64, addr as u64, addrlen as u64, 0, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn listen(fd: c_int, backlog: c_int) -> c_int {
    raw(libc::SYS_listen, [fd as u64, backlog as u64, 0, 0, 0, 0]) as c_int
}

#[no_mangle]
pub extern "C" fn accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    raw(
        libc::SYS_accept,
        [fd as u64, addr as u64, addrlen as u64, 0, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn accept4(
    fd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
    flags: c_int,
) -> c_int {
    raw(
        libc::SYS_accept4,
        [fd as u64, addr as u64, addrlen as u64, flags as u64, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    sendto(fd, buf, len, flags, std::ptr::null(), 0)
}

#[no_mangle]
pub extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    recvfrom(fd, buf, len, flags, std::ptr::null_mut(), std::ptr::null_mut())
}

#[no_mangle]
pub extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    raw(
        libc::SYS_sendto,
        [
            fd as u64,
            buf as u64,
            len as u64,
            flags as u64,
            dest_addr as u64,
            addrlen as u64,
        ],
    ) as ssize_t
}

#[no_mangle]
pub extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    raw(
        libc::SYS_recvfrom,
        [
            fd as u64,
            buf as u64,
            len as u64,
            flags as u64,
            src_addr as u64,
            addrlen as u64,
        ],
    ) as ssize_t
}

#[no_mangle]
pub extern "C" fn getsockname(
    fd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    raw(
        libc::SYS_getsockname,
        [fd as u64, addr as u64, addrlen as u64, 0, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn getpeername(
    fd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    raw(
        libc::SYS_getpeername,
        [fd as u64, addr as u64, addrlen as u64, 0, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn shutdown(fd: c_int, how: c_int) -> c_int {
    raw(libc::SYS_shutdown, [fd as u64, how as u64, 0, 0, 0, 0]) as c_int
}

#[no_mangle]
pub extern "C" fn getpid() -> libc::pid_t {
    raw(libc::SYS_getpid, [0; 6]) as libc::pid_t
}

#[no_mangle]
pub extern "C" fn clock_gettime(clockid: libc::clockid_t, ts: *mut libc::timespec) -> c_int {
    raw(
        libc::SYS_clock_gettime,
        [clockid as u64, ts as u64, 0, 0, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn gettimeofday(tv: *mut libc::timeval, tz: *mut c_void) -> c_int {
    raw(
        libc::SYS_gettimeofday,
        [tv as u64, tz as u64, 0, 0, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn time(tloc: *mut libc::time_t) -> libc::time_t {
    shim_syscall(libc::SYS_time, [tloc as u64, 0, 0, 0, 0, 0]) as libc::time_t
}

#[no_mangle]
pub extern "C" fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    raw(
        libc::SYS_nanosleep,
        [req as u64, rem as u64, 0, 0, 0, 0],
    ) as c_int
}

#[no_mangle]
pub extern "C" fn usleep(usec: libc::useconds_t) -> c_int {
    let req = libc::timespec {
        tv_sec: (usec / 1_000_000) as libc::time_t,
        tv_nsec: ((usec % 1_000_000) * 1_000) as libc::c_long,
    };
    nanosleep(&req, std::ptr::null_mut())
}

#[no_mangle]
pub extern "C" fn sleep(seconds: c_uint) -> c_uint {
    let req = libc::timespec {
        tv_sec: seconds as libc::time_t,
        tv_nsec: 0,
    };
    // no virtual signals interrupt a plain sleep, so it always completes
    nanosleep(&req, std::ptr::null_mut());
    0
}

/// Target of the patched `__vdso_getcpu` entry: every virtual host looks
/// like a single-CPU machine.
#[no_mangle]
pub extern "C" fn umbra_shim_getcpu(cpu: *mut c_uint, node: *mut c_uint, _unused: *mut c_void) -> c_int {
    if !cpu.is_null() {
        unsafe { cpu.write(0) };
    }
    if !node.is_null() {
        unsafe { node.write(0) };
    }
    0
}
