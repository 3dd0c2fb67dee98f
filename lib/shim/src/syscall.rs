//! The funnel every intercepted syscall passes through, and the escape
//! hatch for executing one natively.

use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::shim_event::{ShimEventToShadow, ShimEventToShim};
use umbra_shim_helper::syscall_types::{SysCallArgs, SysCallReg};

use crate::{interception_active, ipc, sim_time, AllowNativeGuard};

/// Execute a syscall instruction directly, bypassing interception.
///
/// # Safety
///
/// Syscalls can do anything; the caller vouches for the arguments.
pub unsafe fn native_syscall(n: i64, args: [u64; 6]) -> i64 {
    let ret: i64;
    unsafe {
        core::arch::asm!(
            "syscall",
            inlateout("rax") n => ret,
            in("rdi") args[0],
            in("rsi") args[1],
            in("rdx") args[2],
            in("r10") args[3],
            in("r8") args[4],
            in("r9") args[5],
            // the kernel clobbers rcx and r11
            out("rcx") _,
            out("r11") _,
        );
    }
    ret
}

/// Handle an intercepted syscall. Returns the raw kernel-convention result
/// (negative errno on failure).
pub fn shim_syscall(n: i64, args: [u64; 6]) -> i64 {
    if !interception_active() {
        return unsafe { native_syscall(n, args) };
    }

    // A process exit must tear down the channel first, or the engine would
    // wait forever on a process that is gone.
    if n == libc::SYS_exit_group || n == libc::SYS_exit {
        crate::exit_with_code(args[0] as i32);
    }

    // Time reads are answered from the shared clock without a control
    // transfer; this is also where the patched VDSO entries land.
    match n {
        libc::SYS_clock_gettime => {
            if let Some(now) = sim_time() {
                return clock_gettime_local(now, args[1]);
            }
        }
        libc::SYS_gettimeofday => {
            if let Some(now) = sim_time() {
                return gettimeofday_local(now, args[0]);
            }
        }
        libc::SYS_time => {
            if let Some(now) = sim_time() {
                return time_local(now, args[0]);
            }
        }
        _ => (),
    }

    // Everything else crosses into the engine. The channel's own futex
    // syscalls must run natively or we'd recurse into this function.
    let _guard = AllowNativeGuard::new();

    let Some(ipc) = ipc() else {
        return unsafe { native_syscall(n, args) };
    };

    let syscall_args = SysCallArgs {
        number: n,
        args: args.map(SysCallReg::from),
    };
    ipc.to_shadow().send(ShimEventToShadow::Syscall(syscall_args));

    loop {
        match ipc.from_shadow().receive() {
            Ok(ShimEventToShim::SyscallComplete(retval)) => return retval.as_i64(),
            Ok(ShimEventToShim::SyscallDoNative) => {
                return unsafe { native_syscall(n, args) };
            }
            Ok(ShimEventToShim::Signal(signo)) => {
                // deliver the virtual signal, then keep waiting for the
                // syscall's outcome
                unsafe { libc::raise(signo) };
            }
            Ok(ShimEventToShim::Start) => {
                // stale; ignore
            }
            Err(_) => {
                // the engine is gone; nothing sensible left to do
                std::process::exit(1);
            }
        }
    }
}

fn clock_gettime_local(now: EmulatedTime, ts_ptr: u64) -> i64 {
    if ts_ptr == 0 {
        return -libc::EFAULT as i64;
    }
    let since_epoch = now.duration_since(&EmulatedTime::UNIX_EPOCH);
    let ts = libc::timespec {
        tv_sec: since_epoch.as_secs() as libc::time_t,
        tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
    };
    unsafe { (ts_ptr as *mut libc::timespec).write(ts) };
    0
}

fn gettimeofday_local(now: EmulatedTime, tv_ptr: u64) -> i64 {
    if tv_ptr != 0 {
        let since_epoch = now.duration_since(&EmulatedTime::UNIX_EPOCH);
        let tv = libc::timeval {
            tv_sec: since_epoch.as_secs() as libc::time_t,
            tv_usec: (since_epoch.subsec_nanos() / 1_000) as libc::suseconds_t,
        };
        unsafe { (tv_ptr as *mut libc::timeval).write(tv) };
    }
    0
}

fn time_local(now: EmulatedTime, tloc_ptr: u64) -> i64 {
    let secs = now.duration_since(&EmulatedTime::UNIX_EPOCH).as_secs() as i64;
    if tloc_ptr != 0 {
        unsafe { (tloc_ptr as *mut libc::time_t).write(secs) };
    }
    secs
}
