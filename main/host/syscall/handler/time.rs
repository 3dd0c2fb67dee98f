use nix::errno::Errno;
use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::simulation_time::SimulationTime;
use umbra_shim_helper::syscall_types::ForeignPtr;

use crate::core::worker::Worker;
use crate::host::syscall::handler::SyscallContext;
use crate::host::syscall::types::{SyscallError, SyscallResult};

pub(crate) fn simtime_from_timespec(ts: libc::timespec) -> Result<SimulationTime, Errno> {
    if ts.tv_sec < 0 || !(0..1_000_000_000).contains(&ts.tv_nsec) {
        return Err(Errno::EINVAL);
    }
    Ok(SimulationTime::from_secs(ts.tv_sec as u64)
        + SimulationTime::from_nanos(ts.tv_nsec as u64))
}

pub(crate) fn timespec_from_simtime(t: SimulationTime) -> libc::timespec {
    libc::timespec {
        tv_sec: t.as_secs() as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    }
}

fn emulated_now() -> EmulatedTime {
    Worker::current_time().unwrap()
}

pub fn clock_gettime(ctx: &mut SyscallContext) -> SyscallResult {
    // every clock reads the same virtual time
    let ts_ptr = ForeignPtr::from(ctx.args.get(1));

    let since_epoch = emulated_now().duration_since(&EmulatedTime::UNIX_EPOCH);
    let ts = timespec_from_simtime(since_epoch);
    ctx.process.memory().write_val(ts_ptr, &ts)?;

    Ok(0.into())
}

pub fn gettimeofday(ctx: &mut SyscallContext) -> SyscallResult {
    let tv_ptr = ForeignPtr::from(ctx.args.get(0));

    if !tv_ptr.is_null() {
        let since_epoch = emulated_now().duration_since(&EmulatedTime::UNIX_EPOCH);
        let tv = libc::timeval {
            tv_sec: since_epoch.as_secs() as libc::time_t,
            tv_usec: (since_epoch.subsec_nanos() / 1_000) as libc::suseconds_t,
        };
        ctx.process.memory().write_val(tv_ptr, &tv)?;
    }

    Ok(0.into())
}

pub fn time(ctx: &mut SyscallContext) -> SyscallResult {
    let tloc_ptr = ForeignPtr::from(ctx.args.get(0));

    let secs = emulated_now()
        .duration_since(&EmulatedTime::UNIX_EPOCH)
        .as_secs() as libc::time_t;

    if !tloc_ptr.is_null() {
        ctx.process.memory().write_val(tloc_ptr, &secs)?;
    }

    Ok(secs.into())
}

pub fn nanosleep(ctx: &mut SyscallContext) -> SyscallResult {
    // the wakeup event is what re-runs us; any re-run means the deadline passed
    if ctx.rerun {
        return Ok(0.into());
    }

    let req_ptr = ForeignPtr::from(ctx.args.get(0));
    let req: libc::timespec = ctx.process.memory().read_val(req_ptr)?;
    let duration = simtime_from_timespec(req)?;

    if duration.is_zero() {
        return Ok(0.into());
    }

    Err(SyscallError::new_blocked_until(
        emulated_now() + duration,
        false,
    ))
}

pub fn clock_nanosleep(ctx: &mut SyscallContext) -> SyscallResult {
    if ctx.rerun {
        return Ok(0.into());
    }

    let flags = ctx.args.get(1).as_i32();
    let req_ptr = ForeignPtr::from(ctx.args.get(2));
    let req: libc::timespec = ctx.process.memory().read_val(req_ptr)?;
    let duration = simtime_from_timespec(req)?;

    let deadline = if flags & libc::TIMER_ABSTIME != 0 {
        // an absolute wall-clock instant
        EmulatedTime::UNIX_EPOCH + duration
    } else {
        emulated_now() + duration
    };

    if deadline <= emulated_now() {
        return Ok(0.into());
    }

    Err(SyscallError::new_blocked_until(deadline, false))
}
