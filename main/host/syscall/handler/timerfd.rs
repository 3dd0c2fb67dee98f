use nix::errno::Errno;
use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::simulation_time::SimulationTime;
use umbra_shim_helper::syscall_types::ForeignPtr;

use crate::core::worker::Worker;
use crate::host::descriptor::timerfd::TimerFd;
use crate::host::descriptor::{Descriptor, DescriptorFlags, File, FileStatus, OpenFile};
use crate::host::syscall::handler::{descriptor, SyscallContext};
use crate::host::syscall::handler::time::{simtime_from_timespec, timespec_from_simtime};
use crate::host::syscall::types::{SyscallError, SyscallResult};

pub fn timerfd_create(ctx: &mut SyscallContext) -> SyscallResult {
    // the clock id is irrelevant: all clocks read the same virtual time
    let flags = ctx.args.get(1).as_i32();

    let mut status = FileStatus::empty();
    let mut desc_flags = DescriptorFlags::empty();

    let mut remaining = flags;
    if remaining & libc::TFD_NONBLOCK != 0 {
        status.insert(FileStatus::NONBLOCK);
        remaining &= !libc::TFD_NONBLOCK;
    }
    if remaining & libc::TFD_CLOEXEC != 0 {
        desc_flags.insert(DescriptorFlags::CLOEXEC);
        remaining &= !libc::TFD_CLOEXEC;
    }
    if remaining != 0 {
        log::debug!("Invalid timerfd_create flags: {flags}");
        return Err(Errno::EINVAL.into());
    }

    let file = TimerFd::new(status);

    let mut desc = Descriptor::new(OpenFile::new(File::TimerFd(file)));
    desc.set_flags(desc_flags);

    let fd = ctx.host.register_descriptor(desc);
    Ok(fd.into())
}

fn timerfd_file(ctx: &SyscallContext, fd: i64) -> Result<File, SyscallError> {
    let Some(desc) = descriptor(ctx.host, fd)? else {
        return Err(Errno::EBADF.into());
    };
    match desc.file() {
        File::TimerFd(_) => Ok(desc.file().clone()),
        _ => Err(Errno::EINVAL.into()),
    }
}

pub fn timerfd_settime(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let flags = ctx.args.get(1).as_i32();
    let new_value_ptr = ForeignPtr::from(ctx.args.get(2));
    let old_value_ptr = ForeignPtr::from(ctx.args.get(3));

    if flags & !libc::TFD_TIMER_ABSTIME != 0 {
        log::debug!("Invalid timerfd_settime flags: {flags}");
        return Err(Errno::EINVAL.into());
    }

    let File::TimerFd(file) = timerfd_file(ctx, fd)? else {
        unreachable!()
    };

    let new_value: libc::itimerspec = ctx.process.memory().read_val(new_value_ptr)?;
    let initial = simtime_from_timespec(new_value.it_value)?;
    let interval = simtime_from_timespec(new_value.it_interval)?;

    // a zero it_value disarms the timer
    let now = Worker::current_time().unwrap();
    let initial = if initial.is_zero() {
        None
    } else if flags & libc::TFD_TIMER_ABSTIME != 0 {
        // an absolute time in the past expires immediately
        Some(std::cmp::max(EmulatedTime::UNIX_EPOCH + initial, now))
    } else {
        Some(now + initial)
    };

    let (old_remaining, old_interval) =
        file.borrow_mut()
            .set_time(ctx.host, initial, interval, ctx.cb_queue);

    if !old_value_ptr.is_null() {
        let old_value = libc::itimerspec {
            it_value: timespec_from_simtime(old_remaining.unwrap_or(SimulationTime::ZERO)),
            it_interval: timespec_from_simtime(old_interval),
        };
        ctx.process.memory().write_val(old_value_ptr, &old_value)?;
    }

    Ok(0.into())
}

pub fn timerfd_gettime(ctx: &mut SyscallContext) -> SyscallResult {
    let fd = ctx.args.get(0).as_i64();
    let curr_value_ptr = ForeignPtr::from(ctx.args.get(1));

    let File::TimerFd(file) = timerfd_file(ctx, fd)? else {
        unreachable!()
    };

    let (remaining, interval) = file.borrow().get_time();
    let curr_value = libc::itimerspec {
        it_value: timespec_from_simtime(remaining.unwrap_or(SimulationTime::ZERO)),
        it_interval: timespec_from_simtime(interval),
    };
    ctx.process.memory().write_val(curr_value_ptr, &curr_value)?;

    Ok(0.into())
}
