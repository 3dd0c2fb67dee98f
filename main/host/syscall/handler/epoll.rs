use std::sync::Arc;

use nix::errno::Errno;
use umbra_shim_helper::simulation_time::SimulationTime;
use umbra_shim_helper::syscall_types::ForeignPtr;

use crate::core::worker::Worker;
use crate::host::descriptor::epoll::{Epoll, EpollCtlOp, EpollEvents};
use crate::host::descriptor::{Descriptor, DescriptorFlags, File, FileState, FileStatus, OpenFile};
use crate::host::syscall::condition::SyscallCondition;
use crate::host::syscall::handler::unistd::file_as_epoll;
use crate::host::syscall::handler::{descriptor, SyscallContext};
use crate::host::syscall::types::{Blocked, SyscallError, SyscallResult};

pub fn epoll_create(ctx: &mut SyscallContext) -> SyscallResult {
    // epoll_create(2): the size is ignored but must be positive
    let size = ctx.args.get(0).as_i32();
    if size <= 0 {
        return Err(Errno::EINVAL.into());
    }
    epoll_create_helper(ctx, 0)
}

pub fn epoll_create1(ctx: &mut SyscallContext) -> SyscallResult {
    let flags = ctx.args.get(0).as_i32();
    epoll_create_helper(ctx, flags)
}

fn epoll_create_helper(ctx: &mut SyscallContext, flags: i32) -> SyscallResult {
    let mut desc_flags = DescriptorFlags::empty();

    let mut remaining = flags;
    if remaining & libc::EPOLL_CLOEXEC != 0 {
        desc_flags.insert(DescriptorFlags::CLOEXEC);
        remaining &= !libc::EPOLL_CLOEXEC;
    }
    if remaining != 0 {
        return Err(Errno::EINVAL.into());
    }

    let file = Epoll::new(FileStatus::empty());

    let mut desc = Descriptor::new(OpenFile::new(File::Epoll(file)));
    desc.set_flags(desc_flags);

    let fd = ctx.host.register_descriptor(desc);
    Ok(fd.into())
}

pub fn epoll_ctl(ctx: &mut SyscallContext) -> SyscallResult {
    let epfd = ctx.args.get(0).as_i64();
    let op = ctx.args.get(1).as_i32();
    let target_fd = ctx.args.get(2).as_i32();
    let event_ptr = ForeignPtr::from(ctx.args.get(3));

    let Some(epoll_desc) = descriptor(ctx.host, epfd)? else {
        return Err(Errno::EBADF.into());
    };
    let epoll = Arc::clone(file_as_epoll(epoll_desc.file())?);

    let Some(target_desc) = descriptor(ctx.host, target_fd as i64)? else {
        return Err(Errno::EBADF.into());
    };
    let target_file = target_desc.file().clone();

    // an epoll set may not monitor itself
    if target_file.canonical_handle() == epoll_desc.file().canonical_handle() {
        return Err(Errno::EINVAL.into());
    }

    let op = match op {
        libc::EPOLL_CTL_ADD => EpollCtlOp::Add,
        libc::EPOLL_CTL_MOD => EpollCtlOp::Mod,
        libc::EPOLL_CTL_DEL => EpollCtlOp::Del,
        _ => return Err(Errno::EINVAL.into()),
    };

    let (events, data) = if op == EpollCtlOp::Del {
        (EpollEvents::empty(), 0)
    } else {
        let event: libc::epoll_event = ctx.process.memory().read_val(event_ptr)?;
        (EpollEvents::from_bits_truncate(event.events), event.u64)
    };

    epoll.borrow_mut().ctl(
        op,
        target_fd,
        target_file,
        events,
        data,
        Arc::downgrade(&epoll),
        ctx.cb_queue,
    )?;

    Ok(0.into())
}

pub fn epoll_wait(ctx: &mut SyscallContext) -> SyscallResult {
    let timeout_ms = ctx.args.get(3).as_i32();
    epoll_wait_helper(ctx, timeout_ms)
}

pub fn epoll_pwait(ctx: &mut SyscallContext) -> SyscallResult {
    // the signal mask is ignored: virtual signal delivery is already
    // serialized with syscall handling
    let timeout_ms = ctx.args.get(3).as_i32();
    epoll_wait_helper(ctx, timeout_ms)
}

fn epoll_wait_helper(ctx: &mut SyscallContext, timeout_ms: i32) -> SyscallResult {
    let epfd = ctx.args.get(0).as_i64();
    let events_ptr = ForeignPtr::from(ctx.args.get(1));
    let max_events = ctx.args.get(2).as_i32();

    if max_events <= 0 {
        return Err(Errno::EINVAL.into());
    }

    let Some(epoll_desc) = descriptor(ctx.host, epfd)? else {
        return Err(Errno::EBADF.into());
    };
    let epoll = Arc::clone(file_as_epoll(epoll_desc.file())?);

    let ready = epoll
        .borrow_mut()
        .collect_ready_events(ctx.cb_queue, max_events as u32);

    if !ready.is_empty() {
        let mut events_out = Vec::with_capacity(ready.len());
        for (events, data) in &ready {
            events_out.push(libc::epoll_event {
                events: events.bits(),
                u64: *data,
            });
        }

        let event_nbytes = std::mem::size_of::<libc::epoll_event>();
        for (i, event) in events_out.iter().enumerate() {
            ctx.process
                .memory()
                .write_val(events_ptr.add(i * event_nbytes), event)?;
        }

        return Ok(events_out.len().into());
    }

    // nothing ready: a zero timeout polls, a wakeup with nothing to report
    // means the timeout expired
    if timeout_ms == 0 || ctx.rerun {
        return Ok(0.into());
    }

    let mut condition =
        SyscallCondition::new_from_file(epoll_desc.file().clone(), FileState::READABLE);
    if timeout_ms > 0 {
        let timeout = SimulationTime::from_millis(timeout_ms as u64);
        condition.set_timeout(Some(Worker::current_time().unwrap() + timeout));
    }

    Err(SyscallError::Blocked(Blocked {
        condition,
        restartable: false,
    }))
}
