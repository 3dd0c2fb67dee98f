use nix::errno::Errno;
use umbra_shim_helper::syscall_types::ForeignPtr;

use crate::core::worker::Worker;
use crate::host::syscall::condition::{SyscallCondition, Trigger};
use crate::host::syscall::handler::time::simtime_from_timespec;
use crate::host::syscall::handler::SyscallContext;
use crate::host::syscall::types::{Blocked, SyscallError, SyscallResult};

pub fn futex(ctx: &mut SyscallContext) -> SyscallResult {
    let uaddr = ForeignPtr::from(ctx.args.get(0));
    let op = ctx.args.get(1).as_i32();
    let val = ctx.args.get(2).as_u32();
    let timeout_ptr = ForeignPtr::from(ctx.args.get(3));

    // the private and clock-selection bits don't change our behavior
    let cmd = op & !(libc::FUTEX_PRIVATE_FLAG | libc::FUTEX_CLOCK_REALTIME);

    match cmd {
        libc::FUTEX_WAIT => futex_wait(ctx, uaddr, val, timeout_ptr),
        libc::FUTEX_WAKE => futex_wake(ctx, uaddr, val),
        _ => {
            log::trace!("Unhandled futex op {op}; executing natively");
            Err(SyscallError::Native)
        }
    }
}

fn futex_wait(
    ctx: &mut SyscallContext,
    uaddr: ForeignPtr,
    val: u32,
    timeout_ptr: ForeignPtr,
) -> SyscallResult {
    let addr = uaddr.val();

    // a re-run means our waiter fired: either a wake or the timeout
    if ctx.rerun {
        if let Some((waiter_addr, waiter)) = ctx.process.futex_waiter.take() {
            assert_eq!(waiter_addr, addr);
            if waiter.was_woken() {
                return Ok(0.into());
            }
            // the timeout fired first; withdraw from the wait list
            ctx.host
                .with_futex_table_mut(|table| table.cancel(addr, &waiter));
            return Err(Errno::ETIMEDOUT.into());
        }
        // no registration survived (the process was interrupted elsewhere)
        return Err(Errno::EINTR.into());
    }

    // futex(2): block only if the word still holds the expected value
    let current: u32 = ctx.process.memory().read_val(uaddr)?;
    if current != val {
        return Err(Errno::EAGAIN.into());
    }

    let mut condition = SyscallCondition::new(Trigger::Manual);
    if !timeout_ptr.is_null() {
        let timeout: libc::timespec = ctx.process.memory().read_val(timeout_ptr)?;
        let duration = simtime_from_timespec(timeout)?;
        condition.set_timeout(Some(Worker::current_time().unwrap() + duration));
    }

    let waiter = ctx
        .host
        .with_futex_table_mut(|table| table.wait(addr, condition.waker()));
    ctx.process.futex_waiter = Some((addr, waiter));

    Err(SyscallError::Blocked(Blocked {
        condition,
        restartable: true,
    }))
}

fn futex_wake(ctx: &mut SyscallContext, uaddr: ForeignPtr, count: u32) -> SyscallResult {
    let num_woken = ctx
        .host
        .with_futex_table_mut(|table| table.wake(uaddr.val(), count as usize));

    Ok(num_woken.into())
}
