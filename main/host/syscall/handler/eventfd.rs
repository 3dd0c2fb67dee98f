use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use nix::errno::Errno;

use crate::host::descriptor::eventfd::EventFd;
use crate::host::descriptor::{Descriptor, DescriptorFlags, File, FileStatus, OpenFile};
use crate::host::syscall::handler::SyscallContext;
use crate::host::syscall::types::SyscallResult;

pub fn eventfd(ctx: &mut SyscallContext) -> SyscallResult {
    eventfd_helper(ctx, 0)
}

pub fn eventfd2(ctx: &mut SyscallContext) -> SyscallResult {
    let flags = ctx.args.get(1).as_i32();
    eventfd_helper(ctx, flags)
}

fn eventfd_helper(ctx: &mut SyscallContext, flags: i32) -> SyscallResult {
    let init_value = ctx.args.get(0).as_u32() as u64;

    let mut status = FileStatus::empty();
    let mut desc_flags = DescriptorFlags::empty();
    let mut is_semaphore_mode = false;

    let mut remaining = flags;
    if remaining & libc::EFD_NONBLOCK != 0 {
        status.insert(FileStatus::NONBLOCK);
        remaining &= !libc::EFD_NONBLOCK;
    }
    if remaining & libc::EFD_CLOEXEC != 0 {
        desc_flags.insert(DescriptorFlags::CLOEXEC);
        remaining &= !libc::EFD_CLOEXEC;
    }
    if remaining & libc::EFD_SEMAPHORE != 0 {
        is_semaphore_mode = true;
        remaining &= !libc::EFD_SEMAPHORE;
    }
    if remaining != 0 {
        log::debug!("Invalid eventfd flags: {flags}");
        return Err(Errno::EINVAL.into());
    }

    let file = Arc::new(AtomicRefCell::new(EventFd::new(
        init_value,
        is_semaphore_mode,
        status,
    )));

    let mut desc = Descriptor::new(OpenFile::new(File::EventFd(file)));
    desc.set_flags(desc_flags);

    let fd = ctx.host.register_descriptor(desc);
    Ok(fd.into())
}
