//! The messages exchanged over a managed process's control block.

use crate::syscall_types::{SysCallArgs, SysCallReg};

/// Events sent from the shim (inside the managed process) to the engine.
#[derive(Copy, Clone, Debug)]
#[repr(C, u32)]
pub enum ShimEventToShadow {
    /// The shim finished initializing and the process is ready to run.
    Start,
    /// An intercepted syscall that needs a decision from the engine.
    Syscall(SysCallArgs),
    /// The process is gone. Normally synthesized by the engine when the
    /// channel's write end closes, but the shim also sends it explicitly on
    /// a clean `exit_group`.
    ProcessDeath,
}

/// Events sent from the engine to the shim.
#[derive(Copy, Clone, Debug)]
#[repr(C, u32)]
pub enum ShimEventToShim {
    /// Begin (or continue) native execution.
    Start,
    /// The emulated syscall finished with this raw return value (negative
    /// errno convention).
    SyscallComplete(SysCallReg),
    /// The engine decided the syscall is process-local; execute it natively.
    SyscallDoNative,
    /// Deliver this signal to the process before continuing.
    Signal(i32),
}
