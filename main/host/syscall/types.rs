//! Types used in emulating syscalls.

use nix::errno::Errno;
use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::syscall_types::SysCallReg;

use crate::host::descriptor::{File, FileState};
use crate::host::syscall::condition::SyscallCondition;

// Calling all of these errors is stretching the semantics of 'error' a bit,
// but it makes for fluent programming in syscall handlers using the `?` operator.
#[derive(Debug)]
pub enum SyscallError {
    Failed(Failed),
    Blocked(Blocked),
    Native,
}

#[derive(Debug)]
pub struct Failed {
    pub errno: Errno,
    pub restartable: bool,
}

#[derive(Debug)]
pub struct Blocked {
    pub condition: SyscallCondition,
    pub restartable: bool,
}

pub type SyscallResult = Result<SysCallReg, SyscallError>;

impl From<Errno> for SyscallError {
    fn from(e: Errno) -> Self {
        SyscallError::Failed(Failed {
            errno: e,
            restartable: false,
        })
    }
}

impl From<std::io::Error> for SyscallError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(e) => SyscallError::Failed(Failed {
                errno: Errno::from_i32(e),
                restartable: false,
            }),
            None => {
                let default = Errno::ENOTSUP;
                log::warn!("Mapping error {} to {}", e, default);
                SyscallError::from(default)
            }
        }
    }
}

impl SyscallError {
    pub fn new_blocked_on_file(file: File, state: FileState, restartable: bool) -> Self {
        Self::Blocked(Blocked {
            condition: SyscallCondition::new_from_file(file, state),
            restartable,
        })
    }

    pub fn new_blocked_until(unblock_time: EmulatedTime, restartable: bool) -> Self {
        Self::Blocked(Blocked {
            condition: SyscallCondition::new_from_wakeup_time(unblock_time),
            restartable,
        })
    }

    /// Returns the [condition](SyscallCondition) that the syscall is blocked on.
    pub fn blocked_condition(&mut self) -> Option<&mut SyscallCondition> {
        if let Self::Blocked(Blocked { condition, .. }) = self {
            Some(condition)
        } else {
            None
        }
    }

    /// The errno of a failed syscall, if this is a failure.
    pub fn errno(&self) -> Option<Errno> {
        if let Self::Failed(Failed { errno, .. }) = self {
            Some(*errno)
        } else {
            None
        }
    }
}

/// Convert a descriptor-level result into the raw register value returned to
/// the managed process (negative errno convention). Blocked and Native
/// results have no register representation and must be handled first.
pub fn result_to_retval(result: &SyscallResult) -> Option<i64> {
    match result {
        Ok(reg) => Some(reg.as_i64()),
        Err(SyscallError::Failed(failed)) => Some(-(failed.errno as i64)),
        Err(SyscallError::Blocked(_)) | Err(SyscallError::Native) => None,
    }
}
