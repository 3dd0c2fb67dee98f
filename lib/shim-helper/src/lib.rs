//! Types shared between the umbra simulation engine and the shim library that
//! gets preloaded into every managed process. Everything in this crate that
//! crosses the shared-memory boundary must be valid in any address space:
//! plain old data, atomics, and futex words, but never pointers.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod emulated_time;
pub mod ipc;
pub mod scchannel;
pub mod shim_event;
pub mod simulation_time;
pub mod syscall_types;

use bytemuck::{Pod, Zeroable};

/// Stable identifier of a virtual host. Keys every cross-component lookup.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct HostId(u32);

impl HostId {
    pub fn to_raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for HostId {
    fn from(val: u32) -> Self {
        HostId(val)
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Environment variable holding the serialized shared-memory block with the
/// process's [`ipc::IPCData`].
pub const SHIM_ENV_IPC_BLK: &str = "UMBRA_SHM_BLK";

/// Environment variable selecting the shim's stderr log level.
pub const SHIM_ENV_LOG_LEVEL: &str = "UMBRA_SHIM_LOG_LEVEL";

/// Environment variable overriding the path of the shim library itself.
pub const SHIM_ENV_LIB_PATH: &str = "UMBRA_SHIM_PATH";

/// Environment variable enabling side-channel mitigations in the shim (set
/// to "1"): emulated timestamp-counter reads are coarsened so managed code
/// can't build a fine-grained timing channel out of them.
pub const SHIM_ENV_SIDE_CHANNEL_MITIGATIONS: &str = "UMBRA_MITIGATE_SIDE_CHANNELS";
