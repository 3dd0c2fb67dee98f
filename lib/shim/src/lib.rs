//! The library preloaded into every managed process. It diverts the
//! process's syscalls to the engine over the shared-memory control block,
//! patches the VDSO time fast-paths, and emulates the timestamp-counter
//! instructions, so that the process can only observe the simulated world.

#![deny(unsafe_op_in_unsafe_fn)]

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::ipc::IPCData;
use umbra_shim_helper::shim_event::{ShimEventToShadow, ShimEventToShim};
use umbra_shim_helper::SHIM_ENV_IPC_BLK;
use umbra_shmem::allocator::{deserialize, ShMemBlockAlias, ShMemBlockSerialized};

pub mod preload;
pub mod syscall;
pub mod tsc;
pub mod vdso;

/// The control block shared with the engine. None when the process is not
/// running under the engine (the shim then stays inert).
static IPC: OnceLock<ShMemBlockAlias<IPCData>> = OnceLock::new();

/// Interception starts only after initialization finished.
static ENABLED: AtomicBool = AtomicBool::new(false);

std::thread_local! {
    /// While set, intercepted syscalls execute natively. Guards the shim's
    /// own internals (channel futexes, logging) against recursion.
    static ALLOW_NATIVE: Cell<bool> = const { Cell::new(false) };
}

/// Restores the previous allow-native state when dropped.
pub struct AllowNativeGuard {
    prev: bool,
}

impl AllowNativeGuard {
    pub fn new() -> Self {
        let prev = ALLOW_NATIVE.with(|x| x.replace(true));
        Self { prev }
    }
}

impl Default for AllowNativeGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AllowNativeGuard {
    fn drop(&mut self) {
        ALLOW_NATIVE.with(|x| x.set(self.prev));
    }
}

pub fn interception_active() -> bool {
    ENABLED.load(Ordering::Acquire) && !ALLOW_NATIVE.with(|x| x.get())
}

pub fn ipc() -> Option<&'static IPCData> {
    IPC.get().map(|block| &**block)
}

/// The current simulated time, as last published by the engine. The patched
/// VDSO entries and the rdtsc emulation read this without a control
/// transfer.
pub fn sim_time() -> Option<EmulatedTime> {
    ipc().map(|ipc| ipc.sim_time())
}

// Runs when the dynamic loader maps us, before the application's main.
#[used]
#[link_section = ".init_array"]
static SHIM_INIT: extern "C" fn() = shim_load;

extern "C" fn shim_load() {
    // interception stays off for everything we do in here
    let _guard = AllowNativeGuard::new();

    let Ok(serialized) = std::env::var(SHIM_ENV_IPC_BLK) else {
        // not launched by the engine; stay inert
        return;
    };
    let Ok(serialized) = serialized.parse::<ShMemBlockSerialized>() else {
        eprintln!("umbra-shim: bad {SHIM_ENV_IPC_BLK} value; running unmanaged");
        return;
    };
    let Ok(block) = (unsafe { deserialize::<IPCData>(&serialized) }) else {
        eprintln!("umbra-shim: failed to map the control block; running unmanaged");
        return;
    };
    if block.version() != umbra_shim_helper::ipc::IPC_VERSION {
        eprintln!(
            "umbra-shim: control block version {} doesn't match ours ({})",
            block.version(),
            umbra_shim_helper::ipc::IPC_VERSION,
        );
        std::process::abort();
    }
    if IPC.set(block).is_err() {
        return;
    }

    // the startup handshake: tell the engine we're alive, then wait for it
    // to let us run
    let ipc = ipc().unwrap();
    ipc.to_shadow().send(ShimEventToShadow::Start);
    match ipc.from_shadow().receive() {
        Ok(ShimEventToShim::Start) => (),
        other => {
            eprintln!("umbra-shim: unexpected startup response {other:?}");
            std::process::abort();
        }
    }

    // cover the kernel entry points the preload symbols can't: time
    // fast-paths through the VDSO, and the timestamp counter
    unsafe { vdso::patch_vdso() };
    tsc::init();

    ENABLED.store(true, Ordering::Release);
}

/// Send our death notice and exit without returning. Called from the
/// exit-syscall interception so the engine never waits on a dead process.
pub(crate) fn exit_with_code(code: i32) -> ! {
    let _guard = AllowNativeGuard::new();
    if let Some(ipc) = ipc() {
        ipc.to_shadow().send(ShimEventToShadow::ProcessDeath);
        ipc.to_shadow().close_writer();
    }
    std::process::exit(code);
}
