//! The per-process control block shared between the engine and the shim.

use std::sync::atomic::Ordering;

use crate::emulated_time::{AtomicEmulatedTime, EmulatedTime};
use crate::scchannel::SelfContainedChannel;
use crate::shim_event::{ShimEventToShadow, ShimEventToShim};

/// Bumped whenever the control-block layout changes. The shim refuses a
/// block from a mismatched engine rather than misinterpreting it.
pub const IPC_VERSION: u32 = 1;

/// One of these lives in shared memory for every managed process. The two
/// channels implement the request/response slots with their event-counter
/// semaphores; `sim_time` lets the shim answer time fast-paths (patched
/// VDSO entries, emulated rdtsc) without a round trip.
#[repr(C)]
pub struct IPCData {
    version: u32,
    shadow_to_plugin: SelfContainedChannel<ShimEventToShim>,
    plugin_to_shadow: SelfContainedChannel<ShimEventToShadow>,
    sim_time: AtomicEmulatedTime,
}

impl IPCData {
    pub fn new() -> Self {
        Self {
            version: IPC_VERSION,
            shadow_to_plugin: SelfContainedChannel::new(),
            plugin_to_shadow: SelfContainedChannel::new(),
            sim_time: AtomicEmulatedTime::new(EmulatedTime::SIMULATION_START),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn to_plugin(&self) -> &SelfContainedChannel<ShimEventToShim> {
        &self.shadow_to_plugin
    }

    pub fn to_shadow(&self) -> &SelfContainedChannel<ShimEventToShadow> {
        &self.plugin_to_shadow
    }

    pub fn from_plugin(&self) -> &SelfContainedChannel<ShimEventToShadow> {
        &self.plugin_to_shadow
    }

    pub fn from_shadow(&self) -> &SelfContainedChannel<ShimEventToShim> {
        &self.shadow_to_plugin
    }

    /// The current simulated time, as last published by the engine.
    pub fn sim_time(&self) -> EmulatedTime {
        self.sim_time.load(Ordering::Acquire)
    }

    /// Publish the current simulated time. Called by the engine before every
    /// control transfer into the process.
    pub fn set_sim_time(&self, t: EmulatedTime) {
        self.sim_time.store(t, Ordering::Release)
    }
}

impl Default for IPCData {
    fn default() -> Self {
        Self::new()
    }
}
