//! The engine side of a managed process's control block. All waiting here is
//! real (the worker blocks on the channel), but only ever for the managed
//! process itself to produce its next request; virtual time does not advance
//! while a control transfer is in flight.

use nix::unistd::Pid;
use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::ipc::IPCData;
use umbra_shim_helper::scchannel::SelfContainedChannelError;
use umbra_shim_helper::shim_event::{ShimEventToShadow, ShimEventToShim};
use umbra_shim_helper::syscall_types::SysCallReg;
use umbra_shmem::allocator::{ShMemBlock, ShMemBlockSerialized};

pub struct ManagedThread {
    ipc_block: ShMemBlock<IPCData>,
    native_pid: Pid,
}

impl ManagedThread {
    pub fn new(ipc_block: ShMemBlock<IPCData>, native_pid: Pid) -> Self {
        Self {
            ipc_block,
            native_pid,
        }
    }

    pub fn native_pid(&self) -> Pid {
        self.native_pid
    }

    pub fn serialize_ipc(&self) -> ShMemBlockSerialized {
        self.ipc_block.serialize()
    }

    /// Let the process begin (or continue) native execution.
    pub fn send_start(&self, now: EmulatedTime) {
        self.ipc_block.set_sim_time(now);
        self.ipc_block.to_plugin().send(ShimEventToShim::Start);
    }

    /// Complete the process's pending syscall with the raw return value
    /// (negative errno convention) and resume it.
    pub fn send_syscall_complete(&self, now: EmulatedTime, retval: SysCallReg) {
        self.ipc_block.set_sim_time(now);
        self.ipc_block
            .to_plugin()
            .send(ShimEventToShim::SyscallComplete(retval));
    }

    /// Tell the process to execute its pending syscall natively.
    pub fn send_do_native(&self, now: EmulatedTime) {
        self.ipc_block.set_sim_time(now);
        self.ipc_block.to_plugin().send(ShimEventToShim::SyscallDoNative);
    }

    /// Inject a signal to be delivered before the process continues.
    pub fn send_signal(&self, now: EmulatedTime, signo: i32) {
        self.ipc_block.set_sim_time(now);
        self.ipc_block
            .to_plugin()
            .send(ShimEventToShim::Signal(signo));
    }

    /// Block until the process produces its next event. A closed channel
    /// (the process died) is surfaced as `ProcessDeath`.
    pub fn recv(&self) -> ShimEventToShadow {
        match self.ipc_block.from_plugin().receive() {
            Ok(event) => event,
            Err(SelfContainedChannelError::WriterIsClosed) => ShimEventToShadow::ProcessDeath,
        }
    }
}

#[cfg(test)]
mod tests {
    use umbra_shmem::allocator::shmalloc;

    use super::*;

    #[test]
    fn test_closed_channel_reads_as_process_death() {
        let block = shmalloc(IPCData::new());
        let mthread = ManagedThread::new(block, Pid::from_raw(1));

        // the process died without a clean goodbye (e.g. a crash); the
        // watcher closes the channel and we observe a death event
        mthread.ipc_block.from_plugin().close_writer();
        assert!(matches!(mthread.recv(), ShimEventToShadow::ProcessDeath));
    }

    #[test]
    fn test_syscall_round_trip() {
        use umbra_shim_helper::emulated_time::EmulatedTime;
        use umbra_shim_helper::shim_event::ShimEventToShim;
        use umbra_shim_helper::syscall_types::{SysCallArgs, SysCallReg};

        let block = shmalloc(IPCData::new());
        let mthread = ManagedThread::new(block, Pid::from_raw(1));

        // the "shim" side of the conversation
        let args = SysCallArgs {
            number: libc::SYS_getpid,
            args: [SysCallReg::from(0u64); 6],
        };
        mthread
            .ipc_block
            .to_shadow()
            .send(ShimEventToShadow::Syscall(args));

        match mthread.recv() {
            ShimEventToShadow::Syscall(args) => assert_eq!(args.number, libc::SYS_getpid),
            event => panic!("Unexpected event {event:?}"),
        }

        mthread.send_syscall_complete(EmulatedTime::SIMULATION_START, SysCallReg::from(1000i64));
        match mthread.ipc_block.from_shadow().receive() {
            Ok(ShimEventToShim::SyscallComplete(retval)) => assert_eq!(retval.as_i64(), 1000),
            event => panic!("Unexpected event {event:?}"),
        }
    }
}
