//! A managed process: a real OS process running application code under the
//! shim, plus the engine-side state that arbitrates its syscalls.

use std::sync::Arc;

use anyhow::Context;
use nix::unistd::Pid;
use umbra_shim_helper::ipc::IPCData;
use umbra_shim_helper::shim_event::ShimEventToShadow;
use umbra_shim_helper::syscall_types::SysCallArgs;
use umbra_shim_helper::{HostId, SHIM_ENV_IPC_BLK, SHIM_ENV_LOG_LEVEL};
use umbra_shmem::allocator::{shmalloc, ShMemBlockSerialized};

use crate::core::preload;
use crate::core::work::task::TaskRef;
use crate::core::worker::Worker;
use crate::host::futex_table::FutexWaiter;
use crate::host::host::{Application, Host};
use crate::host::managed_thread::ManagedThread;
use crate::host::memory_manager::MemoryManager;
use crate::host::syscall::condition::SyscallCondition;
use crate::host::syscall::handler;
use crate::host::syscall::types::{result_to_retval, SyscallError};
use crate::utility::callback_queue::CallbackQueue;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(u32);

impl From<u32> for ProcessId {
    fn from(val: u32) -> Self {
        ProcessId(val)
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A syscall whose continuation is parked on a condition. Holding the
/// condition keeps its listeners and timers alive; dropping it cancels them.
struct BlockedSyscall {
    args: SysCallArgs,
    #[allow(unused)]
    condition: SyscallCondition,
}

pub struct Process {
    id: ProcessId,
    host_id: HostId,
    name: String,
    child: Option<std::process::Child>,
    /// Joined before the IPC block is freed, so the watcher's channel-close
    /// can never land in recycled memory.
    watcher: Option<std::thread::JoinHandle<()>>,
    mthread: Option<ManagedThread>,
    memory: Option<MemoryManager>,
    blocked: Option<BlockedSyscall>,
    /// A pending `futex(FUTEX_WAIT)` registration, consumed when the syscall
    /// is re-run.
    pub(crate) futex_waiter: Option<(u64, Arc<FutexWaiter>)>,
    /// Whether the shim has completed its startup handshake.
    launched: bool,
    exit_status: Option<i32>,
}

impl Process {
    /// Fork the native process under the shim. The process blocks in shim
    /// initialization until its first `resume`.
    pub fn spawn(host: &Host, id: ProcessId, application: &Application) -> anyhow::Result<Self> {
        let ipc_block = shmalloc(IPCData::new());
        let serialized = ipc_block.serialize();

        let shim_path = preload::shim_library_path()?;

        let child = std::process::Command::new(&application.path)
            .args(&application.args)
            .envs(&application.environment)
            .env("LD_PRELOAD", &shim_path)
            .env(SHIM_ENV_IPC_BLK, serialized.to_string())
            .env(SHIM_ENV_LOG_LEVEL, log::max_level().to_string())
            .stdin(std::process::Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to execute {:?}", application.path))?;

        let native_pid = Pid::from_raw(child.id() as i32);

        // The watcher closes the channel's write end when the native process
        // dies for any reason (including a crash), so the engine never waits
        // forever on a dead process.
        let watcher = std::thread::spawn({
            let serialized = serialized.clone();
            move || watch_child(native_pid, serialized)
        });

        let name = application
            .path
            .file_name()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_else(|| "process".to_string());

        Ok(Self {
            id,
            host_id: host.id(),
            name,
            child: Some(child),
            watcher: Some(watcher),
            mthread: Some(ManagedThread::new(ipc_block, native_pid)),
            memory: Some(MemoryManager::new(native_pid)),
            blocked: None,
            futex_waiter: None,
            launched: false,
            exit_status: None,
        })
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pid this process observes, stable across runs (unlike its native
    /// pid).
    pub fn virtual_pid(&self) -> i32 {
        1000 + self.id.0 as i32
    }

    pub fn native_pid(&self) -> Option<Pid> {
        self.mthread.as_ref().map(|t| t.native_pid())
    }

    pub fn memory(&self) -> &MemoryManager {
        self.memory.as_ref().unwrap()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status.is_some()
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Run the process until it blocks on a condition, issues its next
    /// blocking control transfer, exits, or dies.
    pub fn resume(&mut self, host: &Host) {
        assert_eq!(self.host_id, host.id());

        // A parked syscall is re-run first: the shim is still waiting for
        // its response. Dropping the old condition cancels its listeners.
        if let Some(blocked) = self.blocked.take() {
            let args = blocked.args;
            drop(blocked);
            if !self.run_syscall(host, args, true) {
                return;
            }
        } else if !self.launched {
            match self.mthread.as_ref().unwrap().recv() {
                ShimEventToShadow::Start => {
                    self.launched = true;
                    let now = Worker::current_time().unwrap();
                    self.mthread.as_ref().unwrap().send_start(now);
                }
                ShimEventToShadow::ProcessDeath => {
                    self.handle_death(host);
                    return;
                }
                event => panic!("Unexpected first event from shim: {event:?}"),
            }
        }

        loop {
            let event = self.mthread.as_ref().unwrap().recv();
            match event {
                ShimEventToShadow::Syscall(args) => {
                    if !self.run_syscall(host, args, false) {
                        return;
                    }
                }
                ShimEventToShadow::ProcessDeath => {
                    self.handle_death(host);
                    return;
                }
                ShimEventToShadow::Start => {
                    panic!("Unexpected Start event from running process {}", self.id)
                }
            }
        }
    }

    /// Dispatch one syscall and respond to the shim. Returns false if the
    /// syscall blocked (the shim stays suspended and the worker must yield).
    fn run_syscall(&mut self, host: &Host, args: SysCallArgs, rerun: bool) -> bool {
        let result = CallbackQueue::queue_and_run(|cb_queue| {
            handler::dispatch(host, self, &args, rerun, cb_queue)
        });

        let now = Worker::current_time().unwrap();
        let mthread = self.mthread.as_ref().unwrap();

        if let Some(retval) = result_to_retval(&result) {
            log::trace!(
                "Process {}: syscall {} -> {}",
                self.name,
                args.number,
                retval
            );
            mthread.send_syscall_complete(now, retval.into());
            return true;
        }

        match result {
            Err(SyscallError::Native) => {
                log::trace!("Process {}: syscall {} -> native", self.name, args.number);
                mthread.send_do_native(now);
                true
            }
            Err(SyscallError::Blocked(mut blocked)) => {
                log::trace!("Process {}: syscall {} blocked", self.name, args.number);
                let pid = self.id;
                let resume = TaskRef::new(move |host: &Host| host.resume_process(pid));
                blocked.condition.arm(host, resume);
                self.blocked = Some(BlockedSyscall {
                    args,
                    condition: blocked.condition,
                });
                false
            }
            _ => unreachable!(),
        }
    }

    /// The native process is gone: reap it, record the exit, and release the
    /// control block.
    fn handle_death(&mut self, host: &Host) {
        // the child is dead, so the watcher exits promptly
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }

        let mut exit_status = 0;
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) => {
                    exit_status = status.code().unwrap_or(-1);
                    if status.success() {
                        log::debug!("Process {} exited cleanly", self.name);
                    } else {
                        log::warn!("Process {} exited with {status}", self.name);
                        Worker::increment_process_error_count();
                    }
                }
                Err(e) => log::warn!("Failed to reap process {}: {e}", self.name),
            }
        }
        self.exit_status = Some(exit_status);

        // drop any parked continuation and futex registration
        self.blocked = None;
        if let Some((addr, waiter)) = self.futex_waiter.take() {
            host.with_futex_table_mut(|table| table.cancel(addr, &waiter));
        }

        self.mthread = None;
        self.memory = None;
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // still running at simulation end: kill and reap
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
        // `mthread` (and with it the IPC block) drops after the watcher is
        // gone
    }
}

/// Wait for the native process to die, then close the write end of its
/// request channel so the engine observes `ProcessDeath`. The alias mapping
/// is created eagerly so this works even after the engine's own references
/// are gone.
fn watch_child(pid: Pid, serialized: ShMemBlockSerialized) {
    let Ok(ipc) = (unsafe { umbra_shmem::allocator::deserialize::<IPCData>(&serialized) }) else {
        return;
    };

    let pidfd =
        unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0u32) } as libc::c_int;
    if pidfd < 0 {
        log::warn!("pidfd_open failed for pid {pid}; crash detection disabled");
        return;
    }

    let mut poll_fd = libc::pollfd {
        fd: pidfd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let rv = unsafe { libc::poll(&mut poll_fd, 1, -1) };
        if rv >= 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            break;
        }
    }
    unsafe { libc::close(pidfd) };

    ipc.from_plugin().close_writer();
}
