//! Emulation of the timestamp-counter instructions. `rdtsc` and `rdtscp`
//! reach the hardware directly, so neither symbol overrides nor VDSO patches
//! can intercept them; instead the kernel is asked to fault them
//! (`PR_SET_TSC`) and a SIGSEGV handler computes the result from the shared
//! virtual clock.

use std::sync::atomic::{AtomicBool, Ordering};

use umbra_shim_helper::emulated_time::EmulatedTime;
use umbra_shim_helper::SHIM_ENV_SIDE_CHANNEL_MITIGATIONS;

/// The virtual CPU ticks at a fixed 1 GHz, so cycles equal nanoseconds and
/// applications that calibrate the TSC observe a stable frequency.
const CYCLES_PER_NANO: u64 = 1;

/// With mitigations enabled, counter reads only advance in steps this big,
/// denying managed code a fine-grained timing channel.
const MITIGATED_GRANULARITY_CYCLES: u64 = 1_000;

static COARSEN_READS: AtomicBool = AtomicBool::new(false);

const RDTSC: [u8; 2] = [0x0f, 0x31];
const RDTSCP: [u8; 3] = [0x0f, 0x01, 0xf9];

pub fn init() {
    if std::env::var_os(SHIM_ENV_SIDE_CHANNEL_MITIGATIONS).is_some_and(|v| v == "1") {
        COARSEN_READS.store(true, Ordering::Relaxed);
    }
    // make rdtsc/rdtscp raise SIGSEGV
    let rv = unsafe { libc::prctl(libc::PR_SET_TSC, libc::PR_TSC_SIGSEGV, 0, 0, 0) };
    if rv != 0 {
        // the application keeps the real TSC; only a fidelity loss
        eprintln!("umbra-shim: PR_SET_TSC failed; rdtsc is not emulated");
        return;
    }

    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = segv_handler as usize;
    action.sa_flags = libc::SA_SIGINFO;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
    }
}

fn emulated_cycles() -> u64 {
    let now = crate::sim_time().unwrap_or(EmulatedTime::SIMULATION_START);
    let cycles = now.duration_since(&EmulatedTime::UNIX_EPOCH).as_nanos() as u64 * CYCLES_PER_NANO;

    if COARSEN_READS.load(Ordering::Relaxed) {
        cycles - (cycles % MITIGATED_GRANULARITY_CYCLES)
    } else {
        cycles
    }
}

extern "C" fn segv_handler(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let context = context as *mut libc::ucontext_t;
    let gregs = unsafe { &mut (*context).uc_mcontext.gregs };

    let rip = gregs[libc::REG_RIP as usize] as *const u8;
    let insn = unsafe { std::slice::from_raw_parts(rip, RDTSCP.len()) };

    let insn_len: i64 = if insn[..2] == RDTSC {
        2
    } else if insn[..] == RDTSCP {
        3
    } else {
        // a genuine segfault: fall back to the default action so the
        // process dies (and the engine observes the death) normally
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
        }
        return;
    };

    let cycles = emulated_cycles();
    gregs[libc::REG_RAX as usize] = (cycles & 0xffff_ffff) as i64;
    gregs[libc::REG_RDX as usize] = (cycles >> 32) as i64;
    if insn_len == 3 {
        // rdtscp also reports the CPU; every virtual host has one CPU 0
        gregs[libc::REG_RCX as usize] = 0;
    }

    gregs[libc::REG_RIP as usize] += insn_len;
}
