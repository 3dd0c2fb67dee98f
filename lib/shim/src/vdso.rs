//! Hot-patching of the VDSO. Programs (and libc itself) reach the kernel's
//! time fast-paths through the VDSO without a syscall instruction, so the
//! preload overrides alone can't cover them: each exported time entry is
//! overwritten with a trampoline into the shim.

use libc::{c_char, c_void};

// ELF constants we need; values per the ELF64 spec.
const PT_DYNAMIC: u32 = 2;
const DT_NULL: i64 = 0;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;

// The dynamic entry's value union collapses to one word either way.
#[repr(C)]
struct Elf64Dyn {
    d_tag: i64,
    d_val: u64,
}

/// movabs rax, imm64; jmp rax
const TRAMPOLINE_NBYTES: usize = 12;

fn write_trampoline(entry: *mut u8, target: u64) {
    let mut code = [0u8; TRAMPOLINE_NBYTES];
    code[0] = 0x48;
    code[1] = 0xb8;
    code[2..10].copy_from_slice(&target.to_le_bytes());
    code[10] = 0xff;
    code[11] = 0xe0;
    unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), entry, TRAMPOLINE_NBYTES) };
}

/// The page-aligned range covering `[addr, addr + len)`.
fn page_span(addr: usize, len: usize) -> (usize, usize) {
    let page = 4096;
    let start = addr & !(page - 1);
    let end = (addr + len + page - 1) & !(page - 1);
    (start, end - start)
}

/// Patch the VDSO's exported time entries to jump into the shim.
///
/// # Safety
///
/// Rewrites executable memory; must run before other threads exist, which
/// holds during shim initialization.
pub unsafe fn patch_vdso() {
    let base = unsafe { libc::getauxval(libc::AT_SYSINFO_EHDR) } as usize;
    if base == 0 {
        return;
    }

    // the dynamic symbol table, via the program headers
    let ehdr = unsafe { &*(base as *const libc::Elf64_Ehdr) };
    let phdrs = (base + ehdr.e_phoff as usize) as *const libc::Elf64_Phdr;

    let mut dynamic: Option<usize> = None;
    for i in 0..ehdr.e_phnum as usize {
        let phdr = unsafe { &*phdrs.add(i) };
        if phdr.p_type == PT_DYNAMIC {
            dynamic = Some(base + phdr.p_vaddr as usize);
        }
    }
    let Some(dynamic) = dynamic else {
        return;
    };

    // vdso dynamic entries hold unrelocated (base-relative) addresses
    let adjust = |val: u64| -> usize {
        let val = val as usize;
        if val < base {
            base + val
        } else {
            val
        }
    };

    let mut symtab: Option<*const libc::Elf64_Sym> = None;
    let mut strtab: Option<*const c_char> = None;
    let mut hash: Option<*const u32> = None;

    let mut dyn_entry = dynamic as *const Elf64Dyn;
    loop {
        let entry = unsafe { &*dyn_entry };
        match entry.d_tag {
            DT_NULL => break,
            DT_SYMTAB => symtab = Some(adjust(entry.d_val) as *const _),
            DT_STRTAB => strtab = Some(adjust(entry.d_val) as *const _),
            DT_HASH => hash = Some(adjust(entry.d_val) as *const _),
            _ => (),
        }
        dyn_entry = unsafe { dyn_entry.add(1) };
    }
    let (Some(symtab), Some(strtab), Some(hash)) = (symtab, strtab, hash) else {
        return;
    };

    // DT_HASH layout: nbucket, nchain, ...; nchain equals the symbol count
    let num_symbols = unsafe { *hash.add(1) } as usize;

    for i in 0..num_symbols {
        let sym = unsafe { &*symtab.add(i) };
        if sym.st_name == 0 || sym.st_value == 0 {
            continue;
        }
        let name = unsafe { std::ffi::CStr::from_ptr(strtab.add(sym.st_name as usize)) };
        let Ok(name) = name.to_str() else {
            continue;
        };

        let target: u64 = match name {
            "__vdso_clock_gettime" | "clock_gettime" => {
                crate::preload::clock_gettime as usize as u64
            }
            "__vdso_gettimeofday" | "gettimeofday" => {
                crate::preload::gettimeofday as usize as u64
            }
            "__vdso_time" | "time" => crate::preload::time as usize as u64,
            "__vdso_getcpu" | "getcpu" => crate::preload::umbra_shim_getcpu as usize as u64,
            _ => continue,
        };

        let entry = base + sym.st_value as usize;
        let (page_start, page_len) = page_span(entry, TRAMPOLINE_NBYTES);

        let rv = unsafe {
            libc::mprotect(
                page_start as *mut c_void,
                page_len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        };
        if rv != 0 {
            // some hardened kernels forbid this; the preload overrides still
            // catch direct libc calls
            return;
        }

        write_trampoline(entry as *mut u8, target);

        unsafe {
            libc::mprotect(
                page_start as *mut c_void,
                page_len,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
    }
}
