//! Representations of syscall arguments and return values as they travel
//! between a managed process and the engine.

use bytemuck::{Pod, Zeroable};

/// A register-sized syscall argument or return value. Stored as raw bits;
/// the conversion impls reinterpret rather than convert, matching the
/// kernel's calling convention.
#[derive(Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct SysCallReg(u64);

impl SysCallReg {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }

    pub fn as_i32(self) -> i32 {
        self.0 as i32
    }
}

impl std::fmt::Debug for SysCallReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SysCallReg({:#x})", self.0)
    }
}

impl From<u64> for SysCallReg {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl From<i64> for SysCallReg {
    fn from(val: i64) -> Self {
        Self(val as u64)
    }
}

impl From<usize> for SysCallReg {
    fn from(val: usize) -> Self {
        Self(val as u64)
    }
}

impl From<u32> for SysCallReg {
    fn from(val: u32) -> Self {
        Self(val as u64)
    }
}

impl From<i32> for SysCallReg {
    fn from(val: i32) -> Self {
        // sign-extend, as the kernel does for 32-bit values in registers
        Self(val as i64 as u64)
    }
}

impl From<SysCallReg> for u64 {
    fn from(val: SysCallReg) -> Self {
        val.0
    }
}

impl From<SysCallReg> for i64 {
    fn from(val: SysCallReg) -> Self {
        val.0 as i64
    }
}

impl From<SysCallReg> for usize {
    fn from(val: SysCallReg) -> Self {
        val.0 as usize
    }
}

/// A pointer into a managed process's address space. Never dereferenceable
/// by the engine directly; all access goes through the process's memory
/// manager.
#[derive(Copy, Clone, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct ForeignPtr(u64);

impl ForeignPtr {
    pub fn null() -> Self {
        Self(0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn val(&self) -> u64 {
        self.0
    }

    /// The pointer `count` bytes past this one.
    pub fn add(&self, count: usize) -> Self {
        Self(self.0.checked_add(count as u64).unwrap())
    }
}

impl std::fmt::Debug for ForeignPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForeignPtr({:#x})", self.0)
    }
}

impl From<u64> for ForeignPtr {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl From<SysCallReg> for ForeignPtr {
    fn from(val: SysCallReg) -> Self {
        Self(val.as_u64())
    }
}

impl From<ForeignPtr> for SysCallReg {
    fn from(val: ForeignPtr) -> Self {
        SysCallReg::from(val.0)
    }
}

/// A syscall intercepted by the shim: the raw syscall number plus its six
/// argument registers, packed into a fixed-width array so variadic wrappers
/// all marshal the same way.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct SysCallArgs {
    pub number: i64,
    pub args: [SysCallReg; 6],
}

static_assertions::assert_eq_size!(SysCallArgs, [u64; 7]);

impl SysCallArgs {
    pub fn get(&self, i: usize) -> SysCallReg {
        self.args[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_sign_extension() {
        let reg = SysCallReg::from(-1i32);
        assert_eq!(reg.as_i64(), -1);
        assert_eq!(reg.as_i32(), -1);

        let reg = SysCallReg::from(u32::MAX);
        assert_eq!(reg.as_u64(), u32::MAX as u64);
    }

    #[test]
    fn test_foreign_ptr() {
        let ptr = ForeignPtr::from(0x7fff_0000u64);
        assert!(!ptr.is_null());
        assert_eq!(ptr.add(16).val(), 0x7fff_0010);
        assert!(ForeignPtr::null().is_null());
    }

    #[test]
    fn test_args_round_trip() {
        let args = SysCallArgs {
            number: libc::SYS_read,
            args: [
                SysCallReg::from(3u64),
                SysCallReg::from(0x1000u64),
                SysCallReg::from(128u64),
                SysCallReg::from(0u64),
                SysCallReg::from(0u64),
                SysCallReg::from(0u64),
            ],
        };
        let bytes = bytemuck::bytes_of(&args);
        let back: SysCallArgs = *bytemuck::from_bytes(bytes);
        assert_eq!(back.number, libc::SYS_read);
        assert_eq!(back.get(2).as_usize(), 128);
    }
}
