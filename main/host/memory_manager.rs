//! Access to a managed process's memory. The engine never dereferences a
//! managed pointer; reads and writes go through `process_vm_readv(2)` and
//! `process_vm_writev(2)` against the live process.

use std::io::{IoSlice, IoSliceMut};

use nix::errno::Errno;
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;
use umbra_shim_helper::syscall_types::ForeignPtr;

pub struct MemoryManager {
    pid: Pid,
}

impl MemoryManager {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    pub fn read_ptr(&self, ptr: ForeignPtr, buf: &mut [u8]) -> Result<(), Errno> {
        if buf.is_empty() {
            return Ok(());
        }
        if ptr.is_null() {
            return Err(Errno::EFAULT);
        }

        let len = buf.len();
        let mut local = [IoSliceMut::new(buf)];
        let remote = [RemoteIoVec {
            base: ptr.val() as usize,
            len,
        }];

        let num_read = process_vm_readv(self.pid, &mut local, &remote)?;
        if num_read != len {
            return Err(Errno::EFAULT);
        }
        Ok(())
    }

    pub fn write_ptr(&self, ptr: ForeignPtr, buf: &[u8]) -> Result<(), Errno> {
        if buf.is_empty() {
            return Ok(());
        }
        if ptr.is_null() {
            return Err(Errno::EFAULT);
        }

        let local = [IoSlice::new(buf)];
        let remote = [RemoteIoVec {
            base: ptr.val() as usize,
            len: buf.len(),
        }];

        let num_written = process_vm_writev(self.pid, &local, &remote)?;
        if num_written != buf.len() {
            return Err(Errno::EFAULT);
        }
        Ok(())
    }

    /// Read a plain-old-data value from managed memory. Unaligned managed
    /// pointers are legal, as they are for the kernel.
    pub fn read_val<T: Copy>(&self, ptr: ForeignPtr) -> Result<T, Errno> {
        let mut buf = vec![0u8; std::mem::size_of::<T>()];
        self.read_ptr(ptr, &mut buf)?;
        Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) })
    }

    /// Write a plain-old-data value into managed memory.
    pub fn write_val<T: Copy>(&self, ptr: ForeignPtr, val: &T) -> Result<(), Errno> {
        let buf = unsafe {
            std::slice::from_raw_parts(val as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.write_ptr(ptr, buf)
    }
}
