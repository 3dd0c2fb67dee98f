//! Block allocation inside shared-memory region files.
//!
//! Allocation is a bump pointer per region with per-size free lists for
//! recycled blocks. The allocator's bookkeeping lives in engine memory;
//! only the block payloads live in the shared mapping, so a foreign process
//! can alias a block without trusting any allocator state.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::{shmem_dir, SHMEM_FILE_PREFIX};

pub const PAGE_NBYTES: usize = 4096;

/// Regions are created in multiples of this; big enough that one region
/// covers all control blocks of a typical simulation.
const CHUNK_NBYTES: usize = 2 * 1024 * 1024;

/// The smallest block we hand out. Avoids false sharing between blocks
/// owned by different processes.
const MIN_BLOCK_NBYTES: usize = 64;

static FILE_NONCE: AtomicU64 = AtomicU64::new(0);

static ALLOCATOR: Lazy<Mutex<SharedMemAllocator>> =
    Lazy::new(|| Mutex::new(SharedMemAllocator::new()));

/// Round `requested` up to the next page-aligned power of two. Region files
/// are always created with a good size.
pub fn good_size(requested: usize) -> usize {
    std::cmp::max(PAGE_NBYTES, requested.next_power_of_two())
}

fn block_size(requested: usize) -> usize {
    std::cmp::max(MIN_BLOCK_NBYTES, requested.next_power_of_two())
}

fn align_up(val: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (val + align - 1) & !(align - 1)
}

/// An mmapped region file.
struct ShMemFile {
    path: PathBuf,
    base: *mut u8,
    nbytes: usize,
    /// Whether we created the file (and should unlink it when dropped).
    owned: bool,
}

// The mapping itself has no thread affinity.
unsafe impl Send for ShMemFile {}
unsafe impl Sync for ShMemFile {}

impl ShMemFile {
    fn create(nbytes: usize) -> std::io::Result<Self> {
        assert_eq!(nbytes % PAGE_NBYTES, 0);

        let name = format!(
            "{}-{}-{}",
            SHMEM_FILE_PREFIX,
            std::process::id(),
            FILE_NONCE.fetch_add(1, Ordering::Relaxed),
        );
        let path = shmem_dir().join(name);

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(nbytes as u64)?;

        let base = Self::map_fd(&file, nbytes)?;

        Ok(Self {
            path,
            base,
            nbytes,
            owned: true,
        })
    }

    fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let nbytes = file.metadata()?.len() as usize;

        let base = Self::map_fd(&file, nbytes)?;

        Ok(Self {
            path: path.to_path_buf(),
            base,
            nbytes,
            owned: false,
        })
    }

    fn map_fd(file: &std::fs::File, nbytes: usize) -> std::io::Result<*mut u8> {
        use std::os::fd::AsRawFd;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                nbytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(base as *mut u8)
    }
}

impl Drop for ShMemFile {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.nbytes) };
        if self.owned {
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("Failed to unlink shmem file {:?}: {}", self.path, e);
            }
        }
    }
}

struct Chunk {
    file: ShMemFile,
    bump: usize,
}

struct SharedMemAllocator {
    chunks: Vec<Chunk>,
    /// Recycled blocks per size class: (chunk index, offset).
    free_lists: HashMap<usize, Vec<(usize, usize)>>,
}

impl SharedMemAllocator {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            free_lists: HashMap::new(),
        }
    }

    fn alloc_block(&mut self, nbytes: usize, align: usize) -> (usize, usize, usize) {
        let size = block_size(std::cmp::max(nbytes, align));

        if let Some(list) = self.free_lists.get_mut(&size) {
            if let Some((chunk_idx, offset)) = list.pop() {
                return (chunk_idx, offset, size);
            }
        }

        // blocks are aligned to their own (power of two) size, capped at a page
        let block_align = std::cmp::min(size, PAGE_NBYTES);

        if let Some((idx, chunk)) = self.chunks.iter_mut().enumerate().next_back() {
            let offset = align_up(chunk.bump, block_align);
            if offset + size <= chunk.file.nbytes {
                chunk.bump = offset + size;
                return (idx, offset, size);
            }
        }

        let chunk_nbytes = std::cmp::max(CHUNK_NBYTES, good_size(size));
        let file = ShMemFile::create(chunk_nbytes).expect("Failed to create shmem region");
        self.chunks.push(Chunk { file, bump: size });
        (self.chunks.len() - 1, 0, size)
    }

    fn dealloc_block(&mut self, chunk_idx: usize, offset: usize, size: usize) {
        self.free_lists
            .entry(size)
            .or_default()
            .push((chunk_idx, offset));
    }

    fn block_ptr(&self, chunk_idx: usize, offset: usize) -> *mut u8 {
        let chunk = &self.chunks[chunk_idx];
        assert!(offset < chunk.file.nbytes);
        unsafe { chunk.file.base.add(offset) }
    }

    fn block_path(&self, chunk_idx: usize) -> PathBuf {
        self.chunks[chunk_idx].file.path.clone()
    }
}

/// Unmap and unlink every region. Call once at clean engine shutdown, after
/// all blocks have been dropped; leaked regions from unclean exits are
/// reclaimed by the startup cleanup pass instead.
pub fn release_all_regions() {
    let mut allocator = ALLOCATOR.lock().unwrap();
    allocator.chunks.clear();
    allocator.free_lists.clear();
}

/// Move `val` into a shared-memory block.
///
/// `T` must be meaningful in any address space: no pointers or references,
/// directly or transitively.
pub fn shmalloc<T: Sync>(val: T) -> ShMemBlock<T> {
    let mut allocator = ALLOCATOR.lock().unwrap();
    let (chunk_idx, offset, size) =
        allocator.alloc_block(std::mem::size_of::<T>(), std::mem::align_of::<T>());
    let ptr = allocator.block_ptr(chunk_idx, offset) as *mut T;
    assert_eq!(ptr as usize % std::mem::align_of::<T>(), 0);
    unsafe { ptr.write(val) };

    ShMemBlock {
        ptr,
        chunk_idx,
        offset,
        size,
        _phantom: PhantomData,
    }
}

/// An owned allocation in shared memory. Freed (and the value dropped) when
/// this is dropped; foreign mappings of the same block must be gone by then.
pub struct ShMemBlock<T: Sync> {
    ptr: *mut T,
    chunk_idx: usize,
    offset: usize,
    size: usize,
    _phantom: PhantomData<T>,
}

unsafe impl<T: Sync> Sync for ShMemBlock<T> {}
unsafe impl<T: Send + Sync> Send for ShMemBlock<T> {}

impl<T: Sync> ShMemBlock<T> {
    pub fn serialize(&self) -> ShMemBlockSerialized {
        let allocator = ALLOCATOR.lock().unwrap();
        ShMemBlockSerialized {
            path: allocator.block_path(self.chunk_idx),
            offset: self.offset,
        }
    }
}

impl<T: Sync> std::ops::Deref for ShMemBlock<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.ptr }
    }
}

impl<T: Sync> Drop for ShMemBlock<T> {
    fn drop(&mut self) {
        unsafe { self.ptr.drop_in_place() };
        let mut allocator = ALLOCATOR.lock().unwrap();
        allocator.dealloc_block(self.chunk_idx, self.offset, self.size);
    }
}

/// A serialized reference to a [`ShMemBlock`], suitable for handing to a
/// foreign process through an environment variable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShMemBlockSerialized {
    path: PathBuf,
    offset: usize,
}

impl std::fmt::Display for ShMemBlockSerialized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{};{}", self.offset, self.path.display())
    }
}

impl std::str::FromStr for ShMemBlockSerialized {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (offset, path) = s
            .split_once(';')
            .ok_or_else(|| format!("Bad serialized shmem block: {s}"))?;
        let offset = offset
            .parse()
            .map_err(|e| format!("Bad shmem block offset: {e}"))?;
        Ok(Self {
            path: PathBuf::from(path),
            offset,
        })
    }
}

/// A foreign process's view of a [`ShMemBlock`]. The mapping stays alive
/// for as long as this does.
pub struct ShMemBlockAlias<T: Sync> {
    // kept alive for the mapping; never read
    _file: ShMemFile,
    ptr: *const T,
}

unsafe impl<T: Sync> Sync for ShMemBlockAlias<T> {}
unsafe impl<T: Send + Sync> Send for ShMemBlockAlias<T> {}

impl<T: Sync> std::ops::Deref for ShMemBlockAlias<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.ptr }
    }
}

/// Map the block referenced by `serialized` into this process.
///
/// # Safety
///
/// The block must have been allocated with `shmalloc::<T>` with the same
/// `T`, and must outlive the returned alias.
pub unsafe fn deserialize<T: Sync>(
    serialized: &ShMemBlockSerialized,
) -> std::io::Result<ShMemBlockAlias<T>> {
    let file = ShMemFile::open(&serialized.path)?;
    assert!(serialized.offset + std::mem::size_of::<T>() <= file.nbytes);
    let ptr = unsafe { file.base.add(serialized.offset) } as *const T;
    assert_eq!(ptr as usize % std::mem::align_of::<T>(), 0);
    Ok(ShMemBlockAlias { _file: file, ptr })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_good_size() {
        assert_eq!(good_size(1), PAGE_NBYTES);
        assert_eq!(good_size(PAGE_NBYTES), PAGE_NBYTES);
        assert_eq!(good_size(PAGE_NBYTES + 1), 2 * PAGE_NBYTES);
        assert_eq!(good_size(3 * PAGE_NBYTES), 4 * PAGE_NBYTES);
    }

    #[test]
    fn test_alloc_and_read_back() {
        let block = shmalloc(1234u64);
        assert_eq!(*block, 1234);
    }

    #[test]
    fn test_blocks_are_distinct() {
        let a = shmalloc(1u64);
        let b = shmalloc(2u64);
        assert_eq!(*a, 1);
        assert_eq!(*b, 2);
    }

    #[test]
    fn test_block_reuse() {
        // a size class no other test allocates, so the free list is ours
        let a = shmalloc([7u8; 3000]);
        let a_serial = a.serialize();
        drop(a);
        let b = shmalloc([9u8; 3000]);
        // the freed block is recycled for the identically-sized allocation
        assert_eq!(b.serialize(), a_serial);
        assert_eq!(b[0], 9);
    }

    #[test]
    fn test_serialized_string_roundtrip() {
        let block = shmalloc(99u32);
        let serial = block.serialize();
        let parsed: ShMemBlockSerialized = serial.to_string().parse().unwrap();
        assert_eq!(parsed, serial);
    }

    #[test]
    fn test_alias_sees_writes() {
        let block = shmalloc(AtomicU32::new(0));
        let serial = block.serialize();
        let alias = unsafe { deserialize::<AtomicU32>(&serial) }.unwrap();

        block.store(42, Ordering::SeqCst);
        assert_eq!(alias.load(Ordering::SeqCst), 42);

        alias.store(7, Ordering::SeqCst);
        assert_eq!(block.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_channel_through_alias() {
        use umbra_shim_helper::scchannel::SelfContainedChannel;

        let block = shmalloc(SelfContainedChannel::<u64>::new());
        let serial = block.serialize();
        let alias = unsafe { deserialize::<SelfContainedChannel<u64>>(&serial) }.unwrap();

        block.send(31337);
        assert_eq!(alias.receive(), Ok(31337));
    }
}
