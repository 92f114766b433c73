//! Backing strategies for the disk buffer pool
//!
//! A block's memory can come from one of three places: a plain heap
//! allocation, a recycling slab pool, or a slot in one large
//! memory-mapped cache file. The active strategy may only change while
//! no blocks are outstanding, so every live block belongs to the
//! current strategy.

use std::path::Path;

#[cfg(unix)]
use crate::error::{CoreError, DiskErrorKind, Result};

/// Which backing strategy the pool is using
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    /// One heap allocation per block
    Heap,
    /// Recycling slab pool with a growth hint
    Pool,
    /// Slots of a memory-mapped cache file
    Mmap,
}

/// The memory held by a single block
pub(crate) enum BlockData {
    /// Heap or slab-pool region
    Owned(Box<[u8]>),
    /// A slot of the mmap cache file
    #[cfg(unix)]
    Slot {
        ptr: *mut u8,
        len: usize,
        slot: u32,
    },
}

// A Slot's pointer range is exclusively owned by this block until it is
// returned to the region's free list, and the mapping outlives every
// outstanding block (strategy switches require in_use == 0).
unsafe impl Send for BlockData {}

impl BlockData {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(b) => b,
            #[cfg(unix)]
            Self::Slot { ptr, len, .. } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
        }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::Owned(b) => b,
            #[cfg(unix)]
            Self::Slot { ptr, len, .. } => unsafe { std::slice::from_raw_parts_mut(*ptr, *len) },
        }
    }

    /// Ordering key used by `free_many` to release in address order
    pub(crate) fn sort_key(&self) -> usize {
        match self {
            Self::Owned(b) => b.as_ptr() as usize,
            #[cfg(unix)]
            Self::Slot { slot, .. } => *slot as usize,
        }
    }
}

/// Active backing strategy state
pub(crate) enum Backing {
    Heap,
    Pool(SlabPool),
    #[cfg(unix)]
    Mmap(MmapRegion),
}

/// Why an mmap cache file could not be brought up
pub(crate) struct MmapRegionUnavailable(pub String);

impl Backing {
    /// Construct the mmap-file strategy, or explain why it can't exist
    #[cfg(unix)]
    pub(crate) fn mmap(
        path: &Path,
        max_use: usize,
        block_size: usize,
    ) -> std::result::Result<Self, MmapRegionUnavailable> {
        MmapRegion::create(path, max_use, block_size)
            .map(Backing::Mmap)
            .map_err(|e| MmapRegionUnavailable(e.to_string()))
    }

    #[cfg(not(unix))]
    pub(crate) fn mmap(
        _path: &Path,
        _max_use: usize,
        _block_size: usize,
    ) -> std::result::Result<Self, MmapRegionUnavailable> {
        Err(MmapRegionUnavailable(
            "mmap cache is not supported on this platform".into(),
        ))
    }

    pub(crate) fn kind(&self) -> BackingKind {
        match self {
            Self::Heap => BackingKind::Heap,
            Self::Pool(_) => BackingKind::Pool,
            #[cfg(unix)]
            Self::Mmap(_) => BackingKind::Mmap,
        }
    }

    /// Hand out one block's worth of memory, or `None` if the strategy
    /// is exhausted (only the mmap free list can run dry).
    pub(crate) fn allocate(&mut self, block_size: usize, chunk_hint: usize) -> Option<BlockData> {
        match self {
            Self::Heap => Some(BlockData::Owned(zeroed_block(block_size))),
            Self::Pool(pool) => Some(BlockData::Owned(pool.allocate(block_size, chunk_hint))),
            #[cfg(unix)]
            Self::Mmap(region) => region.allocate(),
        }
    }

    /// Return a block's memory to the strategy
    pub(crate) fn release(&mut self, data: BlockData) {
        match data {
            BlockData::Owned(b) => match self {
                Self::Heap => drop(b),
                Self::Pool(pool) => pool.release(b),
                #[cfg(unix)]
                Self::Mmap(_) => debug_assert!(false, "owned block freed into mmap backing"),
            },
            #[cfg(unix)]
            BlockData::Slot { slot, .. } => match self {
                Self::Mmap(region) => region.release(slot),
                _ => debug_assert!(false, "mmap slot freed into non-mmap backing"),
            },
        }
    }
}

fn zeroed_block(block_size: usize) -> Box<[u8]> {
    vec![0u8; block_size].into_boxed_slice()
}

/// Recycling slab allocator.
///
/// Freed regions go on a free list instead of back to the system; when
/// the list runs dry a whole chunk of fresh regions is carved at once.
pub(crate) struct SlabPool {
    free: Vec<Box<[u8]>>,
}

impl SlabPool {
    pub(crate) fn new() -> Self {
        Self { free: Vec::new() }
    }

    pub(crate) fn allocate(&mut self, block_size: usize, chunk_hint: usize) -> Box<[u8]> {
        if let Some(buf) = self.free.pop() {
            return buf;
        }
        // Grow by a chunk so subsequent allocations hit the free list
        for _ in 1..chunk_hint.max(1) {
            self.free.push(zeroed_block(block_size));
        }
        zeroed_block(block_size)
    }

    pub(crate) fn release(&mut self, buf: Box<[u8]>) {
        self.free.push(buf);
    }

    /// Drop all cached regions back to the system
    pub(crate) fn release_memory(&mut self) {
        self.free.clear();
    }
}

/// One large file mapped read-write; blocks are fixed-size slots handed
/// out from a free list of slot indices.
#[cfg(unix)]
pub(crate) struct MmapRegion {
    base: *mut u8,
    len: usize,
    fd: libc::c_int,
    block_size: usize,
    /// Free slot indices; popped from the back, so kept reversed to
    /// hand out ascending slots first
    free_slots: Vec<u32>,
}

#[cfg(unix)]
unsafe impl Send for MmapRegion {}

#[cfg(unix)]
impl MmapRegion {
    pub(crate) fn create(path: &Path, max_use: usize, block_size: usize) -> Result<Self> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            CoreError::disk(DiskErrorKind::MmapFailed, path, "path contains NUL byte")
        })?;
        let len = max_use * block_size;

        // O_TRUNC because the previous contents are never read back
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC, 0o700) };
        if fd < 0 {
            return Err(mmap_error(path, "open"));
        }

        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = mmap_error(path, "ftruncate");
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = mmap_error(path, "mmap");
            unsafe {
                libc::ftruncate(fd, 0);
                libc::close(fd);
            }
            return Err(err);
        }

        let free_slots = (0..max_use as u32).rev().collect();
        Ok(Self {
            base: base as *mut u8,
            len,
            fd,
            block_size,
            free_slots,
        })
    }

    fn allocate(&mut self) -> Option<BlockData> {
        let slot = self.free_slots.pop()?;
        let ptr = unsafe { self.base.add(slot as usize * self.block_size) };
        Some(BlockData::Slot {
            ptr,
            len: self.block_size,
            slot,
        })
    }

    fn release(&mut self, slot: u32) {
        let ptr = unsafe { self.base.add(slot as usize * self.block_size) };
        // The data is dead; let the kernel reclaim the pages rather
        // than writing them back to the cache file.
        unsafe {
            #[cfg(target_os = "linux")]
            libc::madvise(ptr as *mut libc::c_void, self.block_size, libc::MADV_DONTNEED);
            #[cfg(not(target_os = "linux"))]
            libc::madvise(ptr as *mut libc::c_void, self.block_size, libc::MADV_FREE);
        }
        self.free_slots.push(slot);
    }

    pub(crate) fn free_slot_count(&self) -> usize {
        self.free_slots.len()
    }
}

#[cfg(unix)]
impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
            // Truncate before close so close() doesn't block flushing
            // dead cache contents to disk.
            libc::ftruncate(self.fd, 0);
            libc::close(self.fd);
        }
    }
}

#[cfg(unix)]
fn mmap_error(path: &Path, op: &str) -> CoreError {
    CoreError::disk(
        DiskErrorKind::MmapFailed,
        path,
        format!("{op} failed: {}", std::io::Error::last_os_error()),
    )
}

/// Pin a block's pages in RAM
#[cfg(unix)]
pub(crate) fn pin(data: &BlockData) {
    let slice = data.as_slice();
    if unsafe { libc::mlock(slice.as_ptr() as *const libc::c_void, slice.len()) } != 0 {
        tracing::debug!("mlock failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(unix)]
pub(crate) fn unpin(data: &BlockData) {
    let slice = data.as_slice();
    unsafe { libc::munlock(slice.as_ptr() as *const libc::c_void, slice.len()) };
}

#[cfg(not(unix))]
pub(crate) fn pin(_data: &BlockData) {}

#[cfg(not(unix))]
pub(crate) fn unpin(_data: &BlockData) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_pool_recycles() {
        let mut pool = SlabPool::new();
        let a = pool.allocate(1024, 4);
        let a_ptr = a.as_ptr() as usize;
        pool.release(a);
        // Chunk growth left spares on the free list plus the released one
        assert!(!pool.free.is_empty());
        let b = pool.allocate(1024, 4);
        // Most recently released region comes back first
        assert_eq!(b.as_ptr() as usize, a_ptr);
    }

    #[test]
    fn test_slab_pool_release_memory() {
        let mut pool = SlabPool::new();
        let a = pool.allocate(1024, 8);
        pool.release(a);
        pool.release_memory();
        assert!(pool.free.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_mmap_region_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.mmap");
        let mut region = MmapRegion::create(&path, 4, 4096).unwrap();
        assert_eq!(region.free_slot_count(), 4);

        let mut a = region.allocate().unwrap();
        a.as_mut_slice()[0] = 0xAB;
        assert_eq!(a.as_slice()[0], 0xAB);
        assert_eq!(region.free_slot_count(), 3);

        let b = region.allocate().unwrap();
        assert_ne!(a.sort_key(), b.sort_key());

        for data in [a, b] {
            match data {
                BlockData::Slot { slot, .. } => region.release(slot),
                BlockData::Owned(_) => unreachable!(),
            }
        }
        assert_eq!(region.free_slot_count(), 4);
    }

    #[cfg(unix)]
    #[test]
    fn test_mmap_region_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.mmap");
        let mut region = MmapRegion::create(&path, 2, 4096).unwrap();
        let _a = region.allocate().unwrap();
        let _b = region.allocate().unwrap();
        assert!(region.allocate().is_none());
    }
}
