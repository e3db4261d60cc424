//! Shared Memory Region and Process-Shared Semaphores
//!
//! The supervisor allocates one anonymous `MAP_SHARED` segment before
//! forking; every worker inherits the mapping at the same address. The
//! segment is carved into fixed chunks at startup and never grows.
//!
//! Field-level synchronization is done with atomics; multi-field
//! structures (the request queue, the follow-primary lock words) are
//! guarded by POSIX process-shared semaphores living inside the segment.

use anyhow::{bail, Result};
use std::io;
use std::ptr;

/// Round `n` up to the next multiple of `align` (a power of two).
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Alignment used for every carved chunk. Generous enough for any of the
/// `#[repr(C)]` tables we place in the region.
pub const CHUNK_ALIGN: usize = 64;

// =============================================================================
// Region
// =============================================================================

/// One anonymous shared mapping, owned by the supervisor for its lifetime.
pub struct SharedRegion {
    base: *mut u8,
    size: usize,
}

// The raw pointer is to a MAP_SHARED segment; all mutation goes through
// atomics or semaphore-guarded accessors.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocate a zero-filled shared segment. Failure is fatal at startup.
    pub fn allocate(size: usize) -> Result<SharedRegion> {
        let size = align_up(size, page_size());
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            bail!(
                "failed to allocate {} bytes of shared memory: {}",
                size,
                io::Error::last_os_error()
            );
        }
        Ok(SharedRegion {
            base: base as *mut u8,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Carving cursor over this region. Used once, during startup.
    pub fn carver(&self) -> RegionCarver<'_> {
        RegionCarver {
            region: self,
            offset: 0,
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// Hands out aligned chunks from the front of a region.
pub struct RegionCarver<'a> {
    region: &'a SharedRegion,
    offset: usize,
}

impl<'a> RegionCarver<'a> {
    /// Carve space for `count` values of `T`. Panics if the region was
    /// sized too small; sizing and carving must agree.
    pub fn chunk<T>(&mut self, count: usize) -> *mut T {
        let start = align_up(self.offset, CHUNK_ALIGN.max(std::mem::align_of::<T>()));
        let bytes = std::mem::size_of::<T>() * count;
        assert!(
            start + bytes <= self.region.size,
            "shared region overflow: need {} bytes at offset {}, region is {}",
            bytes,
            start,
            self.region.size
        );
        self.offset = start + bytes;
        unsafe { self.region.base.add(start) as *mut T }
    }

    /// Raw byte chunk (query-cache region and similar opaque areas).
    pub fn bytes(&mut self, len: usize) -> *mut u8 {
        self.chunk::<u8>(len)
    }

    pub fn used(&self) -> usize {
        self.offset
    }
}

// =============================================================================
// Semaphores
// =============================================================================

/// A process-shared POSIX semaphore placed inside the region.
pub struct SharedSemaphore {
    sem: *mut libc::sem_t,
}

unsafe impl Send for SharedSemaphore {}
unsafe impl Sync for SharedSemaphore {}

impl SharedSemaphore {
    /// Initialize a binary semaphore at `sem`, which must point into the
    /// shared region and stay mapped for the life of the process tree.
    ///
    /// # Safety
    /// `sem` must be valid, properly aligned and not initialized twice.
    pub unsafe fn init_at(sem: *mut libc::sem_t) -> Result<SharedSemaphore> {
        if libc::sem_init(sem, 1, 1) != 0 {
            bail!(
                "failed to initialize shared semaphore: {}",
                io::Error::last_os_error()
            );
        }
        Ok(SharedSemaphore { sem })
    }

    /// Block until the semaphore is acquired. EINTR is retried; the
    /// supervisor processes signals at known points, not here.
    pub fn lock(&self) -> SemGuard<'_> {
        loop {
            let rc = unsafe { libc::sem_wait(self.sem) };
            if rc == 0 {
                return SemGuard { sem: self };
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                // A broken semaphore means the region is corrupt.
                panic!("sem_wait failed on shared semaphore: {}", err);
            }
        }
    }

    fn unlock(&self) {
        unsafe {
            libc::sem_post(self.sem);
        }
    }
}

/// RAII guard; posting on drop keeps every exit path honest.
pub struct SemGuard<'a> {
    sem: &'a SharedSemaphore,
}

impl Drop for SemGuard<'_> {
    fn drop(&mut self) {
        self.sem.unlock();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn test_allocate_and_carve() {
        let region = SharedRegion::allocate(8192).unwrap();
        assert!(region.size() >= 8192);

        let mut carver = region.carver();
        let a: *mut u64 = carver.chunk(4);
        let b: *mut u32 = carver.chunk(2);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_eq!(a.align_offset(std::mem::align_of::<u64>()), 0);
        // mmap delivers zeroed pages
        unsafe {
            assert_eq!(*a, 0);
            *a = 0xdead_beef;
            assert_eq!(*a, 0xdead_beef);
        }
        assert!(carver.used() >= 4 * 8 + 2 * 4);
    }

    #[test]
    #[should_panic(expected = "shared region overflow")]
    fn test_carve_overflow_panics() {
        let region = SharedRegion::allocate(4096).unwrap();
        let mut carver = region.carver();
        let _: *mut u8 = carver.chunk(region.size() + 1);
    }

    #[test]
    fn test_semaphore_lock_unlock() {
        let region = SharedRegion::allocate(4096).unwrap();
        let mut carver = region.carver();
        let sem_ptr: *mut libc::sem_t = carver.chunk(1);
        let sem = unsafe { SharedSemaphore::init_at(sem_ptr) }.unwrap();

        {
            let _guard = sem.lock();
        }
        // Re-acquirable after the guard dropped.
        let _guard = sem.lock();
    }
}
