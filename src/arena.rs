use std::{process, ptr::NonNull};

use crate::utils::align;

/// Address space reserved by [`Heap::new`](crate::Heap::new): 256 MiB.
///
/// Reserving is cheap, no physical memory is paged in until the arena
/// grows over a page.
pub(crate) const DEFAULT_RESERVE: usize = 256 * 1024 * 1024;

/// The single contiguous memory region the allocator manages.
///
/// The arena must grow without ever moving its existing bytes, every
/// block header holds raw addresses into it. To get that guarantee from
/// the OS we reserve the whole address range up front and only commit
/// pages as the arena actually grows:
///
/// ```text
/// lo                    brk             committed          reserved
/// +----------------------+---------------+------------------+
/// |     arena blocks     |  committed,   |   reserved only  |
/// |                      |  not yet used |   (inaccessible) |
/// +----------------------+---------------+------------------+
/// ```
///
/// [`Arena::grow`] advances the break and returns the region that just
/// became part of the arena, always contiguous with the previous end.
/// Running out of the reservation is fatal, see [`exhausted`].
pub(crate) struct Arena {
    /// Low bound of the reservation. The first block lives here.
    lo: NonNull<u8>,
    /// Bytes currently part of the arena, so `lo + len` is the high bound.
    len: usize,
    /// Bytes committed so far, page granular, never below `len`.
    committed: usize,
    /// Total reserved address range, the hard growth limit.
    reserved: usize,
    /// Virtual memory page size of the machine, usually 4096.
    page_size: usize,
}

/// This trait abstracts the low level memory syscalls. The arena, our top
/// level view of this, has nothing to do with the concrete APIs offered
/// by each kernel.
trait PlatformMemory {
    /// Reserves `len` bytes of contiguous address space without backing
    /// memory. Returns `None` if the kernel refuses.
    unsafe fn reserve_memory(len: usize) -> Option<NonNull<u8>>;

    /// Makes `len` reserved bytes starting at `addr` readable and
    /// writable. Returns whether the kernel agreed.
    unsafe fn commit_memory(addr: *mut u8, len: usize) -> bool;

    /// Returns the whole reservation of size `len` at `addr` back to the
    /// kernel.
    unsafe fn release_memory(addr: *mut u8, len: usize);

    /// Virtual memory page size of the machine in bytes.
    unsafe fn page_size() -> usize;
}

impl Arena {
    /// Reserves `reserve` bytes of address space for a new empty arena.
    ///
    /// A refused reservation is treated like exhaustion: there is no heap
    /// to run on, so the process terminates.
    pub fn new(reserve: usize) -> Self {
        unsafe {
            let page_size = Self::page_size();
            let reserved = align(reserve.max(page_size), page_size);

            let Some(lo) = Self::reserve_memory(reserved) else {
                log::error!("failed to reserve {reserved} bytes of address space for the arena");
                process::abort();
            };

            Self { lo, len: 0, committed: 0, reserved, page_size }
        }
    }

    /// Grows the arena by `n` bytes and returns the start of the new
    /// region, contiguous with and immediately following the previous
    /// high bound.
    ///
    /// Terminates the process when the reservation is exhausted or the
    /// kernel refuses to commit the pages.
    pub fn grow(&mut self, n: usize) -> NonNull<u8> {
        let new_len = match self.len.checked_add(n) {
            Some(new_len) if new_len <= self.reserved => new_len,
            _ => exhausted(n),
        };

        if new_len > self.committed {
            let commit_to = align(new_len, self.page_size).min(self.reserved);
            unsafe {
                let start = self.lo.as_ptr().add(self.committed);
                if !Self::commit_memory(start, commit_to - self.committed) {
                    exhausted(n);
                }
            }
            self.committed = commit_to;
        }

        let start = unsafe { NonNull::new_unchecked(self.lo.as_ptr().add(self.len)) };
        self.len = new_len;
        start
    }

    /// Low bound of the arena.
    pub fn lo(&self) -> NonNull<u8> {
        self.lo
    }

    /// High bound of the arena, one past the last block.
    pub fn hi(&self) -> *mut u8 {
        self.lo.as_ptr().wrapping_add(self.len)
    }

    /// Current arena size in bytes.
    pub fn size(&self) -> usize {
        self.len
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { Self::release_memory(self.lo.as_ptr(), self.reserved) }
    }
}

/// The allocator sits at the bottom of the memory stack. When the arena
/// cannot grow there is nobody left to recover, so the process terminates
/// instead of reporting an error the caller could do nothing with.
pub(crate) fn exhausted(requested: usize) -> ! {
    log::error!("heap exhausted: failed to grow the arena by {requested} bytes");
    process::abort();
}

#[cfg(unix)]
mod unix {
    use super::{Arena, PlatformMemory};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    use libc::{mmap, mprotect, munmap, off_t, size_t};

    impl PlatformMemory for Arena {
        unsafe fn reserve_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters. PROT_NONE keeps the reservation free of
            // charge until pages are committed.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
                }
            }
        }

        unsafe fn commit_memory(addr: *mut u8, len: usize) -> bool {
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;

            unsafe { mprotect(addr.cast::<c_void>(), len as size_t, PROT) == 0 }
        }

        unsafe fn release_memory(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr.cast::<c_void>(), len as size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{Arena, PlatformMemory};

    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Arena {
        unsafe fn reserve_memory(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr =
                    Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn commit_memory(addr: *mut u8, len: usize) -> bool {
            unsafe {
                let addr = Memory::VirtualAlloc(
                    Some(addr.cast::<c_void>() as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                !addr.is_null()
            }
        }

        unsafe fn release_memory(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr.cast::<c_void>(), 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_is_contiguous() {
        let mut arena = Arena::new(1024 * 1024);
        assert_eq!(arena.size(), 0);

        let first = arena.grow(64);
        assert_eq!(first, arena.lo());
        assert_eq!(arena.size(), 64);

        let second = arena.grow(128);
        assert_eq!(second.as_ptr(), arena.lo().as_ptr().wrapping_add(64));
        assert_eq!(arena.size(), 192);
        assert_eq!(arena.hi(), arena.lo().as_ptr().wrapping_add(192));
    }

    #[test]
    fn grown_region_is_writable() {
        let mut arena = Arena::new(1024 * 1024);
        let region = arena.grow(4 * 4096 + 17);

        unsafe {
            region.as_ptr().write_bytes(0xAB, 4 * 4096 + 17);
            assert_eq!(*region.as_ptr(), 0xAB);
            assert_eq!(*region.as_ptr().add(4 * 4096 + 16), 0xAB);
        }
    }
}
