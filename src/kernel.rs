use std::{ptr::NonNull, sync::OnceLock};

/// Virtual memory page size of the computer. This is usually 4096.
/// We can't know the value at compile time so it is computed once.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// The external collaborator that owns the bytes of an arena.
///
/// The heap only ever asks a source to grow at its end. Growth must be
/// contiguous: after a successful [`ArenaSource::extend`] the new bytes
/// start exactly where the previous ones ended, so offsets handed out
/// before the call stay valid.
pub trait ArenaSource {
    /// Drop every byte, leaving an empty arena.
    fn reset(&mut self);

    /// Grow the arena by `bytes` zero-filled bytes.
    ///
    /// Returns the offset where the new region starts (the previous arena
    /// size), or `None` if the request is refused. A refused request must
    /// leave the arena unchanged.
    fn extend(&mut self, bytes: usize) -> Option<usize>;

    /// Lowest address of the arena and one past its highest byte.
    fn bounds(&self) -> (usize, usize);

    /// Current contents of the arena.
    fn as_bytes(&self) -> &[u8];

    /// Current contents of the arena, mutably.
    fn as_bytes_mut(&mut self) -> &mut [u8];

    /// Current size of the arena in bytes.
    fn len(&self) -> usize {
        self.as_bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Low level memory operations. The allocator's top level view of the
/// arena has nothing to do with the concrete APIs offered by each kernel,
/// so those live behind this trait.
pub(crate) trait PlatformMemory {
    /// Reserve `len` bytes of address space without backing them. It returns
    /// a pointer to the start of the reservation or None if the syscall fails.
    unsafe fn reserve(len: usize) -> Option<NonNull<u8>>;

    /// Make `len` bytes starting at `addr` (inside a reservation) readable
    /// and writable. Freshly committed pages read as zero.
    unsafe fn commit(addr: NonNull<u8>, len: usize) -> bool;

    /// Return the physical pages behind `len` bytes at `addr` while keeping
    /// the address range reserved.
    unsafe fn decommit(addr: NonNull<u8>, len: usize);

    /// Give the whole reservation of size `len` starting from `addr` back to the kernel.
    unsafe fn release(addr: NonNull<u8>, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

/// Platform dependant memory primitives. See [`PlatformMemory`].
pub(crate) struct Kernel;

/// Wrapper to calculate the computer's page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe { Kernel::page_size() })
}

/// Wrapper to use [`Kernel::reserve`]
#[inline]
pub(crate) unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
    unsafe { Kernel::reserve(len) }
}

/// Wrapper to use [`Kernel::commit`]
#[inline]
pub(crate) unsafe fn commit(addr: NonNull<u8>, len: usize) -> bool {
    unsafe { Kernel::commit(addr, len) }
}

/// Wrapper to use [`Kernel::decommit`]
#[inline]
pub(crate) unsafe fn decommit(addr: NonNull<u8>, len: usize) {
    unsafe { Kernel::decommit(addr, len) }
}

/// Wrapper to use [`Kernel::release`]
#[inline]
pub(crate) unsafe fn release(addr: NonNull<u8>, len: usize) {
    unsafe { Kernel::release(addr, len) }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, mprotect, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    const FD: c_int = -1;
    const OFFSET: off_t = 0;

    impl PlatformMemory for Kernel {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Inaccessible until committed.
            const PROT: c_int = libc::PROT_NONE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn commit(addr: NonNull<u8>, len: usize) -> bool {
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;

            unsafe { mprotect(addr.as_ptr().cast(), len as size_t, PROT) == 0 }
        }

        unsafe fn decommit(addr: NonNull<u8>, len: usize) {
            // Mapping fresh anonymous pages over the range drops the old ones.
            const FLAGS: c_int =
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED;

            unsafe {
                mmap(addr.as_ptr().cast(), len as size_t, libc::PROT_NONE, FLAGS, FD, OFFSET);
            }
        }

        unsafe fn release(addr: NonNull<u8>, len: usize) {
            unsafe {
                munmap(addr.as_ptr().cast(), len as size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use crate::kernel::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr = Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn commit(addr: NonNull<u8>, len: usize) -> bool {
            unsafe {
                let addr = Memory::VirtualAlloc(
                    Some(addr.as_ptr() as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                !addr.is_null()
            }
        }

        unsafe fn decommit(addr: NonNull<u8>, len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr.as_ptr().cast(), len, Memory::MEM_DECOMMIT);
            }
        }

        unsafe fn release(addr: NonNull<u8>, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr.as_ptr().cast(), 0, Memory::MEM_RELEASE);
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
    fn page_size_is_a_power_of_two() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
        // Cached value is stable.
        assert_eq!(size, page_size());
    }

    #[test]
    fn reserved_memory_is_zero_after_commit() {
        let len = page_size() * 2;
        unsafe {
            let addr = reserve(len).expect("reserve failed");
            assert!(commit(addr, page_size()));

            let bytes = std::slice::from_raw_parts_mut(addr.as_ptr(), page_size());
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[0] = 0xAB;

            decommit(addr, len);
            assert!(commit(addr, page_size()));
            let bytes = std::slice::from_raw_parts(addr.as_ptr(), page_size());
            assert_eq!(bytes[0], 0);

            release(addr, len);
        }
    }
}
