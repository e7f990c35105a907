use std::{ptr::NonNull, slice};

use tracing::debug;

use crate::{
    kernel::{self, ArenaSource},
    utils::align,
};

/// An arena backed by one reservation of virtual memory.
///
/// The whole address range is reserved up front and pages are committed as
/// the arena grows, so the arena never moves and growth is always
/// contiguous, just like moving the program break with `sbrk`.
///
/// ```text
///  base                  len          committed                 reserved
///   |                     |               |                         |
///   +---------------------+---------------+-------------------------+
///   |    arena bytes      |  committed,   |   reserved, no access   |
///   |                     |  not yet used |                         |
///   +---------------------+---------------+-------------------------+
/// ```
pub struct MmapSource {
    /// Start of the reservation. Page aligned.
    base: NonNull<u8>,
    /// Size of the reservation (multiple of the page size).
    reserved: usize,
    /// Bytes at the start of the reservation that are readable and writable.
    committed: usize,
    /// Current arena size.
    len: usize,
}

// The source exclusively owns its mapping.
unsafe impl Send for MmapSource {}

impl MmapSource {
    /// Reserve room for an arena of up to `max_bytes` bytes.
    ///
    /// Returns `None` if the kernel refuses the reservation.
    pub fn reserve(max_bytes: usize) -> Option<Self> {
        let reserved = align(max_bytes.max(1), kernel::page_size());

        let base = unsafe { kernel::reserve(reserved)? };
        debug!(reserved, base = ?base, "reserved arena address space");

        Some(Self {
            base,
            reserved,
            committed: 0,
            len: 0,
        })
    }

    /// Size of the address space reservation.
    pub fn capacity(&self) -> usize {
        self.reserved
    }
}

impl ArenaSource for MmapSource {
    fn reset(&mut self) {
        if self.committed > 0 {
            unsafe { kernel::decommit(self.base, self.committed) };
        }
        self.committed = 0;
        self.len = 0;
    }

    fn extend(&mut self, bytes: usize) -> Option<usize> {
        let new_len = self.len.checked_add(bytes)?;
        if new_len > self.reserved {
            return None;
        }

        if new_len > self.committed {
            let new_committed = align(new_len, kernel::page_size()).min(self.reserved);
            // SAFETY: `committed` is inside the reservation, so is the range.
            let ok = unsafe {
                let start = NonNull::new_unchecked(self.base.as_ptr().add(self.committed));
                kernel::commit(start, new_committed - self.committed)
            };
            if !ok {
                return None;
            }
            self.committed = new_committed;
        }

        let old_len = self.len;
        self.len = new_len;

        Some(old_len)
    }

    fn bounds(&self) -> (usize, usize) {
        let low = self.base.as_ptr() as usize;
        (low, low + self.len)
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: the first `len` bytes are committed and owned by us.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

impl Drop for MmapSource {
    fn drop(&mut self) {
        unsafe { kernel::release(self.base, self.reserved) };
    }
}
