use std::io;

use crate::util::Address;

/// Anonymous address-space reservation backing every space of the heap.
///
/// The mapping is private and lazily committed, so untouched pages cost nothing and pages handed
/// back with [`Mmap::dontneed`] read as zero the next time they are touched.
pub struct Mmap {
    start: Address,
    end: Address,
    size: usize,
}

impl Mmap {
    pub fn new(size: usize) -> io::Result<Self> {
        unsafe {
            let map = libc::mmap(
                core::ptr::null_mut(),
                size as _,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                start: Address::from_mut_ptr(map),
                end: Address::from_usize(map as usize + size),
                size,
            })
        }
    }

    /// Return the first address of the mapping aligned to `align`.
    pub fn aligned(&self, align: usize) -> Address {
        self.start.align_up(align)
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub fn dontneed(&self, page: Address, size: usize) {
        debug_assert!(page >= self.start && page.add(size) <= self.end);
        unsafe {
            libc::madvise(page.to_mut_ptr(), size as _, libc::MADV_DONTNEED);
        }
    }

    pub fn commit(&self, page: Address, size: usize) {
        unsafe {
            libc::madvise(page.to_mut_ptr(), size as _, libc::MADV_WILLNEED);
        }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.start.to_mut_ptr(), self.size as _);
        }
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}
