// Virtual memory facade for the collector. Pools get their backing store
// here: page-granular anonymous mappings whose protection can be changed per
// subrange, so guard pages are just spans we never make accessible.

use libc;
use libc::c_void;
use log::warn;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::{add_offset, round_up};

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// An owned region of virtual memory. Move-only; unmapped on drop. The
/// region's address is stable for its whole lifetime.
pub struct Vmem {
    ptr: *mut c_void,
    len: usize,
}

unsafe impl Send for Vmem {}

impl Vmem {
    /// Smallest unit of virtual memory the OS hands out.
    pub fn page_size() -> usize {
        let cached = PAGE_SIZE.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        assert!(size.is_power_of_two());
        PAGE_SIZE.store(size, Ordering::Relaxed);
        size
    }

    /// Map `size` bytes (rounded up to whole pages), readable and writable
    /// when `access` is true and inaccessible otherwise. Returns `None` when
    /// the OS refuses; mapping failure is a recoverable condition for the
    /// collector, not a fatal one.
    pub fn new(size: usize, access: bool) -> Option<Vmem> {
        assert!(size > 0);
        let len = round_up(size, Vmem::page_size());
        let prot = if access {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_NONE
        };
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            warn!("vmem: mmap of {} bytes failed", len);
            None
        } else {
            Some(Vmem { ptr, len })
        }
    }

    pub fn size(&self) -> usize {
        self.len
    }

    /// Starting address of the region.
    pub fn begin(&self) -> *mut c_void {
        self.ptr
    }

    /// Address one past the end of the region.
    pub fn end(&self) -> *mut c_void {
        add_offset(self.ptr, self.len)
    }

    /// Pointer `offset` bytes into the region.
    pub fn at(&self, offset: usize) -> *mut c_void {
        debug_assert!(offset < self.len);
        add_offset(self.ptr, offset)
    }

    /// Make a subrange inaccessible. Any page partially covered is affected
    /// as a whole.
    pub fn forbid(&self, offset: usize, length: usize) -> bool {
        self.protect(offset, length, libc::PROT_NONE)
    }

    /// Make a subrange read-only.
    pub fn readonly(&self, offset: usize, length: usize) -> bool {
        self.protect(offset, length, libc::PROT_READ)
    }

    /// Make a subrange readable and writable.
    pub fn writable(&self, offset: usize, length: usize) -> bool {
        self.protect(offset, length, libc::PROT_READ | libc::PROT_WRITE)
    }

    fn protect(&self, offset: usize, length: usize, prot: libc::c_int) -> bool {
        assert!(offset + length <= self.len);
        let page = Vmem::page_size();
        // mprotect wants a page-aligned start; widen the span to page bounds.
        let begin = (self.ptr as usize + offset) & !(page - 1);
        let end = round_up(self.ptr as usize + offset + length, page);
        let rc = unsafe { libc::mprotect(begin as *mut c_void, end - begin, prot) };
        if rc != 0 {
            warn!("vmem: mprotect({:#x}, {}) failed", begin, end - begin);
        }
        rc == 0
    }
}

impl Drop for Vmem {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

#[cfg(test)]
mod vmem_tests {
    use super::*;

    #[test]
    fn test_page_size() {
        let size = Vmem::page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
        assert_eq!(size, Vmem::page_size());
    }

    #[test]
    fn test_rounds_to_pages() {
        let mem = Vmem::new(1, true).unwrap();
        assert_eq!(mem.size(), Vmem::page_size());
        assert_eq!(mem.end() as usize - mem.begin() as usize, mem.size());
    }

    #[test]
    fn test_access_after_map() {
        let mem = Vmem::new(Vmem::page_size() * 2, true).unwrap();
        unsafe {
            let p = mem.begin() as *mut u8;
            p.write(0xa5);
            assert_eq!(p.read(), 0xa5);
            let q = mem.at(mem.size() - 1) as *mut u8;
            q.write(0x5a);
            assert_eq!(q.read(), 0x5a);
        }
    }

    #[test]
    fn test_protection_changes() {
        let page = Vmem::page_size();
        let mem = Vmem::new(page * 3, false).unwrap();
        // Middle page becomes usable while the flanks stay guarded.
        assert!(mem.writable(page, page));
        unsafe {
            let p = mem.at(page) as *mut u64;
            p.write(42);
            assert_eq!(p.read(), 42);
        }
        assert!(mem.readonly(page, page));
        unsafe {
            assert_eq!((mem.at(page) as *const u64).read(), 42);
        }
        assert!(mem.forbid(page, page));
    }
}
