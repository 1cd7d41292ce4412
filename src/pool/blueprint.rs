// Pre-computed layout for pools of one identity. Worked out once per
// allocator and reused for every pool it grows.

use libc::c_void;
use log::trace;
use std::mem;

use super::bitmap::Bitmap;
use super::free_list::FreeList;
use crate::config;
use crate::identity::Identity;
use crate::util::{gcd, round_up};
use crate::vmem::Vmem;
use crate::GcError;

/// Region layout for a `(identity, unit)` pair. All offsets are from the
/// start of the virtual-memory region.
///
/// ```text
/// [guard?] [bitmaps] [gray buffer?] [pad to page] [guard?] [slots] [guard?]
///          ^maps                                           ^begin
/// ```
pub struct Blueprint {
    /// Slot size pools built from this blueprint use.
    pub unit: usize,
    /// Slots per pool.
    pub capacity: usize,
    /// Total bytes of virtual memory per pool.
    pub total: usize,
    /// Offset of the two bitmaps.
    pub maps: usize,
    /// Offset of the gray buffer; zero when the identity is untraversable.
    pub gray: usize,
    /// Length of the header span starting at `maps`.
    pub header: usize,
    /// Offset of the first slot.
    pub begin: usize,
    /// Length of the slot span, `capacity * unit` bytes.
    pub length: usize,
}

/// Slots per pool: fill whole pages exactly when the LCM of unit and page
/// size allows it within `MAX_POOL` pages, otherwise as many slots as fit;
/// never fewer than `MIN_POOL` slots even if that overruns the page bound.
fn select_capacity(unit: usize, page: usize) -> usize {
    let max_size = config::MAX_POOL * page;
    if unit * config::MIN_POOL < max_size {
        // Smallest count that exactly fills pages: lcm(unit, page) / unit.
        let mut capacity = page / gcd(page, unit);
        let size = capacity * unit;
        debug_assert!(size % page == 0);
        if size > max_size {
            capacity = max_size / unit;
        } else {
            let part = max_size / size;
            if part >= 2 {
                capacity *= part;
            }
        }
        debug_assert!(capacity >= config::MIN_POOL);
        capacity
    } else {
        let mut capacity = config::MIN_POOL;
        // Fill up the last occupied page as far as possible.
        let remainder = (capacity * unit) % page;
        if remainder > unit {
            capacity += (page - remainder) / unit;
        }
        capacity
    }
}

impl Blueprint {
    /// Lower bound on the unit size: a free-list node must fit in a slot.
    pub const fn min_unit() -> usize {
        FreeList::node_size()
    }

    pub fn new(id: &Identity) -> Blueprint {
        let page = Vmem::page_size();
        let unit = id.unit().max(Blueprint::min_unit());
        let capacity = select_capacity(unit, page);
        let guard = if config::GUARD_PAGES { page } else { 0 };
        // Slot span rounded up to whole pages.
        let length = capacity * unit;
        let size = round_up(length, page);
        // Bitmaps sit right after the optional head guard.
        let maps = guard;
        let mut offset = maps + Bitmap::footprint(capacity) * 2;
        // Gray buffer, pointer-aligned, only for traversable identities.
        let gray = if id.has_traverser() {
            let at = round_up(offset, mem::align_of::<*mut c_void>());
            offset = at + capacity * mem::size_of::<*mut c_void>();
            at
        } else {
            0
        };
        // Slots start on the next page boundary, after the optional guard.
        offset = round_up(offset.max(maps + 1), page);
        let header = offset - maps;
        let begin = offset + guard;
        let total = size + begin + guard;
        let plan = Blueprint {
            unit,
            capacity,
            total,
            maps,
            gray,
            header,
            begin,
            length,
        };
        debug_assert!(plan.begin + plan.length <= plan.total);
        debug_assert!(plan.maps + plan.header <= plan.begin);
        debug_assert!(plan.gray == 0 || (plan.maps < plan.gray && plan.gray < plan.begin));
        trace!(
            "blueprint: unit {} capacity {} region {} bytes",
            plan.unit,
            plan.capacity,
            plan.total
        );
        plan
    }

    /// Map a region laid out for this blueprint. With guard pages the region
    /// starts inaccessible and only the header and slot spans are opened up.
    pub fn prepare_region(&self) -> Result<Vmem, GcError> {
        let mem = Vmem::new(self.total, !config::GUARD_PAGES).ok_or(GcError::OutOfMemory)?;
        if config::GUARD_PAGES {
            if !mem.writable(self.maps, self.header) || !mem.writable(self.begin, self.length) {
                return Err(GcError::OutOfMemory);
            }
        }
        Ok(mem)
    }

    /// Start of the gray buffer inside `mem`, or null for untraversable
    /// identities.
    pub fn gray_base(&self, id: &Identity, mem: &Vmem) -> *mut *mut c_void {
        if id.has_traverser() {
            mem.at(self.gray) as *mut *mut c_void
        } else {
            std::ptr::null_mut()
        }
    }
}

#[cfg(test)]
mod blueprint_tests {
    use super::*;
    use crate::identity::{identity_of, Managed};
    use crate::callbacks::{EnumerateCb, RemapCb};

    struct Small(#[allow(dead_code)] u64);
    impl Managed for Small {}

    struct Chunky(#[allow(dead_code)] [u8; 24]);
    impl Managed for Chunky {
        const POINTERS: bool = true;
        fn traverse(&self, _data: *mut libc::c_void, _cb: EnumerateCb) {}
        fn remap(&mut self, _data: *mut libc::c_void, _cb: RemapCb) {}
    }

    #[test]
    fn test_capacity_fills_pages() {
        let page = Vmem::page_size();
        let capacity = select_capacity(8, page);
        assert_eq!((capacity * 8) % page, 0);
        assert!(capacity >= config::MIN_POOL);
        assert!(capacity * 8 <= config::MAX_POOL * page);
    }

    #[test]
    fn test_capacity_respects_min_pool() {
        let page = Vmem::page_size();
        // A unit so large MIN_POOL slots overrun MAX_POOL pages.
        let unit = page;
        let capacity = select_capacity(unit, page);
        assert!(capacity >= config::MIN_POOL);
    }

    #[test]
    fn test_layout_invariants() {
        let page = Vmem::page_size();
        let plan = Blueprint::new(identity_of::<Small>());
        assert!(plan.unit >= Blueprint::min_unit());
        assert_eq!(plan.begin % page, 0);
        assert!(plan.maps + plan.header <= plan.begin);
        assert!(plan.begin + plan.length <= plan.total);
        assert_eq!(plan.gray, 0);
        if config::GUARD_PAGES {
            assert_eq!(plan.maps, page);
        } else {
            assert_eq!(plan.maps, 0);
        }
    }

    #[test]
    fn test_traversable_layout_has_gray_span() {
        let plan = Blueprint::new(identity_of::<Chunky>());
        assert!(plan.gray > plan.maps);
        assert!(plan.gray < plan.begin);
        // The gray buffer holds one pointer per slot.
        assert!(
            plan.gray + plan.capacity * mem::size_of::<*mut c_void>() <= plan.maps + plan.header
        );
    }

    #[test]
    fn test_prepared_region_is_usable() {
        let plan = Blueprint::new(identity_of::<Small>());
        let mem = plan.prepare_region().unwrap();
        assert!(mem.size() >= plan.total);
        unsafe {
            // Header and slot spans must be writable either way.
            (mem.at(plan.maps) as *mut u8).write(1);
            (mem.at(plan.begin) as *mut u8).write(1);
            (mem.at(plan.begin + plan.length - 1) as *mut u8).write(1);
        }
    }
}
