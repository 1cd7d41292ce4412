// A pool is one virtual-memory region holding fixed-size slots for a single
// identity, together with everything needed to account for them: the two
// bitmaps, the intrusive free list, the optional gray stack and the table of
// weak records observing its slots. Pools are the collector's sources: every
// raw pointer is classified by finding the pool whose arena contains it.

pub mod arena;
pub mod bitmap;
pub mod blueprint;
pub mod free_list;
pub mod gray_list;

use libc::c_void;
use log::trace;
use std::ptr::NonNull;

use self::arena::Arena;
use self::bitmap::Bitmap;
use self::blueprint::Blueprint;
use self::free_list::FreeList;
use self::gray_list::GrayList;
use crate::callbacks::EnumerateCb;
use crate::identity::Identity;
use crate::soft_ptr::{self, SoftData};
use crate::vmem::Vmem;
use crate::GcError;

use bit_field::BitField;

pub struct Pool {
    region: Vmem,
    ty: &'static Identity,
    /// Weak records for slots of this pool, sorted by slot address. At most
    /// one live record per address.
    tracking: Vec<*mut SoftData>,
    free: FreeList,
    initialized: Bitmap,
    reachable: Bitmap,
    gray: GrayList,
    store: Arena,
}

unsafe impl Send for Pool {}

impl Pool {
    pub fn new(id: &'static Identity, cfg: &Blueprint) -> Result<Box<Pool>, GcError> {
        let region = cfg.prepare_region()?;
        let maps = region.at(cfg.maps) as *mut usize;
        let half = Bitmap::length(cfg.capacity);
        let initialized = Bitmap::new(maps);
        let reachable = Bitmap::new(unsafe { maps.add(half) });
        // One contiguous array split into halves; both start out clear.
        initialized.clear(half * 2);
        let store = Arena::new(region.at(cfg.begin), cfg.capacity, cfg.unit);
        debug_assert!(region.begin() as usize <= store.front() as usize);
        debug_assert!(store.back() as usize <= region.end() as usize);
        let gray = GrayList::new(cfg.gray_base(id, &region));
        let free = FreeList::new(&store);
        trace!(
            "pool: mapped {:p}, {} slots of {} bytes",
            region.begin(),
            cfg.capacity,
            cfg.unit
        );
        Ok(Box::new(Pool {
            region,
            ty: id,
            tracking: Vec::new(),
            free,
            initialized,
            reachable,
            gray,
            store,
        }))
    }

    /// Address pools are ordered and indexed by.
    pub fn location(&self) -> *mut c_void {
        self.store.front()
    }

    /// Start of the whole region; with guard pages this address faults.
    pub fn region_begin(&self) -> *mut c_void {
        self.region.begin()
    }

    pub fn contains(&self, ptr: *const c_void) -> bool {
        self.store.contains(ptr)
    }

    pub fn base_of(&self, ptr: *mut c_void) -> *mut c_void {
        self.store.base_of(ptr)
    }

    pub fn type_of(&self) -> &'static Identity {
        self.ty
    }

    /// Hand out one slot, or null when the pool is full.
    pub fn allocate(&mut self) -> Option<NonNull<c_void>> {
        if self.free.full() {
            return None;
        }
        let addr = self.free.pop();
        let index = self.store.index(addr);
        debug_assert!(!self.initialized.test(index));
        self.initialized.set(index);
        NonNull::new(addr)
    }

    /// Take back a just-allocated slot whose object never came to life.
    pub fn discarded(&mut self, addr: *mut c_void) {
        debug_assert!(self.contains(addr));
        debug_assert!(self.base_of(addr) == addr);
        let index = self.store.index(addr);
        debug_assert!(self.initialized.test(index));
        self.initialized.reset(index);
        self.free.push(addr);
    }

    /// Record that the slot containing `ptr` is reachable, queueing it for
    /// traversal when the identity has out-pointers.
    pub unsafe fn mark(this: *mut Pool, ptr: *mut c_void) {
        debug_assert!((*this).contains(ptr));
        let base = (*this).store.base_of(ptr);
        let index = (*this).store.index(base);
        debug_assert!((*this).initialized.test(index));
        if !(*this).reachable.test(index) {
            (*this).reachable.set(index);
            if (*this).gray.present() {
                debug_assert!((*this).gray.pending() < (*this).store.capacity());
                (*this).gray.push(base);
            }
        }
    }

    /// Drain the gray stack, feeding each slot's out-pointers to `cb`.
    /// Returns whether any work was done.
    pub unsafe fn traverse(this: *mut Pool, data: *mut c_void, cb: EnumerateCb) -> bool {
        let tcb = match (*this).ty.traverser() {
            Some(tcb) => tcb,
            None => {
                debug_assert!(false, "traverse on an untraversable pool");
                return false;
            }
        };
        if !(*this).gray.has_pending() {
            return false;
        }
        while (*this).gray.has_pending() {
            let slot = (*this).gray.pop();
            debug_assert!((*this).contains(slot));
            debug_assert!((*this).initialized.test((*this).store.index(slot)));
            debug_assert!((*this).reachable.test((*this).store.index(slot)));
            tcb(slot as *const c_void, data, cb);
        }
        true
    }

    /// Reclaim every slot that is initialized but was not marked: run its
    /// finalizer, null its weak record, thread it back onto the free list.
    /// Afterwards the marked set is the new initialized set and the
    /// reachable map is clear.
    pub unsafe fn sweep(this: *mut Pool) {
        let capacity = (*this).store.capacity();
        let words = Bitmap::length(capacity);
        let bits = Bitmap::bits();
        // Dead slot addresses come out in ascending order, so one cursor
        // suffices to walk the sorted record table alongside.
        let mut cursor = 0usize;
        for word in 0..words {
            let alloc = (*this).initialized.group(word);
            let marks = (*this).reachable.group(word);
            debug_assert!(marks & !alloc == 0);
            let dead = alloc & !marks;
            if dead != 0 {
                for bit in 0..bits {
                    let index = word * bits + bit;
                    if index >= capacity {
                        break;
                    }
                    if dead.get_bit(bit) {
                        let slot = (*this).store.slot(index);
                        Pool::drop_record(this, slot, &mut cursor);
                        (*this).ty.finalize(slot);
                        (*this).free.push(slot);
                    }
                }
            }
            (*this).initialized.set_group(word, 0);
        }
        // The black slots become the new allocated set; the old initialized
        // array, now zeroed, becomes the next cycle's mark map.
        let cleared = (*this).initialized;
        (*this).initialized = (*this).reachable;
        (*this).reachable = cleared;
    }

    /// Null and detach the weak record for `slot`, if one exists.
    unsafe fn drop_record(this: *mut Pool, slot: *mut c_void, cursor: &mut usize) {
        let key = slot as usize;
        while *cursor < (*this).tracking.len() {
            let rec = (&(*this).tracking)[*cursor];
            let at = (*rec).object() as usize;
            if at < key {
                *cursor += 1;
            } else {
                if at == key {
                    let rec = (*this).tracking.remove(*cursor);
                    soft_ptr::retire(rec);
                }
                return;
            }
        }
    }

    /// Find or create the weak record for the slot containing `ptr`.
    pub fn fetch(&mut self, ptr: *mut c_void) -> *mut SoftData {
        debug_assert!(self.contains(ptr));
        let base = self.base_of(ptr);
        let key = base as usize;
        match self
            .tracking
            .binary_search_by_key(&key, |rec| unsafe { (**rec).object() as usize })
        {
            Ok(found) => self.tracking[found],
            Err(insert_at) => {
                let rec = Box::into_raw(Box::new(SoftData::new(base)));
                self.tracking.insert(insert_at, rec);
                rec
            }
        }
    }

    pub fn used(&self) -> usize {
        self.store.capacity() - self.free.available()
    }

    pub fn available(&self) -> usize {
        self.free.available()
    }

    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    pub fn pending(&self) -> usize {
        self.gray.pending()
    }

    pub fn is_empty(&self) -> bool {
        self.free.available() == self.store.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.free.full()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Outstanding weak observers see the region die as a collection.
        for rec in self.tracking.drain(..) {
            unsafe {
                soft_ptr::retire(rec);
            }
        }
        if self.ty.has_finalizer() && !self.is_empty() {
            for index in 0..self.store.capacity() {
                if self.initialized.test(index) {
                    unsafe {
                        self.ty.finalize(self.store.slot(index));
                    }
                }
            }
        }
        trace!("pool: unmapped {:p}", self.region.begin());
    }
}
