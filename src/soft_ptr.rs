// Weak pointers. A soft pointer never keeps its target alive; it holds a
// refcounted record that the target's pool nulls when the slot is swept.
// Each live address has at most one record, found through the pool's sorted
// record table. Records whose refcount outlives their target sit on a global
// sorted stale list until the last reference drops.

use libc::c_void;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::collector::Collector;
use crate::hard_ptr::HardPtr;

/// Shared indirection between weak pointers and the target's pool.
///
/// `ptr` is the object base address, nulled when the target is reclaimed.
/// `next` is an install-once forwarding link used when a pool merges
/// identical immutable objects; once non-null it never changes. `count` is
/// the number of outstanding `SoftPtr` handles.
pub struct SoftData {
    ptr: AtomicPtr<c_void>,
    next: AtomicPtr<SoftData>,
    count: AtomicUsize,
}

impl SoftData {
    pub(crate) fn new(obj: *mut c_void) -> SoftData {
        debug_assert!(!obj.is_null());
        SoftData {
            ptr: AtomicPtr::new(obj),
            next: AtomicPtr::new(ptr::null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    /// Current target address; null once the target was reclaimed.
    pub(crate) fn object(&self) -> *mut c_void {
        self.ptr.load(Ordering::Acquire)
    }

    /// Install the forwarding link. May be stored at most once.
    #[allow(dead_code)] // reserved for the compacting pass
    pub(crate) fn forward(&self, to: *mut SoftData) {
        debug_assert!(self.next.load(Ordering::Relaxed).is_null());
        self.next.store(to, Ordering::Release);
    }
}

/// Stale records: nulled by their pool while references were still out.
/// Sorted by record address so membership is a binary search.
fn stale() -> &'static Mutex<Vec<usize>> {
    static STALE: OnceLock<Mutex<Vec<usize>>> = OnceLock::new();
    STALE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Called by a pool for a record whose slot is being reclaimed: null the
/// target and either free the record (no references left) or park it on the
/// stale list for the last `SoftPtr` drop to free. A nulled record is never
/// reused for another slot.
pub(crate) unsafe fn retire(rec: *mut SoftData) {
    debug_assert!(!rec.is_null());
    let mut list = stale().lock().unwrap();
    (*rec).ptr.store(ptr::null_mut(), Ordering::Release);
    if (*rec).count.load(Ordering::SeqCst) == 0 {
        drop(Box::from_raw(rec));
    } else {
        let key = rec as usize;
        let at = list.binary_search(&key).unwrap_or_else(|at| at);
        list.insert(at, key);
        debug_assert!(list.windows(2).all(|w| w[0] < w[1]));
    }
}

/// Drop one reference. The record is freed when the count reaches zero and
/// the pool has already retired it; otherwise the pool still owns the
/// record and will free it during a sweep.
unsafe fn release(rec: *mut SoftData) {
    let prev = (*rec).count.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(prev >= 1);
    if prev == 1 {
        let mut list = stale().lock().unwrap();
        if let Ok(at) = list.binary_search(&(rec as usize)) {
            list.remove(at);
            drop(Box::from_raw(rec));
        }
    }
}

/// Take a reference on the record at the end of the forwarding chain.
/// Returns null when the chain ends at a reclaimed target.
unsafe fn acquire(rec: *mut SoftData) -> *mut SoftData {
    let mut rec = rec;
    loop {
        if rec.is_null() {
            return ptr::null_mut();
        }
        let next = (*rec).next.load(Ordering::Relaxed);
        if !next.is_null() {
            rec = next;
            continue;
        }
        if (*rec).object().is_null() {
            return ptr::null_mut();
        }
        (*rec).count.fetch_add(1, Ordering::Relaxed);
        return rec;
    }
}

/// Exchange a held reference for one at the end of the chain, dropping the
/// old reference when the chain moved on or the target died.
unsafe fn update(old: *mut SoftData) -> *mut SoftData {
    if old.is_null() {
        return ptr::null_mut();
    }
    let next = (*old).next.load(Ordering::Relaxed);
    if !next.is_null() {
        let fresh = acquire(next);
        release(old);
        fresh
    } else if !(*old).object().is_null() {
        old
    } else {
        release(old);
        ptr::null_mut()
    }
}

/// Non-owning handle to a collector-managed object. Never fails; every
/// operation degrades to null once the target has been reclaimed.
pub struct SoftPtr {
    data: *mut SoftData,
}

unsafe impl Send for SoftPtr {}
unsafe impl Sync for SoftPtr {}

impl SoftPtr {
    /// The null weak pointer.
    pub fn null() -> SoftPtr {
        SoftPtr {
            data: ptr::null_mut(),
        }
    }

    /// Observe the target of a strong pointer. Requires the mutator lock;
    /// the record is found or created in the target's pool.
    pub fn new(hard: &HardPtr) -> SoftPtr {
        debug_assert!(crate::lock::locked());
        let obj = hard.as_ptr();
        if obj.is_null() {
            return SoftPtr::null();
        }
        let rec = match Collector::fetch_record(obj) {
            Some(rec) => rec,
            None => {
                debug_assert!(false, "strong pointer target has no source");
                return SoftPtr::null();
            }
        };
        SoftPtr {
            data: unsafe { acquire(rec) },
        }
    }

    /// Whether this handle is (or has normalized to) null. A handle whose
    /// target died after creation still answers false until refreshed; its
    /// upgrades answer `None`.
    pub fn is_null(&self) -> bool {
        self.data.is_null()
    }

    /// Recover a strong pointer, or `None` when the target was reclaimed.
    /// Requires the mutator lock.
    pub fn upgrade(&self) -> Option<HardPtr> {
        debug_assert!(crate::lock::locked());
        let mut rec = self.data;
        loop {
            if rec.is_null() {
                return None;
            }
            let next = unsafe { (*rec).next.load(Ordering::Relaxed) };
            if !next.is_null() {
                rec = next;
                continue;
            }
            let obj = unsafe { (*rec).object() };
            if obj.is_null() {
                return None;
            }
            let id = Collector::get_type(obj)?;
            return Some(HardPtr::from_parts(obj, id));
        }
    }

    /// Chase the forwarding chain, dropping this handle's claim on records
    /// the pool has merged away or reclaimed.
    pub fn refresh(&mut self) {
        self.data = unsafe { update(self.data) };
    }
}

impl Clone for SoftPtr {
    fn clone(&self) -> SoftPtr {
        SoftPtr {
            data: unsafe { acquire(self.data) },
        }
    }
}

impl Drop for SoftPtr {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe {
                release(self.data);
            }
        }
    }
}

impl Default for SoftPtr {
    fn default() -> SoftPtr {
        SoftPtr::null()
    }
}
