// One allocator per identity. It owns a partition of pools (empty, partial,
// full, each sorted by address) plus the pool allocations are currently
// served from. The partition is an approximation between cycles: only the
// current pool changes state under the allocator mutex, and every cycle's
// shrink pass re-sorts reality back into the three lists.

use libc::c_void;
use log::trace;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::collector::{self, Collector, SourceRef};
use crate::identity::Identity;
use crate::pool::blueprint::Blueprint;
use crate::pool::Pool;
use crate::GcError;

struct AllocState {
    current: Option<SourceRef>,
    empty: Vec<SourceRef>,
    partial: Vec<SourceRef>,
    full: Vec<SourceRef>,
}

unsafe impl Send for AllocState {}

pub struct Allocator {
    ty: &'static Identity,
    cfg: Blueprint,
    mtx: Mutex<AllocState>,
}

fn insert_sorted(list: &mut Vec<SourceRef>, pool: SourceRef) {
    let key = unsafe { pool.as_ref() }.location() as usize;
    let at = list
        .binary_search_by_key(&key, |s| unsafe { s.as_ref() }.location() as usize)
        .unwrap_or_else(|at| at);
    list.insert(at, pool);
}

fn remove_from(list: &mut Vec<SourceRef>, pool: SourceRef) -> bool {
    let key = unsafe { pool.as_ref() }.location() as usize;
    match list.binary_search_by_key(&key, |s| unsafe { s.as_ref() }.location() as usize) {
        Ok(at) => {
            debug_assert!(list[at] == pool);
            list.remove(at);
            true
        }
        Err(_) => false,
    }
}

fn find_containing(list: &[SourceRef], addr: *mut c_void) -> Option<SourceRef> {
    let key = addr as usize;
    let after = list.partition_point(|s| unsafe { s.as_ref() }.location() as usize <= key);
    if after == 0 {
        return None;
    }
    let candidate = list[after - 1];
    if unsafe { candidate.as_ref() }.contains(addr) {
        Some(candidate)
    } else {
        None
    }
}

impl Allocator {
    /// Build the allocator for `id`. The first pool is mapped lazily on the
    /// first allocation, so registration itself cannot fail.
    pub fn new(id: &'static Identity) -> Allocator {
        Allocator {
            ty: id,
            cfg: Blueprint::new(id),
            mtx: Mutex::new(AllocState {
                current: None,
                empty: Vec::new(),
                partial: Vec::new(),
                full: Vec::new(),
            }),
        }
    }

    /// Map a new pool, register it as a source and make it current.
    fn grow(&self, st: &mut AllocState) -> Result<SourceRef, GcError> {
        let pool = Pool::new(self.ty, &self.cfg)?;
        let src = SourceRef::from(Box::leak(pool));
        Collector::insert_source(src, self.ty.has_traverser());
        insert_sorted(&mut st.empty, src);
        trace!("allocator: grew to {} pools", st.empty.len() + st.partial.len() + st.full.len());
        Ok(src)
    }

    /// Retire a full current pool into the full list.
    fn move_back(st: &mut AllocState, cur: SourceRef) {
        debug_assert!(unsafe { cur.as_ref() }.is_full());
        let moved = remove_from(&mut st.empty, cur) || remove_from(&mut st.partial, cur);
        if moved {
            insert_sorted(&mut st.full, cur);
        }
    }

    fn try_allocate(&self, st: &mut AllocState) -> Result<NonNull<c_void>, GcError> {
        let exhausted = match st.current {
            Some(cur) => unsafe { cur.as_ref() }.is_full(),
            None => true,
        };
        if exhausted {
            if let Some(cur) = st.current.take() {
                Allocator::move_back(st, cur);
            }
            let next = if let Some(&front) = st.empty.first() {
                front
            } else if let Some(&front) = st.partial.first() {
                front
            } else {
                self.grow(st)?
            };
            st.current = Some(next);
        }
        match st.current {
            Some(cur) => match unsafe { (*cur.as_ptr()).allocate() } {
                Some(slot) => Ok(slot),
                None => {
                    debug_assert!(false, "a selected pool must have space");
                    Err(GcError::OutOfMemory)
                }
            },
            None => Err(GcError::OutOfMemory),
        }
    }

    /// Allocate one slot. On exhaustion the allocator lock is dropped, one
    /// collection cycle is waited out, and the allocation retried once; a
    /// second failure surfaces as out-of-memory.
    pub fn allocate(&self) -> Result<NonNull<c_void>, GcError> {
        {
            let mut st = self.mtx.lock().unwrap();
            match self.try_allocate(&mut st) {
                Err(GcError::OutOfMemory) => {}
                outcome => return outcome,
            }
        }
        Collector::wait()?;
        let mut st = self.mtx.lock().unwrap();
        self.try_allocate(&mut st)
    }

    /// Give back a slot whose object construction was abandoned.
    pub fn discarded(&self, addr: *mut c_void) {
        let mut st = self.mtx.lock().unwrap();
        if let Some(cur) = st.current {
            if unsafe { cur.as_ref() }.contains(addr) {
                unsafe {
                    (*cur.as_ptr()).discarded(addr);
                }
                return;
            }
        }
        let found = find_containing(&st.full, addr)
            .or_else(|| find_containing(&st.partial, addr))
            .or_else(|| find_containing(&st.empty, addr));
        match found {
            Some(src) => unsafe {
                (*src.as_ptr()).discarded(addr);
            },
            None => debug_assert!(false, "discarded address belongs to no pool of this allocator"),
        }
    }

    /// Re-partition pools by their actual state, then release empty pools.
    /// At least one pool's capacity worth of free slots is kept; `goal`
    /// bounds the number released, zero meaning opportunistic-only. Runs
    /// inside a cycle, so the collector's indexes are passed in already
    /// locked. Returns the number of pools released.
    pub(crate) fn shrink(
        &self,
        goal: usize,
        sources: &mut Vec<SourceRef>,
        traversable: &mut Vec<SourceRef>,
    ) -> usize {
        let mut st = self.mtx.lock().unwrap();
        let st = &mut *st;
        let mut all: Vec<SourceRef> = Vec::with_capacity(
            st.empty.len() + st.partial.len() + st.full.len(),
        );
        all.extend(st.empty.drain(..));
        all.extend(st.partial.drain(..));
        all.extend(st.full.drain(..));
        all.sort_unstable_by_key(|s| unsafe { s.as_ref() }.location() as usize);
        for src in all {
            let pool = unsafe { src.as_ref() };
            if pool.is_empty() {
                st.empty.push(src);
            } else if pool.is_full() {
                st.full.push(src);
            } else {
                st.partial.push(src);
            }
        }
        // Free slots held by partial pools, in whole-pool units.
        let spare: usize = st
            .partial
            .iter()
            .map(|s| unsafe { s.as_ref() }.available())
            .sum();
        let mut releasable = st.empty.len();
        if spare < self.cfg.capacity && releasable > 0 {
            releasable -= 1;
        }
        let mut goal = goal;
        if releasable > 0 && goal == 0 {
            // Opportunistic: only release what the live pools clearly do not
            // need anymore.
            let used = st.full.len() + st.partial.len();
            let free_pools = releasable + spare / self.cfg.capacity;
            if used <= free_pools {
                goal = releasable.min(free_pools - used);
            }
        }
        let releases = goal.min(releasable);
        for _ in 0..releases {
            // Highest addresses go first, keeping the low end hot.
            if let Some(src) = st.empty.pop() {
                collector::erase_source(sources, src);
                if self.ty.has_traverser() {
                    collector::erase_source(traversable, src);
                }
                unsafe {
                    drop(Box::from_raw(src.as_ptr()));
                }
            }
        }
        if releases > 0 {
            trace!("allocator: released {} pools", releases);
        }
        st.current = st
            .empty
            .first()
            .or_else(|| st.partial.first())
            .or_else(|| st.full.first())
            .copied();
        releases
    }

    #[cfg(test)]
    pub(crate) fn used_slots(&self) -> usize {
        let st = self.mtx.lock().unwrap();
        st.empty
            .iter()
            .chain(st.partial.iter())
            .chain(st.full.iter())
            .map(|s| unsafe { s.as_ref() }.used())
            .sum()
    }

    #[cfg(test)]
    pub(crate) fn pool_count(&self) -> usize {
        let st = self.mtx.lock().unwrap();
        st.empty.len() + st.partial.len() + st.full.len()
    }

    #[cfg(test)]
    pub(crate) fn first_region(&self) -> Option<*mut c_void> {
        let st = self.mtx.lock().unwrap();
        st.current
            .or_else(|| st.empty.first().copied())
            .or_else(|| st.partial.first().copied())
            .or_else(|| st.full.first().copied())
            .map(|s| unsafe { s.as_ref() }.region_begin())
    }
}
