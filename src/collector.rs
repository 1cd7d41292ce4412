// The collector singleton. One coarse mutex and two condition variables form
// the multi-reader/single-writer gate between mutators and the worker
// thread; the same mutex guards the source index, the root indexes and the
// allocator list. The worker owns the world whenever the reader count is
// zero and the flag is down.

use libc::c_void;
use log::{debug, trace};
use std::env;
use std::num;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::allocator::Allocator;
use crate::callbacks::{RootCb, TraverseCb};
use crate::config;
use crate::identity::Identity;
use crate::pool::Pool;
use crate::soft_ptr::SoftData;
use crate::GcError;

pub(crate) type SourceRef = NonNull<Pool>;

/// Errors that can be encountered while reading collector configuration.
#[derive(Debug)]
enum InitError {
    Parse(num::ParseIntError),
    Env(env::VarError),
}

/// A root lying inside some pool; marked directly.
struct ManagedRoot {
    obj: *mut c_void,
    src: SourceRef,
}

/// An externally owned root; traversed through its callback. The remap
/// callback is held for the compacting pass.
struct UnmanagedRoot {
    obj: *mut c_void,
    tcb: TraverseCb,
    #[allow(dead_code)]
    rcb: RootCb,
}

struct State {
    /// True when mutators may enter; false while a cycle is pending.
    flag: bool,
    /// Number of mutators currently inside the gate.
    count: usize,
    /// Allocation-failure pressure accumulated since the last cycle.
    requests: usize,
    /// Idle wake interval; zero disables time-triggered cycles.
    period: Duration,
    /// All pools, sorted by arena address.
    sources: Vec<SourceRef>,
    /// The subset of sources whose identity has a traversal callback.
    traversable: Vec<SourceRef>,
    /// Owning list of every allocator ever registered.
    allocators: Vec<Box<Allocator>>,
    managed: Vec<ManagedRoot>,
    unmanaged: Vec<UnmanagedRoot>,
    worker: Option<thread::JoinHandle<()>>,
}

unsafe impl Send for State {}

pub(crate) struct Collector {
    mtx: Mutex<State>,
    readers: Condvar,
    writer: Condvar,
    alive: AtomicBool,
}

/// Context handed to `enumerate` while marking: a snapshot of the source
/// index, valid for the duration of the stopped world.
struct MarkCtx {
    sources: *const SourceRef,
    len: usize,
}

fn singleton() -> &'static Collector {
    static THE_ONE: OnceLock<Collector> = OnceLock::new();
    THE_ONE.get_or_init(|| Collector {
        mtx: Mutex::new(State {
            flag: false,
            count: 0,
            requests: 0,
            period: Duration::from_millis(config::GC_PERIOD_MS),
            sources: Vec::new(),
            traversable: Vec::new(),
            allocators: Vec::new(),
            managed: Vec::new(),
            unmanaged: Vec::new(),
            worker: None,
        }),
        readers: Condvar::new(),
        writer: Condvar::new(),
        alive: AtomicBool::new(true),
    })
}

/// Find the source containing `ptr` in a slice sorted by location.
fn find_source_in(sources: &[SourceRef], ptr: *const c_void) -> Option<SourceRef> {
    let key = ptr as usize;
    let after = sources.partition_point(|s| unsafe { s.as_ref() }.location() as usize <= key);
    if after == 0 {
        return None;
    }
    let candidate = sources[after - 1];
    if unsafe { candidate.as_ref() }.contains(ptr) {
        Some(candidate)
    } else {
        None
    }
}

/// Remove `pool` from a sorted source list, if present.
pub(crate) fn erase_source(list: &mut Vec<SourceRef>, pool: SourceRef) {
    let key = unsafe { pool.as_ref() }.location() as usize;
    if let Ok(at) = list.binary_search_by_key(&key, |s| unsafe { s.as_ref() }.location() as usize) {
        debug_assert!(list[at] == pool);
        list.remove(at);
    }
}

fn insert_sorted(list: &mut Vec<SourceRef>, pool: SourceRef) {
    let key = unsafe { pool.as_ref() }.location() as usize;
    let at = list
        .binary_search_by_key(&key, |s| unsafe { s.as_ref() }.location() as usize)
        .unwrap_or_else(|at| at);
    list.insert(at, pool);
}

impl Collector {
    /// Enter the gate as a mutator. Blocks while a cycle is pending.
    pub(crate) fn lock() -> Result<(), GcError> {
        let c = singleton();
        let mut st = c.mtx.lock().unwrap();
        loop {
            if !c.alive.load(Ordering::SeqCst) {
                return Err(GcError::Shutdown);
            }
            if st.flag {
                break;
            }
            st = c.readers.wait(st).unwrap();
        }
        st.count += 1;
        Ok(())
    }

    /// Leave the gate; the last mutator out wakes a pending worker.
    pub(crate) fn unlock() {
        let c = singleton();
        let notify = {
            let mut st = c.mtx.lock().unwrap();
            debug_assert!(st.count > 0);
            st.count -= 1;
            !st.flag && st.count == 0
        };
        if notify {
            c.writer.notify_one();
        }
    }

    /// Downgrade this reader into a cycle request: leave the gate, demand a
    /// cycle, and re-enter once it has run. Called from allocators that just
    /// failed to grow.
    pub(crate) fn wait() -> Result<(), GcError> {
        let c = singleton();
        {
            let mut st = c.mtx.lock().unwrap();
            debug_assert!(st.count > 0);
            st.flag = false;
            st.count -= 1;
            st.requests += 1;
        }
        c.writer.notify_one();
        let mut st = c.mtx.lock().unwrap();
        loop {
            if !c.alive.load(Ordering::SeqCst) {
                return Err(GcError::Shutdown);
            }
            if st.flag {
                break;
            }
            st = c.readers.wait(st).unwrap();
        }
        st.count += 1;
        Ok(())
    }

    /// Register a new pool as a source (and as traversable when `trav`).
    pub(crate) fn insert_source(src: SourceRef, trav: bool) {
        let c = singleton();
        let mut st = c.mtx.lock().unwrap();
        insert_sorted(&mut st.sources, src);
        if trav {
            insert_sorted(&mut st.traversable, src);
        }
    }

    /// Take ownership of a freshly built allocator. The boxed address stays
    /// stable for the life of the process.
    pub(crate) fn insert_alloc(alloc: Box<Allocator>) {
        let c = singleton();
        let mut st = c.mtx.lock().unwrap();
        st.allocators.push(alloc);
    }

    /// The base address of the slot containing `ptr`, if any pool claims it.
    pub(crate) fn base_ptr(ptr: *mut c_void) -> Option<*mut c_void> {
        let c = singleton();
        let st = c.mtx.lock().unwrap();
        find_source_in(&st.sources, ptr).map(|src| unsafe { src.as_ref() }.base_of(ptr))
    }

    /// The identity of the object containing `ptr`, if any pool claims it.
    pub(crate) fn get_type(ptr: *mut c_void) -> Option<&'static Identity> {
        let c = singleton();
        let st = c.mtx.lock().unwrap();
        find_source_in(&st.sources, ptr).map(|src| unsafe { src.as_ref() }.type_of())
    }

    /// Find or create the weak record for the object containing `ptr`.
    /// The caller must hold the mutator lock so no sweep runs concurrently.
    pub(crate) fn fetch_record(ptr: *mut c_void) -> Option<*mut SoftData> {
        debug_assert!(crate::lock::locked());
        let c = singleton();
        let st = c.mtx.lock().unwrap();
        find_source_in(&st.sources, ptr).map(|src| unsafe { (*src.as_ptr()).fetch(ptr) })
    }

    /// Register a root object. Roots inside a pool are marked directly;
    /// external roots are traversed through their callback.
    pub(crate) fn register_root(obj: *mut c_void, tcb: TraverseCb, rcb: RootCb) {
        debug_assert!(crate::lock::locked());
        let c = singleton();
        let mut st = c.mtx.lock().unwrap();
        let key = obj as usize;
        if let Some(src) = find_source_in(&st.sources, obj) {
            let at = st
                .managed
                .binary_search_by_key(&key, |r| r.obj as usize)
                .unwrap_or_else(|at| at);
            st.managed.insert(at, ManagedRoot { obj, src });
        } else {
            let at = st
                .unmanaged
                .binary_search_by_key(&key, |r| r.obj as usize)
                .unwrap_or_else(|at| at);
            st.unmanaged.insert(at, UnmanagedRoot { obj, tcb, rcb });
        }
    }

    pub(crate) fn unregister_root(obj: *mut c_void) {
        let c = singleton();
        let mut st = c.mtx.lock().unwrap();
        let key = obj as usize;
        if let Ok(at) = st.managed.binary_search_by_key(&key, |r| r.obj as usize) {
            st.managed.remove(at);
        } else if let Ok(at) = st.unmanaged.binary_search_by_key(&key, |r| r.obj as usize) {
            st.unmanaged.remove(at);
        }
    }

    /// Sink for traversal callbacks: classify the pointer and mark its slot.
    unsafe fn enumerate(data: *mut c_void, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        let ctx = &*(data as *const MarkCtx);
        let sources = std::slice::from_raw_parts(ctx.sources, ctx.len);
        match find_source_in(sources, ptr) {
            Some(src) => Pool::mark(src.as_ptr(), ptr),
            None => debug_assert!(false, "traversed pointer is not collector-owned"),
        }
    }

    /// Mark from every root, then traverse gray sets to a fixpoint.
    fn mark_phase(st: &mut State) {
        let sources = st.sources.clone();
        let traversable = st.traversable.clone();
        let ctx = MarkCtx {
            sources: sources.as_ptr(),
            len: sources.len(),
        };
        let data = &ctx as *const MarkCtx as *mut c_void;
        for root in st.unmanaged.iter() {
            unsafe {
                (root.tcb)(root.obj as *const c_void, data, Collector::enumerate);
            }
        }
        for root in st.managed.iter() {
            unsafe {
                Pool::mark(root.src.as_ptr(), root.obj);
            }
        }
        loop {
            let mut found = false;
            for src in traversable.iter() {
                found |= unsafe { Pool::traverse(src.as_ptr(), data, Collector::enumerate) };
            }
            if !found {
                break;
            }
        }
    }

    fn sweep_phase(st: &mut State) {
        let sources = st.sources.clone();
        for src in sources.iter() {
            unsafe {
                Pool::sweep(src.as_ptr());
            }
        }
    }

    /// Release empty pools. Pressure from failed allocations is spread
    /// across allocators proportionally; without pressure every allocator
    /// shrinks opportunistically.
    fn shrink_phase(st: &mut State) -> usize {
        let State {
            allocators,
            sources,
            traversable,
            requests,
            ..
        } = st;
        let mut released = 0;
        if *requests > 0 && !allocators.is_empty() {
            loop {
                let average = (*requests / allocators.len()) + 1;
                let mut freed = 0;
                for alloc in allocators.iter() {
                    freed += alloc.shrink(average, sources, traversable);
                }
                released += freed;
                if freed == 0 {
                    break;
                }
                *requests = requests.saturating_sub(freed);
                if *requests == 0 {
                    break;
                }
            }
        } else {
            for alloc in allocators.iter() {
                released += alloc.shrink(0, sources, traversable);
            }
        }
        *requests = 0;
        released
    }

    /// The worker loop: wait for a request (or the idle period), drain
    /// readers, then run one full cycle with exclusive access.
    fn work(&self) {
        loop {
            let mut st = self.mtx.lock().unwrap();
            if st.period.is_zero() {
                while st.flag {
                    st = self.writer.wait(st).unwrap();
                }
            } else {
                let period = st.period;
                let (guard, timeout) = self
                    .writer
                    .wait_timeout_while(st, period, |s| s.flag)
                    .unwrap();
                st = guard;
                if timeout.timed_out() {
                    st.flag = false;
                }
            }
            while st.count > 0 {
                st = self.writer.wait(st).unwrap();
            }
            // Exclusive now: no mutator is inside the gate.
            let start = Instant::now();
            Collector::mark_phase(&mut st);
            Collector::sweep_phase(&mut st);
            let released = Collector::shrink_phase(&mut st);
            debug!(
                "cycle: {} sources, {} roots, {} pools released, {:?}",
                st.sources.len(),
                st.managed.len() + st.unmanaged.len(),
                released,
                start.elapsed()
            );
            st.flag = true;
            drop(st);
            self.readers.notify_all();
            if !self.alive.load(Ordering::SeqCst) {
                break;
            }
        }
    }
}

fn read_period_env() -> Result<Option<Duration>, InitError> {
    match env::var(config::GC_PERIOD_ENV) {
        Ok(text) => {
            let ms = text.parse::<u64>().map_err(InitError::Parse)?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(InitError::Env(e)),
    }
}

/// Start the collector's worker thread and open the gate. Must be called
/// once before any mutator takes the lock; later calls are no-ops.
pub fn initialize() {
    let c = singleton();
    let mut st = c.mtx.lock().unwrap();
    if st.worker.is_some() {
        return;
    }
    match read_period_env() {
        Ok(Some(period)) => st.period = period,
        Ok(None) => {}
        Err(err) => panic!(
            "expected environment variable {} to be a number of milliseconds: {:?}",
            config::GC_PERIOD_ENV,
            err
        ),
    }
    let handle = thread::Builder::new()
        .name("triton-gc".into())
        .spawn(|| singleton().work());
    match handle {
        Ok(handle) => st.worker = Some(handle),
        Err(err) => panic!("could not start the collector worker: {}", err),
    }
    st.flag = true;
    drop(st);
    c.readers.notify_all();
    trace!("collector: worker started");
}

/// Tear the collector down: stop the worker after one final cycle and wake
/// any stuck waiter so it can observe the shutdown and fail.
pub fn shutdown() {
    let c = singleton();
    let handle = {
        let mut st = c.mtx.lock().unwrap();
        debug_assert!(st.count == 0);
        c.alive.store(false, Ordering::SeqCst);
        st.flag = false;
        st.worker.take()
    };
    c.writer.notify_one();
    if let Some(handle) = handle {
        let _ = handle.join();
    }
    {
        let mut st = c.mtx.lock().unwrap();
        st.flag = true;
    }
    c.readers.notify_all();
}

/// Set the idle wake interval; zero means cycles only run when forced.
pub fn set_period(period: Duration) {
    let c = singleton();
    let mut st = c.mtx.lock().unwrap();
    st.period = period;
}

/// Request a collection cycle. With `wait`, block until the cycle has run;
/// the caller must not hold the mutator lock in that case.
pub fn collect(wait: bool) {
    let c = singleton();
    debug_assert!(!(wait && crate::lock::locked()));
    {
        let mut st = c.mtx.lock().unwrap();
        debug_assert!(st.worker.is_some());
        st.flag = false;
    }
    c.writer.notify_one();
    if wait {
        let mut st = c.mtx.lock().unwrap();
        while !st.flag {
            if !c.alive.load(Ordering::SeqCst) {
                return;
            }
            st = c.readers.wait(st).unwrap();
        }
    }
}

#[cfg(test)]
pub(crate) fn reader_count() -> usize {
    singleton().mtx.lock().unwrap().count
}

#[cfg(test)]
pub(crate) fn roots_len() -> (usize, usize) {
    let st = singleton().mtx.lock().unwrap();
    (st.managed.len(), st.unmanaged.len())
}

#[cfg(test)]
mod collector_tests {
    use super::*;

    #[test]
    fn test_find_source_on_empty_index() {
        assert!(find_source_in(&[], 0x1000 as *const c_void).is_none());
    }

    #[test]
    fn test_singleton_defaults() {
        let c = singleton();
        let st = c.mtx.lock().unwrap();
        assert_eq!(st.requests, 0);
        assert!(st.period <= Duration::from_millis(config::GC_PERIOD_MS) || st.period.is_zero());
    }
}
