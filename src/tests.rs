// End-to-end scenarios against the process-wide collector. Every scenario
// uses its own node type so pools, identities and finalizer counts cannot
// bleed between tests, and the gate-touching tests serialize on one mutex so
// reader-count assertions stay exact while the rest of the suite runs.

use libc::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, Once};
use std::time::Duration;

use crate::callbacks::{EnumerateCb, RemapCb};
use crate::collector;
use crate::identity::identity_of;
use crate::lock;
use crate::{HardPtr, Lock, Managed, Root, SoftPtr};

fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        crate::initialize();
        // Only forced cycles, so each scenario controls when sweeps happen.
        crate::set_period(Duration::from_millis(0));
    });
}

fn serial() -> MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

macro_rules! linked_node {
    ($name:ident, $counter:ident) => {
        static $counter: AtomicUsize = AtomicUsize::new(0);

        struct $name {
            next: HardPtr,
        }

        impl Drop for $name {
            fn drop(&mut self) {
                $counter.fetch_add(1, Ordering::SeqCst);
            }
        }

        impl Managed for $name {
            const POINTERS: bool = true;

            fn traverse(&self, data: *mut c_void, cb: EnumerateCb) {
                self.next.traverse(data, cb);
            }

            fn remap(&mut self, data: *mut c_void, cb: RemapCb) {
                self.next.remap(data, cb);
            }
        }
    };
}

linked_node!(S1Node, S1_FINALIZED);

#[test]
fn test_s1_basic_reclamation() {
    init();
    let _serial = serial();
    let guard = Lock::new();
    let mut nodes = Vec::new();
    for _ in 0..16 {
        nodes.push(HardPtr::new(S1Node { next: HardPtr::null() }).unwrap());
    }
    let keep: Vec<HardPtr> = nodes[..4].to_vec();
    let roots: Vec<Root> = keep.iter().map(Root::new).collect();
    drop(nodes);
    drop(guard);
    crate::collect(true);
    assert_eq!(S1_FINALIZED.load(Ordering::SeqCst), 12);
    assert_eq!(identity_of::<S1Node>().allocator().used_slots(), 4);
    // The four rooted nodes survive another cycle untouched.
    crate::collect(true);
    assert_eq!(S1_FINALIZED.load(Ordering::SeqCst), 12);
    let guard = Lock::new();
    drop(roots);
    drop(guard);
    crate::collect(true);
    assert_eq!(S1_FINALIZED.load(Ordering::SeqCst), 16);
}

linked_node!(S2Node, S2_FINALIZED);

#[test]
fn test_s2_transitive_marking() {
    init();
    let _serial = serial();
    let guard = Lock::new();
    let c = HardPtr::new(S2Node { next: HardPtr::null() }).unwrap();
    let b = HardPtr::new(S2Node { next: c }).unwrap();
    let a = HardPtr::new(S2Node { next: b }).unwrap();
    let root = Root::new(&a);
    drop(b);
    drop(c);
    drop(guard);
    crate::collect(true);
    // Everything is reachable from the single root.
    assert_eq!(S2_FINALIZED.load(Ordering::SeqCst), 0);
    let guard = Lock::new();
    drop(root);
    drop(guard);
    crate::collect(true);
    assert_eq!(S2_FINALIZED.load(Ordering::SeqCst), 3);
}

linked_node!(S3Node, S3_FINALIZED);

#[test]
fn test_s3_weak_after_sweep() {
    init();
    let _serial = serial();
    let guard = Lock::new();
    let node = HardPtr::new(S3Node { next: HardPtr::null() }).unwrap();
    let weak = SoftPtr::new(&node);
    assert!(weak.upgrade().is_some());
    drop(node);
    drop(guard);
    crate::collect(true);
    assert_eq!(S3_FINALIZED.load(Ordering::SeqCst), 1);
    let guard = Lock::new();
    assert!(weak.upgrade().is_none());
    assert!(HardPtr::from_soft(&weak).is_null());
    // A weak pointer derived from a dead one is null outright.
    let second = weak.clone();
    assert!(second.is_null());
    let mut refreshed = weak.clone();
    refreshed.refresh();
    assert!(refreshed.is_null());
    drop(guard);
}

linked_node!(S4Node, S4_FINALIZED);

#[test]
fn test_s4_back_pressure() {
    init();
    let _serial = serial();
    // One thread allocates through pool churn while another cycles the gate
    // and keeps requesting collections; allocation must keep succeeding.
    crossbeam::thread::scope(|scope| {
        let allocating = scope.spawn(|_| {
            for _ in 0..40 {
                let guard = Lock::new();
                let mut held = Vec::new();
                for _ in 0..250 {
                    held.push(HardPtr::new(S4Node { next: HardPtr::null() }).unwrap());
                }
                drop(held);
                drop(guard);
            }
        });
        let cycling = scope.spawn(|_| {
            for _ in 0..40 {
                let guard = Lock::new();
                drop(guard);
                crate::collect(false);
                std::thread::yield_now();
            }
        });
        allocating.join().unwrap();
        cycling.join().unwrap();
    })
    .unwrap();
    crate::collect(true);
    assert_eq!(S4_FINALIZED.load(Ordering::SeqCst), 10_000);
}

linked_node!(S5Node, S5_FINALIZED);

#[test]
fn test_s5_reentrancy() {
    init();
    let _serial = serial();
    assert_eq!(lock::nesting(), 0);
    let outer = Lock::new();
    let baseline = collector::reader_count();
    assert!(baseline >= 1);
    {
        let _inner = Lock::new();
        assert_eq!(lock::nesting(), 2);
        // The nested level never touched the global gate.
        assert_eq!(collector::reader_count(), baseline);
        let node = HardPtr::new(S5Node { next: HardPtr::null() }).unwrap();
        let root = Root::new(&node);
        drop(root);
    }
    assert_eq!(lock::nesting(), 1);
    assert_eq!(collector::reader_count(), baseline);
    drop(outer);
    assert_eq!(lock::nesting(), 0);
    assert_eq!(collector::reader_count(), baseline - 1);
}

linked_node!(GuardNode, GUARD_FINALIZED);

#[test]
#[cfg(all(unix, any(debug_assertions, feature = "guard_pages")))]
fn test_s6_guard_page_faults() {
    init();
    let _serial = serial();
    let guard = Lock::new();
    let node = HardPtr::new(GuardNode { next: HardPtr::null() }).unwrap();
    let region = identity_of::<GuardNode>()
        .allocator()
        .first_region()
        .unwrap();
    drop(node);
    drop(guard);
    // The first page of a pool region is a guard page; a child process that
    // touches it must die of SIGSEGV.
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            let _ = std::ptr::read_volatile(region as *const u8);
            libc::_exit(0);
        }
        let mut status = 0;
        assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::WTERMSIG(status), libc::SIGSEGV);
    }
}

linked_node!(RootedNode, ROOTED_FINALIZED);

#[test]
fn test_root_round_trip() {
    init();
    let _serial = serial();
    let guard = Lock::new();
    let before = collector::roots_len();
    let node = HardPtr::new(RootedNode { next: HardPtr::null() }).unwrap();
    {
        // A local hard pointer is an unmanaged root.
        let _root = Root::new(&node);
        let (managed, unmanaged) = collector::roots_len();
        assert_eq!((managed, unmanaged), (before.0, before.1 + 1));
    }
    assert_eq!(collector::roots_len(), before);
    {
        // The heap object itself is a managed root.
        let obj = unsafe { &*node.get::<RootedNode>().unwrap() };
        let _root = Root::new(obj);
        let (managed, unmanaged) = collector::roots_len();
        assert_eq!((managed, unmanaged), (before.0 + 1, before.1));
    }
    assert_eq!(collector::roots_len(), before);
    drop(guard);
}

linked_node!(ManagedRootNode, MANAGED_ROOT_FINALIZED);

#[test]
fn test_managed_root_keeps_children() {
    init();
    let _serial = serial();
    let guard = Lock::new();
    let child = HardPtr::new(ManagedRootNode { next: HardPtr::null() }).unwrap();
    let parent = HardPtr::new(ManagedRootNode { next: child }).unwrap();
    let obj = unsafe { &*parent.get::<ManagedRootNode>().unwrap() };
    let root = Root::new(obj);
    drop(child);
    drop(guard);
    crate::collect(true);
    // The managed root is marked in place and its child traced from it.
    assert_eq!(MANAGED_ROOT_FINALIZED.load(Ordering::SeqCst), 0);
    let guard = Lock::new();
    drop(root);
    drop(guard);
    crate::collect(true);
    assert_eq!(MANAGED_ROOT_FINALIZED.load(Ordering::SeqCst), 2);
}

linked_node!(WeakChainNode, WEAK_CHAIN_FINALIZED);

#[test]
fn test_strong_weak_strong_round_trip() {
    init();
    let _serial = serial();
    let guard = Lock::new();
    let node = HardPtr::new(WeakChainNode { next: HardPtr::null() }).unwrap();
    let root = Root::new(&node);
    let weak = SoftPtr::new(&node);
    let back = weak.upgrade().unwrap();
    assert_eq!(back, node);
    assert!(back.is_typeof::<WeakChainNode>());
    // Two weak pointers to one live object share the record.
    let again = SoftPtr::new(&node);
    let from_again = again.upgrade().unwrap();
    assert_eq!(from_again.as_ptr(), node.as_ptr());
    drop(root);
    drop(guard);
}

// Large payload so each pool holds few slots and shrink has work to do.
struct ShrinkNode {
    _payload: [u8; 4096],
}
impl Managed for ShrinkNode {
    const POINTERS: bool = true;
    fn traverse(&self, _data: *mut c_void, _cb: EnumerateCb) {}
    fn remap(&mut self, _data: *mut c_void, _cb: RemapCb) {}
}

#[test]
fn test_shrink_opportunistic_idempotence() {
    init();
    let _serial = serial();
    let guard = Lock::new();
    let mut held = Vec::new();
    let per_pool = identity_of::<ShrinkNode>().allocator().used_slots(); // 0
    assert_eq!(per_pool, 0);
    for _ in 0..200 {
        held.push(HardPtr::new(ShrinkNode { _payload: [0; 4096] }).unwrap());
    }
    let grown = identity_of::<ShrinkNode>().allocator().pool_count();
    assert!(grown >= 2);
    drop(held);
    drop(guard);
    crate::collect(true);
    // Shrink keeps a cushion of one pool's capacity.
    let after_first = identity_of::<ShrinkNode>().allocator().pool_count();
    assert!(after_first < grown);
    assert!(after_first >= 1);
    crate::collect(true);
    // With no allocation in between, another shrink frees nothing more.
    assert_eq!(
        identity_of::<ShrinkNode>().allocator().pool_count(),
        after_first
    );
}

struct Symbol {
    name: u64,
}
impl Managed for Symbol {
    const READONLY: bool = true;
    fn equal(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

#[test]
fn test_equality_through_identity() {
    init();
    let _serial = serial();
    let guard = Lock::new();
    let a = HardPtr::new(Symbol { name: 7 }).unwrap();
    let b = HardPtr::new(Symbol { name: 7 }).unwrap();
    let c = HardPtr::new(Symbol { name: 9 }).unwrap();
    assert_ne!(a.as_ptr(), b.as_ptr());
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a, a);
    drop(guard);
}

linked_node!(RawNode, RAW_FINALIZED);

#[test]
fn test_strong_from_raw_and_type_checks() {
    init();
    let _serial = serial();
    let guard = Lock::new();
    let node = HardPtr::new(RawNode { next: HardPtr::null() }).unwrap();
    let root = Root::new(&node);
    let raw = node.get::<RawNode>().unwrap();
    // Interior pointers resolve to the slot base.
    let interior = (raw as usize + 4) as *const u8;
    let adopted = HardPtr::from_raw(interior).unwrap();
    assert_eq!(adopted.as_ptr(), node.as_ptr());
    assert!(adopted.is_typeof::<RawNode>());
    assert!(matches!(
        adopted.get::<Symbol>(),
        Err(crate::GcError::TypeMismatch)
    ));
    let stack = 5u64;
    assert!(HardPtr::from_raw(&stack as *const u64).is_err());
    drop(root);
    drop(guard);
}

linked_node!(DiscardNode, DISCARD_FINALIZED);

#[test]
fn test_discard_on_failed_initialization() {
    init();
    let _serial = serial();
    let guard = Lock::new();
    let used_before = identity_of::<DiscardNode>().allocator().used_slots();
    let outcome: Result<HardPtr, crate::GcError> =
        HardPtr::new_with::<DiscardNode, crate::GcError, _>(|| Err(crate::GcError::OutOfMemory));
    assert!(outcome.is_err());
    // The abandoned slot went straight back to the free list.
    assert_eq!(
        identity_of::<DiscardNode>().allocator().used_slots(),
        used_before
    );
    assert_eq!(DISCARD_FINALIZED.load(Ordering::SeqCst), 0);
    drop(guard);
}
