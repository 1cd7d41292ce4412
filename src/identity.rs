// Per-type descriptors. An Identity is the collector's view of a dynamic
// type: unit size, a flag byte, and the erased callbacks the pools invoke.
// One Identity exists per Rust type, created lazily and never destroyed.

use bit_field::BitField;
use libc::c_void;
use log::trace;
use std::any::TypeId;
use std::collections::HashMap;
use std::mem;
use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::allocator::Allocator;
use crate::callbacks::*;
use crate::collector::Collector;
use crate::GcError;

/// Contract a type signs to live in collector-managed memory.
///
/// The associated constants are the trait queries the collector consumes;
/// the methods only matter when the matching constant enables them. A type
/// whose value contains `HardPtr` fields must set `POINTERS` and forward
/// `traverse`/`remap` to each field.
pub trait Managed: Sized + 'static {
    /// True when values contain collector-managed pointers.
    const POINTERS: bool = false;
    /// True when values may be moved by a future compacting pass.
    const MOVABLE: bool = false;
    /// True for immutable values; enables the equality callback.
    const READONLY: bool = false;

    /// Feed every managed out-pointer of `self` to `cb`.
    fn traverse(&self, data: *mut c_void, cb: EnumerateCb) {
        let _ = (data, cb);
    }

    /// Rewrite every managed out-pointer of `self` through `cb`.
    fn remap(&mut self, data: *mut c_void, cb: RemapCb) {
        let _ = (data, cb);
    }

    /// Structural equality; consulted only for `READONLY` types.
    fn equal(&self, _other: &Self) -> bool {
        false
    }
}

// Flag byte layout.
const FLAG_MOVABLE: usize = 0;
const FLAG_FINALIZER: usize = 1;
const FLAG_POINTERS: usize = 2;
const FLAG_RELOCATOR: usize = 3;
const FLAG_READONLY: usize = 4;

/// The collector-side descriptor of one dynamic type.
#[derive(Debug)]
pub struct Identity {
    /// Slot size: the type's size rounded up to its alignment, at least one
    /// pointer wide so a free-list node fits.
    unit: usize,
    flags: u8,
    fcb: Option<FinalizeCb>,
    tcb: Option<TraverseCb>,
    rcb: Option<RelocateCb>,
    ecb: Option<EqualityCb>,
    /// Owning allocator, set exactly once at registration.
    alloc: AtomicPtr<Allocator>,
}

unsafe fn finalize_shim<T: Managed>(obj: *mut c_void) {
    debug_assert!(!obj.is_null());
    ptr::drop_in_place(obj as *mut T);
}

pub(crate) unsafe fn traverse_shim<T: Managed>(obj: *const c_void, data: *mut c_void, cb: EnumerateCb) {
    debug_assert!(!obj.is_null());
    (*(obj as *const T)).traverse(data, cb);
}

unsafe fn relocate_shim<T: Managed>(
    orig: *mut c_void,
    dest: *mut c_void,
    data: *mut c_void,
    cb: RemapCb,
) {
    debug_assert!(!orig.is_null() && !dest.is_null());
    ptr::copy_nonoverlapping(orig as *const T, dest as *mut T, 1);
    (*(dest as *mut T)).remap(data, cb);
}

unsafe fn equal_shim<T: Managed>(lhs: *const c_void, rhs: *const c_void) -> bool {
    (*(lhs as *const T)).equal(&*(rhs as *const T))
}

/// Root shim for a specific static type: forwards to the object's `remap`.
pub(crate) unsafe fn root_shim<T: Managed>(obj: *mut c_void, data: *mut c_void, cb: RemapCb) {
    (*(obj as *mut T)).remap(data, cb);
}

/// Slot size for `T`: size rounded up to alignment, never smaller than a
/// pointer.
pub(crate) fn unit_size<T>() -> usize {
    let size = mem::size_of::<T>().max(1);
    let rounded = crate::util::round_up(size, mem::align_of::<T>());
    rounded.max(mem::size_of::<*mut c_void>())
}

impl Identity {
    fn new<T: Managed>() -> Identity {
        let fcb: Option<FinalizeCb> = if mem::needs_drop::<T>() {
            Some(finalize_shim::<T>)
        } else {
            None
        };
        let tcb: Option<TraverseCb> = if T::POINTERS {
            Some(traverse_shim::<T>)
        } else {
            None
        };
        let rcb: Option<RelocateCb> = if T::POINTERS {
            Some(relocate_shim::<T>)
        } else {
            None
        };
        let ecb: Option<EqualityCb> = if T::READONLY {
            Some(equal_shim::<T>)
        } else {
            None
        };
        let mut flags = 0u8;
        flags.set_bit(FLAG_MOVABLE, T::MOVABLE);
        flags.set_bit(FLAG_FINALIZER, fcb.is_some());
        flags.set_bit(FLAG_POINTERS, T::POINTERS);
        flags.set_bit(FLAG_RELOCATOR, rcb.is_some());
        flags.set_bit(FLAG_READONLY, T::READONLY);
        // Pointer-bearing types must be both traversable and relocatable;
        // non-trivially-destructible types must carry a finalizer.
        debug_assert!(!T::POINTERS || (tcb.is_some() && rcb.is_some()));
        debug_assert!(!mem::needs_drop::<T>() || fcb.is_some());
        Identity {
            unit: unit_size::<T>(),
            flags,
            fcb,
            tcb,
            rcb,
            ecb,
            alloc: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    pub fn is_movable(&self) -> bool {
        self.flags.get_bit(FLAG_MOVABLE)
    }

    pub fn has_finalizer(&self) -> bool {
        self.flags.get_bit(FLAG_FINALIZER)
    }

    pub fn has_traverser(&self) -> bool {
        self.flags.get_bit(FLAG_POINTERS)
    }

    pub fn has_relocator(&self) -> bool {
        self.flags.get_bit(FLAG_RELOCATOR)
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.get_bit(FLAG_READONLY)
    }

    pub(crate) fn traverser(&self) -> Option<TraverseCb> {
        self.tcb
    }

    /// Relocation callback; validated at construction but not yet invoked,
    /// the collector does not move objects.
    pub fn relocator(&self) -> Option<RelocateCb> {
        self.rcb
    }

    /// Run the finalizer on `obj`, if there is one.
    pub(crate) unsafe fn finalize(&self, obj: *mut c_void) {
        if let Some(fcb) = self.fcb {
            debug_assert!(!obj.is_null());
            fcb(obj);
        }
    }

    pub(crate) fn allocator(&self) -> &Allocator {
        let ptr = self.alloc.load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        unsafe { &*ptr }
    }

    /// Allocate one uninitialized slot of this type. The caller must hold
    /// the mutator lock; on pool exhaustion the allocator waits across one
    /// collection cycle before giving up.
    pub fn allocate(&self) -> Result<NonNull<c_void>, GcError> {
        debug_assert!(crate::lock::locked());
        self.allocator().allocate()
    }

    /// Non-erroring variant of `allocate`.
    pub fn allocate_opt(&self) -> Option<NonNull<c_void>> {
        self.allocate().ok()
    }

    /// Give back a slot whose object was never fully initialized. A no-op
    /// for finalizer-less types; their slot is reclaimed by the next sweep.
    pub fn discarded(&self, addr: *mut c_void) {
        debug_assert!(crate::lock::locked());
        if self.has_finalizer() {
            self.allocator().discarded(addr);
        }
    }

    /// The identity owning `obj`, if the address lies in any pool.
    pub fn fetch(obj: *const c_void) -> Result<&'static Identity, GcError> {
        Identity::fetch_opt(obj).ok_or(GcError::NotOwned)
    }

    /// Nothrow variant of `fetch`.
    pub fn fetch_opt(obj: *const c_void) -> Option<&'static Identity> {
        Collector::get_type(obj as *mut c_void)
    }

    /// Structural equality through the equality callback. Types without one
    /// are never equal.
    pub fn equal(&self, lhs: *const c_void, rhs: *const c_void) -> bool {
        debug_assert!(lhs != rhs);
        match self.ecb {
            Some(ecb) => {
                debug_assert!(!lhs.is_null() && !rhs.is_null());
                unsafe { ecb(lhs, rhs) }
            }
            None => false,
        }
    }

    /// Identity of `self` as a stable address, for identity comparison.
    pub fn id_addr(&self) -> usize {
        self as *const Identity as usize
    }
}

fn registry() -> &'static Mutex<HashMap<TypeId, &'static Identity>> {
    static REGISTRY: OnceLock<Mutex<HashMap<TypeId, &'static Identity>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The process-wide identity for `T`, created on first use.
pub fn identity_of<T: Managed>() -> &'static Identity {
    let mut reg = registry().lock().unwrap();
    if let Some(&id) = reg.get(&TypeId::of::<T>()) {
        return id;
    }
    let id: &'static Identity = Box::leak(Box::new(Identity::new::<T>()));
    let alloc = Box::new(Allocator::new(id));
    id.alloc
        .store(&*alloc as *const Allocator as *mut Allocator, Ordering::Release);
    Collector::insert_alloc(alloc);
    reg.insert(TypeId::of::<T>(), id);
    trace!(
        "identity: registered type (unit {} bytes, flags {:#07b})",
        id.unit,
        id.flags
    );
    id
}

#[cfg(test)]
mod identity_tests {
    use super::*;

    struct Plain {
        _x: u64,
    }
    impl Managed for Plain {}

    struct Finalized {
        _v: Vec<u8>,
    }
    impl Managed for Finalized {}

    struct Linked {
        _next: *mut c_void,
    }
    impl Managed for Linked {
        const POINTERS: bool = true;
        fn traverse(&self, _data: *mut c_void, _cb: EnumerateCb) {}
        fn remap(&mut self, _data: *mut c_void, _cb: RemapCb) {}
    }

    #[test]
    fn test_unit_size_rounding() {
        assert_eq!(unit_size::<u8>(), mem::size_of::<*mut c_void>());
        assert_eq!(unit_size::<u64>(), 8);
        #[repr(align(16))]
        struct Wide(u8);
        assert_eq!(unit_size::<Wide>(), 16);
        assert_eq!(unit_size::<[u8; 17]>(), 17);
    }

    #[test]
    fn test_plain_flags() {
        let id = identity_of::<Plain>();
        assert!(!id.has_finalizer());
        assert!(!id.has_traverser());
        assert!(!id.has_relocator());
        assert!(!id.is_readonly());
        assert_eq!(id.unit(), 8);
    }

    #[test]
    fn test_finalizer_from_drop_glue() {
        let id = identity_of::<Finalized>();
        assert!(id.has_finalizer());
        assert!(!id.has_traverser());
    }

    #[test]
    fn test_pointer_type_flags() {
        let id = identity_of::<Linked>();
        assert!(id.has_traverser());
        assert!(id.has_relocator());
        assert!(id.relocator().is_some());
        assert!(!id.has_finalizer());
    }

    #[test]
    fn test_identity_is_singleton() {
        let a = identity_of::<Plain>() as *const Identity;
        let b = identity_of::<Plain>() as *const Identity;
        assert_eq!(a, b);
    }

    #[test]
    fn test_equal_without_callback() {
        let id = identity_of::<Plain>();
        let x = 1u64;
        let y = 2u64;
        assert!(!id.equal(
            &x as *const u64 as *const c_void,
            &y as *const u64 as *const c_void
        ));
    }
}
