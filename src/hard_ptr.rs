// Strong pointers: pointer-sized owning handles pairing a slot base address
// with the identity of its type. A hard pointer does not by itself keep the
// object alive; reachability flows from registered roots, and a hard
// pointer is what roots and traced fields hold.

use libc::c_void;
use std::ptr;

use crate::callbacks::{EnumerateCb, RemapCb};
use crate::collector::Collector;
use crate::identity::{identity_of, Identity, Managed};
use crate::soft_ptr::SoftPtr;
use crate::GcError;

/// Type-erased strong pointer. Either both fields are null/absent, or `ptr`
/// is the base of a slot owned by a pool of `ty`.
#[derive(Clone, Copy, Debug)]
pub struct HardPtr {
    ptr: *mut c_void,
    ty: Option<&'static Identity>,
}

unsafe impl Send for HardPtr {}
unsafe impl Sync for HardPtr {}

/// Backs out an allocation when in-place initialization fails.
struct DiscardGuard {
    id: &'static Identity,
    slot: *mut c_void,
    armed: bool,
}

impl Drop for DiscardGuard {
    fn drop(&mut self) {
        if self.armed {
            self.id.discarded(self.slot);
        }
    }
}

impl HardPtr {
    pub fn null() -> HardPtr {
        HardPtr { ptr: ptr::null_mut(), ty: None }
    }

    /// Allocate a slot for `value` and move it in. Requires the mutator
    /// lock.
    pub fn new<T: Managed>(value: T) -> Result<HardPtr, GcError> {
        debug_assert!(crate::lock::locked());
        let id = identity_of::<T>();
        let slot = id.allocate()?;
        unsafe {
            ptr::write(slot.as_ptr() as *mut T, value);
        }
        Ok(HardPtr { ptr: slot.as_ptr(), ty: Some(id) })
    }

    /// Allocate a slot and initialize it with `init`; when `init` fails the
    /// slot is handed back to the allocator before the error surfaces.
    pub fn new_with<T, E, F>(init: F) -> Result<HardPtr, E>
    where
        T: Managed,
        E: From<GcError>,
        F: FnOnce() -> Result<T, E>,
    {
        debug_assert!(crate::lock::locked());
        let id = identity_of::<T>();
        let slot = id.allocate()?;
        let mut guard = DiscardGuard { id, slot: slot.as_ptr(), armed: true };
        let value = init()?;
        unsafe {
            ptr::write(slot.as_ptr() as *mut T, value);
        }
        guard.armed = false;
        Ok(HardPtr { ptr: slot.as_ptr(), ty: Some(id) })
    }

    /// Adopt a raw pointer into a collector-owned object. The address may be
    /// interior; the handle stores the slot base. Fails when no source
    /// claims the address.
    pub fn from_raw<T>(obj: *const T) -> Result<HardPtr, GcError> {
        if obj.is_null() {
            return Ok(HardPtr::null());
        }
        let raw = obj as *mut c_void;
        let base = Collector::base_ptr(raw).ok_or(GcError::NotOwned)?;
        let ty = Collector::get_type(base).ok_or(GcError::NotOwned)?;
        Ok(HardPtr { ptr: base, ty: Some(ty) })
    }

    /// Nothrow variant of `from_raw`: unknown addresses become null.
    pub fn from_raw_opt<T>(obj: *const T) -> HardPtr {
        HardPtr::from_raw(obj).unwrap_or_else(|_| HardPtr::null())
    }

    /// Recover a strong pointer from a weak one; null if the target was
    /// reclaimed. Requires the mutator lock.
    pub fn from_soft(soft: &SoftPtr) -> HardPtr {
        soft.upgrade().unwrap_or_else(HardPtr::null)
    }

    pub(crate) fn from_parts(ptr: *mut c_void, ty: &'static Identity) -> HardPtr {
        debug_assert!(!ptr.is_null());
        HardPtr { ptr, ty: Some(ty) }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr
    }

    /// Whether the pointee's identity is the one registered for `T`.
    pub fn is_typeof<T: Managed>(&self) -> bool {
        match self.ty {
            Some(ty) => ptr::eq(ty, identity_of::<T>()),
            None => false,
        }
    }

    /// The pointee as `T`. Fails when the stored identity is not `T`'s.
    pub fn get<T: Managed>(&self) -> Result<*mut T, GcError> {
        if self.is_typeof::<T>() {
            Ok(self.ptr as *mut T)
        } else {
            Err(GcError::TypeMismatch)
        }
    }

    /// Nothrow variant of `get`: mismatches become null.
    pub fn get_opt<T: Managed>(&self) -> *mut T {
        self.get::<T>().unwrap_or(ptr::null_mut())
    }

    pub fn get_identity(&self) -> Option<&'static Identity> {
        self.ty
    }

    /// Feed the pointee to a traversal sink. The shape every containing
    /// object's `Managed::traverse` reduces to.
    pub fn traverse(&self, data: *mut c_void, cb: EnumerateCb) {
        if !self.ptr.is_null() {
            unsafe {
                cb(data, self.ptr);
            }
        }
    }

    /// Rewrite the pointee address through a remap callback.
    pub fn remap(&mut self, data: *mut c_void, cb: RemapCb) {
        if !self.ptr.is_null() {
            self.ptr = unsafe { cb(data, self.ptr) };
        }
    }
}

impl Default for HardPtr {
    fn default() -> HardPtr {
        HardPtr::null()
    }
}

impl PartialEq for HardPtr {
    /// Same address, or same identity and the identity's equality callback
    /// accepts the pair.
    fn eq(&self, other: &HardPtr) -> bool {
        if self.ptr == other.ptr {
            return true;
        }
        if self.ptr.is_null() || other.ptr.is_null() {
            return false;
        }
        match (self.ty, other.ty) {
            (Some(a), Some(b)) if ptr::eq(a, b) => a.equal(self.ptr, other.ptr),
            _ => false,
        }
    }
}

impl Eq for HardPtr {}

/// A hard pointer is itself a pointer-bearing value, so objects built from
/// hard-pointer fields can forward to these and a local hard pointer can be
/// registered as a root directly.
impl Managed for HardPtr {
    const POINTERS: bool = true;

    fn traverse(&self, data: *mut c_void, cb: EnumerateCb) {
        HardPtr::traverse(self, data, cb);
    }

    fn remap(&mut self, data: *mut c_void, cb: RemapCb) {
        HardPtr::remap(self, data, cb);
    }
}

#[cfg(test)]
mod hard_ptr_tests {
    use super::*;

    #[test]
    fn test_null_handle() {
        let p = HardPtr::null();
        assert!(p.is_null());
        assert!(p.get_identity().is_none());
        assert!(!p.is_typeof::<HardPtr>());
        assert!(p.get::<HardPtr>().is_err());
        assert_eq!(p, HardPtr::default());
    }

    #[test]
    fn test_from_raw_unknown_address() {
        let local = 17u64;
        assert!(matches!(
            HardPtr::from_raw(&local as *const u64),
            Err(GcError::NotOwned)
        ));
        assert!(HardPtr::from_raw_opt(&local as *const u64).is_null());
        assert!(HardPtr::from_raw(ptr::null::<u64>()).unwrap().is_null());
    }

    #[test]
    fn test_equality_on_nulls() {
        assert_eq!(HardPtr::null(), HardPtr::null());
    }
}
