// Root handles. A root is an object the mutator owns outside the heap whose
// pointer fields anchor reachability; registration hands the collector the
// object's address plus the callbacks to walk it. The handle borrows the
// object for its whole lifetime, so the object can neither move nor die
// while registered.

use libc::c_void;
use std::marker::PhantomData;

use crate::collector::Collector;
use crate::identity::{root_shim, traverse_shim, Managed};

/// RAII registration of a root object. Move-only; unregisters on drop.
pub struct Root<'a> {
    obj: *mut c_void,
    _borrow: PhantomData<&'a ()>,
}

impl<'a> Root<'a> {
    /// Register `obj` as a root. Requires the mutator lock; the type must
    /// advertise pointers, otherwise there is nothing to trace from it.
    pub fn new<T: Managed>(obj: &'a T) -> Root<'a> {
        debug_assert!(T::POINTERS, "a root object must carry pointers");
        debug_assert!(crate::lock::locked());
        let ptr = obj as *const T as *mut c_void;
        Collector::register_root(ptr, traverse_shim::<T>, root_shim::<T>);
        Root {
            obj: ptr,
            _borrow: PhantomData,
        }
    }
}

impl<'a> Drop for Root<'a> {
    fn drop(&mut self) {
        if !self.obj.is_null() {
            Collector::unregister_root(self.obj);
        }
    }
}
