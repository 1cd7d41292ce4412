// Type-erased callback signatures shared between identities, pools, the
// collector and the pointer types. The per-type versions are generated as
// monomorphic shims in identity.rs.

use libc::c_void;

/// Runs an object's destructor in place.
pub type FinalizeCb = unsafe fn(obj: *mut c_void);

/// Sink invoked once per out-pointer discovered during traversal. `data` is
/// collector context threaded through unchanged.
pub type EnumerateCb = unsafe fn(data: *mut c_void, ptr: *mut c_void);

/// Walks the pointer-bearing fields of `obj`, feeding each to `cb`.
pub type TraverseCb = unsafe fn(obj: *const c_void, data: *mut c_void, cb: EnumerateCb);

/// Maps an old object address to its new location. Reserved for compaction.
pub type RemapCb = unsafe fn(data: *mut c_void, ptr: *mut c_void) -> *mut c_void;

/// Rewrites the pointer fields of a root object through `cb`.
pub type RootCb = unsafe fn(obj: *mut c_void, data: *mut c_void, cb: RemapCb);

/// Moves an object from `orig` to `dest` and rewrites its pointers through
/// `cb`. Reserved for compaction.
pub type RelocateCb =
    unsafe fn(orig: *mut c_void, dest: *mut c_void, data: *mut c_void, cb: RemapCb);

/// Structural equality between two objects of the same identity.
pub type EqualityCb = unsafe fn(lhs: *const c_void, rhs: *const c_void) -> bool;
