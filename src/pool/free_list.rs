// Intrusive LIFO of free slots, threaded through the slot memory itself.
// A slot on this list is by definition uninitialized, so its first
// pointer-width bytes are ours to use as the link.

use libc::c_void;
use std::mem;

use super::arena::Arena;
use crate::util::add_offset;

struct Node {
    next: *mut Node,
}

/// LIFO stack of unallocated slots. `available()` equals the list length at
/// all times; push and pop are O(1).
pub struct FreeList {
    head: *mut Node,
    space: usize,
}

unsafe impl Send for FreeList {}

impl FreeList {
    /// Bytes a slot must have for the intrusive link; the blueprint's lower
    /// bound on the unit size.
    pub const fn node_size() -> usize {
        mem::size_of::<*mut Node>()
    }

    /// Thread every slot of the arena onto the list, front to back, so the
    /// first pop hands out the lowest address.
    pub fn new(store: &Arena) -> FreeList {
        let head = store.front() as *mut Node;
        let mut slot = store.front();
        unsafe {
            loop {
                let current = slot as *mut Node;
                slot = add_offset(slot, store.unit());
                if (slot as usize) < store.back() as usize {
                    (*current).next = slot as *mut Node;
                } else {
                    debug_assert!(slot == store.back());
                    (*current).next = std::ptr::null_mut();
                    break;
                }
            }
        }
        FreeList {
            head,
            space: store.capacity(),
        }
    }

    pub fn pop(&mut self) -> *mut c_void {
        debug_assert!(!self.full());
        self.space -= 1;
        let node = self.head;
        self.head = unsafe { (*node).next };
        node as *mut c_void
    }

    pub fn push(&mut self, slot: *mut c_void) {
        let node = slot as *mut Node;
        unsafe {
            (*node).next = self.head;
        }
        self.head = node;
        self.space += 1;
    }

    pub fn available(&self) -> usize {
        self.space
    }

    /// True when no free slots remain, i.e. the owning pool is full.
    pub fn full(&self) -> bool {
        self.space == 0
    }

    /// Walk the list, checking every node lies in the arena and counting
    /// nodes. Debug validation used by pool assertions.
    #[cfg(test)]
    pub fn validate(&self, store: &Arena) -> usize {
        let mut count = 0;
        let mut node = self.head;
        while !node.is_null() {
            assert!(store.contains(node as *const c_void));
            assert_eq!(store.base_of(node as *mut c_void), node as *mut c_void);
            count += 1;
            assert!(count <= store.capacity());
            node = unsafe { (*node).next };
        }
        count
    }
}
