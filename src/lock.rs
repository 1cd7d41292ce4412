// The mutator lock. Reentrant per thread: a thread-local nesting counter
// decides when to actually touch the collector's reader gate, so allocation
// helpers can take the lock again inside an already locked region.

use std::cell::Cell;
use std::marker::PhantomData;
#[cfg(any(feature = "gc_debug_mutex", debug_assertions))]
use std::thread::{self, ThreadId};

use crate::collector::Collector;

thread_local! {
    static LOCK_COUNT: Cell<usize> = Cell::new(0);
}

/// RAII guard for one nesting level of the mutator lock. Only the outermost
/// guard on a thread enters and leaves the global gate. Not sendable; the
/// level acquired on a thread must be released on it.
pub struct Lock {
    _not_send: PhantomData<*mut ()>,
    #[cfg(any(feature = "gc_debug_mutex", debug_assertions))]
    owner: ThreadId,
}

impl Lock {
    /// Acquire the mutator lock, blocking while a collection cycle is
    /// pending.
    ///
    /// # Panics
    /// Panics when the collector has been shut down; a waiter cannot make
    /// progress after teardown.
    pub fn new() -> Lock {
        let nesting = LOCK_COUNT.with(|count| {
            let n = count.get();
            count.set(n + 1);
            n
        });
        if nesting == 0 {
            if let Err(err) = Collector::lock() {
                LOCK_COUNT.with(|count| count.set(count.get() - 1));
                panic!("mutator lock failed: {}", err);
            }
        }
        Lock {
            _not_send: PhantomData,
            #[cfg(any(feature = "gc_debug_mutex", debug_assertions))]
            owner: thread::current().id(),
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        #[cfg(any(feature = "gc_debug_mutex", debug_assertions))]
        debug_assert!(self.owner == thread::current().id());
        let nesting = LOCK_COUNT.with(|count| {
            let n = count.get();
            debug_assert!(n > 0);
            count.set(n - 1);
            n - 1
        });
        if nesting == 0 {
            Collector::unlock();
        }
    }
}

impl Default for Lock {
    fn default() -> Lock {
        Lock::new()
    }
}

/// Whether the calling thread currently holds the mutator lock.
pub fn locked() -> bool {
    LOCK_COUNT.with(|count| count.get() > 0)
}

/// Current nesting depth on the calling thread.
pub fn nesting() -> usize {
    LOCK_COUNT.with(|count| count.get())
}
