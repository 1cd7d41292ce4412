//! A precise, stop-the-world, mark-sweep garbage collector.
//!
//! Objects live in virtual-memory pools of fixed-size slots, one allocator
//! per dynamic type. Mutator threads share a reentrant lock with a single
//! worker thread that marks from explicitly registered roots, traverses
//! pointer-bearing objects to a fixpoint, sweeps and shrinks. Strong
//! pointers name objects; weak pointers observe them across collection
//! through refcounted records.
//!
//! Typical use: register types by implementing [`Managed`], call
//! [`initialize`] once, then allocate through [`HardPtr::new`] while holding
//! a [`Lock`], keeping anything that must survive reachable from a [`Root`].

use thiserror::Error;

mod allocator;
mod callbacks;
mod collector;
pub mod config;
mod hard_ptr;
mod identity;
mod lock;
mod pool;
mod root;
mod soft_ptr;
mod util;
mod vmem;

#[cfg(test)]
mod tests;

pub use callbacks::{
    EnumerateCb, EqualityCb, FinalizeCb, RelocateCb, RemapCb, RootCb, TraverseCb,
};
pub use collector::{collect, initialize, set_period, shutdown};
pub use hard_ptr::HardPtr;
pub use identity::{identity_of, Identity, Managed};
pub use lock::{locked, nesting, Lock};
pub use root::Root;
pub use soft_ptr::SoftPtr;

/// Failures the collector surfaces to callers. Invariant violations are
/// debug assertions instead, and weak-pointer operations never fail.
#[derive(Debug, Error)]
pub enum GcError {
    /// Virtual memory could not be reserved, even after waiting out a
    /// collection cycle.
    #[error("out of memory")]
    OutOfMemory,
    /// The address is not inside any collector-owned pool.
    #[error("address is not collector-owned")]
    NotOwned,
    /// The object's identity is not the requested type's.
    #[error("type mismatch")]
    TypeMismatch,
    /// The collector was torn down while the caller was waiting on it.
    #[error("collector destroyed")]
    Shutdown,
}
