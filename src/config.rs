// Build-time configuration for the collector. Override points are cargo
// features; everything else is a plain constant.

/// Minimum number of slots a pool must hold, regardless of how many pages
/// that takes.
pub const MIN_POOL: usize = 8 * core::mem::size_of::<usize>();

/// Maximum number of pages to use for the slots of a pool. MIN_POOL wins if
/// the two conflict.
#[cfg(not(feature = "small_pools"))]
pub const MAX_POOL: usize = 64;
#[cfg(feature = "small_pools")]
pub const MAX_POOL: usize = 1;

/// Default time between unforced collection cycles, in milliseconds. Zero
/// disables time-triggered cycles.
pub const GC_PERIOD_MS: u64 = 1000;

/// Environment variable overriding `GC_PERIOD_MS` at `initialize()` time.
pub const GC_PERIOD_ENV: &str = "TRITON_GC_PERIOD_MS";

/// Whether pool regions carry no-access pages around the header and arena.
pub const GUARD_PAGES: bool = cfg!(any(feature = "guard_pages", debug_assertions));

/// Whether the mutator lock checks that lock and unlock happen on the same
/// thread.
pub const DEBUG_MUTEX: bool = cfg!(any(feature = "gc_debug_mutex", debug_assertions));
