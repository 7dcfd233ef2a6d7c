//! Element storage: variable layouts and the host allocator used for halo
//! buffers.

pub mod alloc;
pub mod layout;

pub use alloc::{AllocPolicy, Allocation, Allocator, HostAllocator, CACHE_LINE_BYTES};
pub use layout::{VarLayout, VarShape};

/// Floating-point element type of every variable and halo buffer.
pub type Real = f64;

static_assertions::assert_eq_size!(Real, u64);
