//! Thread allocation for nested region/block parallelism.

pub mod layout;
pub mod nested;

pub use layout::{compute_layout, ThreadLayout};
pub use nested::{nest_level, NestedThreads};
