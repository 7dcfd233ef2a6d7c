//! Dimension tuples and the dimension catalog every other component builds on.

pub mod catalog;
pub mod tuple;

pub use catalog::{DimCatalog, DimKind, DomainDim};
pub use tuple::{DimTuple, Idx};

/// Round `n` up to a multiple of `mult` (no-op when `mult <= 1`).
#[inline]
pub fn round_up(n: Idx, mult: Idx) -> Idx {
    if mult <= 1 {
        n
    } else {
        ceil_div(n, mult) * mult
    }
}

/// Ceiling division for non-negative `n` and positive `d`; 0 when `d <= 0`.
#[inline]
pub fn ceil_div(n: Idx, d: Idx) -> Idx {
    use num_traits::Zero;
    if d <= Idx::zero() {
        0
    } else {
        (n + d - 1).div_euclid(d)
    }
}
