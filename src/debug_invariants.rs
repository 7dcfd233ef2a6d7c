use crate::tiling_error::TilingError;

/// Structures whose internal consistency can be re-checked after mutation
/// (resolved settings, rank topology).
pub trait DebugInvariants {
    /// Assert invariants in debug builds or with `strict-invariants`.
    fn debug_assert_invariants(&self);
    /// Check invariants and return the first violation found.
    fn validate_invariants(&self) -> Result<(), TilingError>;
}

/// `Ok` when `holds`, else an `InvalidDims` error naming the broken
/// invariant of `what`.
pub fn ensure<F>(holds: bool, what: &str, detail: F) -> Result<(), TilingError>
where
    F: FnOnce() -> String,
{
    if holds {
        Ok(())
    } else {
        Err(TilingError::InvalidDims(format!("{what}: {}", detail())))
    }
}

/// Run a fallible check and panic on error when invariant checking is on.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $what:literal) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $what, ": {}"), e);
        }
    };
}
