//! TilingError: Unified error type for stencil-tiling public APIs
//!
//! Configuration and unresolved-size problems abort the current
//! `prepare_solution` or tuning trial with one of these variants. Missing
//! neighbors are never reported here: they are `None` values.

use thiserror::Error;

use crate::dims::DimKind;

/// Unified error type for stencil-tiling operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TilingError {
    /// A dimension of the wrong kind was passed to an API.
    #[error("Error in {func}(): dimension '{dim}' is {kind}, which is not allowed")]
    WrongDimKind {
        func: String,
        dim: String,
        kind: DimKind,
    },
    /// A dimension name that the catalog (or a tuple) does not know.
    #[error("Error in {func}(): unknown dimension '{dim}'")]
    UnknownDim { func: String, dim: String },
    /// Duplicate or otherwise malformed dimension declaration.
    #[error("Invalid dimension declaration: {0}")]
    InvalidDims(String),
    /// A settings option name that is not recognised.
    #[error("Unknown settings option '{0}'")]
    UnknownOption(String),
    /// A recognised option with a value that does not parse.
    #[error("Invalid value '{value}' for settings option '{name}'")]
    InvalidOptionValue { name: String, value: String },
    /// An API that needs a prepared solution was called too early.
    #[error("Error: '{0}()' called before calling 'prepare_solution()'")]
    NotPrepared(&'static str),
    /// A tile level was left at zero where a positive size is required.
    #[error("Unresolved {level} size in '{dim}' dimension (value {size})")]
    UnresolvedSize {
        level: &'static str,
        dim: String,
        size: i64,
    },
    /// A resolved size is not a multiple of the cluster shape.
    #[error("{level} size {size} in '{dim}' dimension is not a multiple of the cluster size {mult}")]
    NotMultiple {
        level: &'static str,
        dim: String,
        size: i64,
        mult: i64,
    },
    /// A smaller tile level is larger than the level that contains it.
    #[error("{inner} size {inner_size} exceeds {outer} size {outer_size} in '{dim}' dimension")]
    NestingViolation {
        outer: &'static str,
        inner: &'static str,
        dim: String,
        outer_size: i64,
        inner_size: i64,
    },
    /// Rank index outside the configured rank count.
    #[error("Rank index {index} in '{dim}' dimension is outside [0, {count})")]
    InvalidRankIndex { dim: String, index: i64, count: i64 },
    /// Rank count that is not positive.
    #[error("Number of ranks in '{dim}' dimension must be positive, got {count}")]
    InvalidRankCount { dim: String, count: i64 },
    /// The rank grid does not match the communicator.
    #[error("Rank grid holds {grid} ranks but the communicator has {comm}")]
    RankCountMismatch { grid: i64, comm: usize },
    /// Explicit rank indices that do not linearise to this rank.
    #[error("Rank indices {indices} linearise to rank {found}, but this is rank {expected}")]
    RankIndexMismatch {
        indices: String,
        expected: usize,
        found: usize,
    },
    /// Neither a global nor a local domain size was given.
    #[error("Domain size in '{0}' dimension is not set (global and local sizes are both 0)")]
    DomainSizeMissing(String),
    /// A thread-count setter was called at the wrong parallel nesting level.
    #[error("{setter}() called at nesting level {found}, expected level {expected}")]
    ThreadNesting {
        setter: &'static str,
        expected: usize,
        found: usize,
    },
    /// A rayon thread pool could not be built.
    #[error("Failed to configure thread pool: {0}")]
    ThreadPool(String),
    /// Allocation failure; fatal for the current solution.
    #[error("Failed to allocate {nbytes} bytes with policy {policy}: {reason}")]
    Alloc {
        nbytes: usize,
        policy: String,
        reason: String,
    },
    /// The shared-memory segment of a co-located neighbor was not usable.
    #[error("Failed to attach shared-memory halo buffer from rank {owner} for var '{var}': {reason}")]
    ShmAttach {
        owner: usize,
        var: String,
        reason: String,
    },
    /// Communication failed with a neighbor.
    #[error("Communication error with rank {neighbor}: {reason}")]
    CommError { neighbor: usize, reason: String },
    /// A buffer access outside the buffer or with a mismatched length.
    #[error("Halo buffer '{name}' holds {len} elements, access of {requested}")]
    BufferSize {
        name: String,
        len: usize,
        requested: usize,
    },
    /// Constants from the stencil compiler that this build cannot use.
    #[error("Invalid stencil constants: {0}")]
    InvalidStencil(String),
}
