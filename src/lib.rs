#![cfg_attr(docsrs, feature(doc_cfg))]
//! # stencil-tiling
//!
//! stencil-tiling is the scheduling core of a distributed finite-difference
//! ("stencil") engine. The update kernels come from an external stencil
//! compiler; this crate decides how the global problem is cut up across
//! ranks, thread levels and tiles, and keeps the halos of neighboring ranks
//! consistent.
//!
//! ## Features
//! - Dimension catalog and named dimension tuples (step, domain and misc dims)
//! - Multi-level tile-size resolution: local domain, region, block,
//!   mini-block and sub-block, aligned to the cluster shape, with temporal
//!   (step-dimension) tiling and traversal-order groups
//! - Two-level nested thread layout (region threads times block threads) on
//!   rayon pools, with nesting-level checks
//! - Cartesian rank grid with `{-1, 0, +1}^d` neighbor table, halo buffers
//!   per variable and neighbor, and shared-memory halo buffers between
//!   co-located ranks
//! - Pluggable communication backends (serial, in-process Rayon, MPI)
//! - A `Solution` façade with prepare/end lifecycle and auto-tuner hooks
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! stencil-tiling = "0.3"
//! # Optional features:
//! # features = ["mpi-support", "strict-invariants"]
//! ```
//!
//! ## Sentinels
//! A size of `0` always means "inherit or compute": an unset region inherits
//! the local-domain size, an unset block the region size, and so on down.
//! Missing neighbors at the edge of the rank grid are `None`, never errors.

// Re-export our major subsystems:
pub mod comm;
pub mod data;
pub mod debug_invariants;
pub mod dims;
pub mod settings;
pub mod solution;
pub mod stencil;
pub mod threads;
pub mod tiling_error;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::comm::{
        BufDir, Communicator, ExchangeStats, HaloBuf, HaloBuffers, NeighborInfo, NoComm,
        RankTopology, RayonComm, Wait,
    };
    pub use crate::data::{AllocPolicy, Allocator, HostAllocator, Real, VarLayout, VarShape};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::dims::{DimCatalog, DimKind, DimTuple, Idx};
    pub use crate::settings::{
        adjust_settings, resolve_subsets, LevelCounts, SubsetReport, TileSettings, TilingLevel,
        TilingPlan,
    };
    pub use crate::solution::{setup_rank, KernelEnv, Solution, TrialReport, TuningTarget};
    pub use crate::stencil::StencilDescriptor;
    pub use crate::threads::{compute_layout, NestedThreads, ThreadLayout};
    pub use crate::tiling_error::TilingError;
}
