//! Rank grid, neighbor table, halo buffers and the message layer under them.

pub mod communicator;
pub mod halo_buf;
pub mod halo_buffers;
pub mod topology;

pub use communicator::{Communicator, NoComm, RayonComm, ShmKey, ShmSegment, Wait};
#[cfg(feature = "mpi-support")]
pub use communicator::MpiComm;
pub use halo_buf::{slab, BufDir, HaloBuf, Ownership};
pub use halo_buffers::{ExchangeStats, HaloBuffers, NeighborBufs};
pub use topology::{NeighborInfo, RankTopology};
