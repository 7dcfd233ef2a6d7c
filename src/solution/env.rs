//! Explicitly constructed run-time environment shared by solutions.

use std::sync::Arc;

use crate::comm::{Communicator, NoComm};
use crate::data::{Allocator, HostAllocator};

/// Owns the communicator, the allocator and the host thread count.
///
/// Build one per process (per rank for in-process universes) and share it
/// between solutions through an `Arc`.
pub struct KernelEnv<C: Communicator = NoComm> {
    comm: C,
    allocator: Arc<dyn Allocator>,
    host_threads: usize,
}

impl<C: Communicator> std::fmt::Debug for KernelEnv<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelEnv")
            .field("rank", &self.comm.rank())
            .field("num_ranks", &self.comm.size())
            .field("host_threads", &self.host_threads)
            .finish()
    }
}

impl KernelEnv<NoComm> {
    /// Single-rank environment.
    pub fn single() -> Self {
        Self::new(NoComm)
    }
}

impl<C: Communicator> KernelEnv<C> {
    pub fn new(comm: C) -> Self {
        let host_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        log::debug!(
            "env: rank {} of {}, {host_threads} host thread(s)",
            comm.rank(),
            comm.size()
        );
        Self {
            comm,
            allocator: Arc::new(HostAllocator::new()),
            host_threads,
        }
    }

    /// Override the detected host parallelism.
    pub fn with_host_threads(mut self, n: usize) -> Self {
        self.host_threads = n.max(1);
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn allocator(&self) -> &dyn Allocator {
        self.allocator.as_ref()
    }

    pub fn host_threads(&self) -> usize {
        self.host_threads
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn num_ranks(&self) -> usize {
        self.comm.size()
    }

    pub fn global_barrier(&self) {
        log::trace!("rank {}: barrier", self.comm.rank());
        self.comm.barrier();
    }
}
