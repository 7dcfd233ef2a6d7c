//! Thin façade over intra-process (Rayon) or inter-process (MPI) message passing.
//!
//! Messages are contiguous byte slices. All handles are waitable but
//! non-blocking; the halo exchange calls `.test()` to overlap work with
//! communication and `.wait()` before it trusts a buffer.
//!
//! Beyond point-to-point messages a communicator knows its rank and size,
//! can synchronise all ranks, and can tell whether a peer shares this
//! node. Co-located ranks may hand each other shared-memory segments
//! through `shm_publish`/`shm_lookup`.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Barrier};

use crate::data::Allocation;

/// Identifies one published shared-memory segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShmKey {
    /// Rank that allocated (and writes) the segment.
    pub owner: usize,
    /// Rank allowed to attach to it.
    pub dest: usize,
    pub var: String,
}

/// A window of a shared allocation, in words.
#[derive(Clone, Debug)]
pub struct ShmSegment {
    pub alloc: Arc<Allocation>,
    pub ofs: usize,
    pub len: usize,
}

/// Non-blocking communication interface.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive of `buf.len()` bytes; the data comes back from `wait`.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Block until every rank has reached the barrier.
    fn barrier(&self);

    /// Whether `peer` can share memory with this rank.
    fn same_node(&self, _peer: usize) -> bool {
        false
    }

    /// Offer a segment to the rank named in `key`.
    fn shm_publish(&self, _key: ShmKey, _seg: ShmSegment) {}

    /// Take the segment published under `key`, if any.
    fn shm_lookup(&self, _key: &ShmKey) -> Option<ShmSegment> {
        None
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;

    /// Check for completion without blocking.
    fn test(&mut self) -> bool {
        true
    }
}

/// Compile-time no-op comm for a single rank.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}
}

// --- RayonComm: intra-process / multi-thread ---
type Key = (usize, usize, u16); // (src, dst, tag)

struct Universe {
    size: usize,
    ranks_per_node: usize,
    mailbox: DashMap<Key, VecDeque<Bytes>>,
    shm: DashMap<ShmKey, ShmSegment>,
    barrier: Barrier,
}

/// One rank of an in-process universe. Each rank is driven by its own
/// thread; messages between the same pair with the same tag are FIFO.
#[derive(Clone)]
pub struct RayonComm {
    rank: usize,
    universe: Arc<Universe>,
}

impl std::fmt::Debug for RayonComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonComm")
            .field("rank", &self.rank)
            .field("size", &self.universe.size)
            .finish()
    }
}

impl RayonComm {
    /// `size` ranks, all on one node.
    pub fn universe(size: usize) -> Vec<RayonComm> {
        Self::universe_with_nodes(size, size)
    }

    /// `size` ranks, grouped `ranks_per_node` to a node by rank number.
    pub fn universe_with_nodes(size: usize, ranks_per_node: usize) -> Vec<RayonComm> {
        let size = size.max(1);
        let universe = Arc::new(Universe {
            size,
            ranks_per_node: ranks_per_node.max(1),
            mailbox: DashMap::new(),
            shm: DashMap::new(),
            barrier: Barrier::new(size),
        });
        (0..size)
            .map(|rank| RayonComm {
                rank,
                universe: Arc::clone(&universe),
            })
            .collect()
    }
}

pub struct LocalHandle {
    universe: Arc<Universe>,
    key: Key,
    len: usize,
    data: Option<Vec<u8>>,
}

impl Wait for LocalHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        while !self.test() {
            std::thread::yield_now();
        }
        self.data
    }

    fn test(&mut self) -> bool {
        if self.data.is_none() {
            let msg = self
                .universe
                .mailbox
                .get_mut(&self.key)
                .and_then(|mut q| q.pop_front());
            if let Some(bytes) = msg {
                let n = self.len.min(bytes.len());
                self.data = Some(bytes[..n].to_vec());
            }
        }
        self.data.is_some()
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.rank, peer, tag);
        self.universe
            .mailbox
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        LocalHandle {
            universe: Arc::clone(&self.universe),
            key: (peer, self.rank, tag),
            len: buf.len(),
            data: None,
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.universe.size
    }

    fn barrier(&self) {
        self.universe.barrier.wait();
    }

    fn same_node(&self, peer: usize) -> bool {
        let n = self.universe.ranks_per_node;
        peer < self.universe.size && peer / n == self.rank / n
    }

    fn shm_publish(&self, key: ShmKey, seg: ShmSegment) {
        self.universe.shm.insert(key, seg);
    }

    // Removing the entry leaves the owner and the attaching rank as the
    // only holders.
    fn shm_lookup(&self, key: &ShmKey) -> Option<ShmSegment> {
        self.universe.shm.remove(key).map(|(_, v)| v)
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::collective::CommunicatorCollectives;
    use mpi::environment::Universe as MpiUniverse;
    use mpi::point_to_point::{Destination, Source};
    use mpi::request::{Request, StaticScope};
    use mpi::topology::{Communicator as _, SimpleCommunicator};
    use mpi::Threading;

    /// World communicator. Ranks are never treated as co-located, so halo
    /// buffers always travel as messages.
    pub struct MpiComm {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
        _universe: MpiUniverse,
    }

    // SAFETY: MPI is initialised with `Threading::Multiple`, so the world
    // communicator may be used from any thread.
    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        /// Initialise MPI. `None` if it is already initialised or the library
        /// lacks full thread support.
        pub fn new() -> Option<Self> {
            let (universe, threading) = mpi::initialize_with_threading(Threading::Multiple)?;
            if threading != Threading::Multiple {
                log::warn!("MPI provides {threading:?} threading only");
                return None;
            }
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Some(Self {
                world,
                rank,
                size,
                _universe: universe,
            })
        }
    }

    // The request borrows a leaked boxed buffer; `wait` reclaims it.
    pub struct MpiHandle {
        req: Option<Request<'static, [u8], StaticScope>>,
        buf: *mut [u8],
        recv: bool,
        done: bool,
    }

    impl MpiHandle {
        fn finish(&mut self) -> Option<Vec<u8>> {
            // SAFETY: `buf` came from `Box::into_raw` and the request using it
            // has completed.
            let data = unsafe { Box::from_raw(self.buf) }.into_vec();
            self.recv.then_some(data)
        }
    }

    impl Wait for MpiHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.req.take() {
                req.wait();
            }
            self.finish()
        }

        fn test(&mut self) -> bool {
            if let Some(req) = self.req.take() {
                match req.test() {
                    Ok(_) => self.done = true,
                    Err(req) => self.req = Some(req),
                }
            }
            self.done || self.req.is_none()
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiHandle;
        type RecvHandle = MpiHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiHandle {
            let ptr: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: the box stays alive until `finish`.
            let data: &'static [u8] = unsafe { &*ptr };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, i32::from(tag));
            MpiHandle {
                req: Some(req),
                buf: ptr,
                recv: false,
                done: false,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiHandle {
            let ptr: *mut [u8] = Box::into_raw(vec![0u8; buf.len()].into_boxed_slice());
            // SAFETY: as above; nothing else aliases the box.
            let data: &'static mut [u8] = unsafe { &mut *ptr };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, data, i32::from(tag));
            MpiHandle {
                req: Some(req),
                buf: ptr,
                recv: true,
                done: false,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn barrier(&self) {
            self.world.barrier();
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
