//! Halo buffers of every variable toward every neighbor, and the exchange.
//!
//! Each existing neighbor gets one send and one receive buffer per variable;
//! which side of the domain they cover follows from the neighbor offset.
//! Buffers toward co-located neighbors can live in shared memory: the
//! sender owns the segment and the receiver attaches to it.
//!
//! Message tags are `var_index * neighborhood_size + offset_index`, where
//! the offset is the sender as seen from the receiver. Both sides compute
//! the same tag without exchanging any metadata.

use std::sync::Arc;

use crate::comm::communicator::{Communicator, ShmKey, ShmSegment, Wait};
use crate::comm::halo_buf::{slab, BufDir, HaloBuf, Ownership};
use crate::comm::topology::{NeighborInfo, RankTopology};
use crate::data::{AllocPolicy, Allocation, Allocator, Real};
use crate::dims::{DimCatalog, DimTuple};
use crate::settings::TileSettings;
use crate::stencil::StencilDescriptor;
use crate::tiling_error::TilingError;

/// Send and receive buffers toward one neighbor.
#[derive(Clone, Debug)]
pub struct NeighborBufs {
    pub neighbor_rank: usize,
    pub send: HaloBuf,
    pub recv: HaloBuf,
    /// Both buffers live in shared memory.
    pub use_shm: bool,
}

#[derive(Clone, Debug, Default)]
struct VarBufs {
    var: String,
    // Indexed by neighbor offset index.
    by_neighbor: Vec<Option<NeighborBufs>>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub bytes_sent: usize,
    pub bytes_received: usize,
    pub shm_copies: usize,
    pub messages: usize,
}

/// All halo buffers of one rank.
#[derive(Debug, Default)]
pub struct HaloBuffers {
    vars: Vec<VarBufs>,
    neighborhood_size: usize,
    owned: Option<Arc<Allocation>>,
    shm: Option<Arc<Allocation>>,
}

fn buffer_geometry(
    dims: &DimCatalog,
    nbr: &NeighborInfo,
    rank_sizes: &DimTuple,
    left: &DimTuple,
    right: &DimTuple,
    dir: BufDir,
) -> (DimTuple, DimTuple) {
    let mut begin = dims.new_domain_tuple(0);
    let mut num_pts = dims.new_domain_tuple(0);
    for dd in dims.domain_iter() {
        let (b, n) = slab(
            dir,
            nbr.offset.get(dd.name).unwrap_or(0),
            rank_sizes.get(dd.name).unwrap_or(0),
            left.get(dd.name).unwrap_or(0),
            right.get(dd.name).unwrap_or(0),
        );
        begin[dd.domain_posn] = b;
        num_pts[dd.domain_posn] = n;
    }
    (begin, num_pts)
}

fn tag(var_idx: usize, nbr_idx: usize, neighborhood_size: usize, neighbor: usize) -> Result<u16, TilingError> {
    u16::try_from(var_idx * neighborhood_size + nbr_idx).map_err(|_| TilingError::CommError {
        neighbor,
        reason: format!("message tag for var #{var_idx} exceeds the tag range"),
    })
}

impl HaloBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)allocate buffers for every variable of `stencil` toward every
    /// existing neighbor in `topo`. Everything held before is released first.
    ///
    /// With `use_shm`, all ranks must call this together: it publishes send
    /// segments, synchronises on a barrier, then attaches receive buffers.
    pub fn alloc<C: Communicator>(
        &mut self,
        stencil: &StencilDescriptor,
        settings: &TileSettings,
        topo: &RankTopology,
        comm: &C,
        allocator: &dyn Allocator,
    ) -> Result<(), TilingError> {
        self.release();
        let dims = stencil.dims();
        let fold = dims.fold_pts();
        let me = topo.my_rank();
        self.neighborhood_size = topo.neighborhood_size();

        // Geometry first, then sizes of the two pools.
        let mut owned_words = 0usize;
        let mut shm_words = 0usize;
        for var in stencil.var_names() {
            let left = stencil.halo_sizes(var, None, true);
            let right = stencil.halo_sizes(var, None, false);
            let mut vb = VarBufs {
                var: var.to_string(),
                by_neighbor: vec![None; topo.neighborhood_size()],
            };
            topo.visit_neighbors(|nbr| {
                let Some(rank) = nbr.rank else { return };
                let mk = |dir: BufDir| {
                    let (begin, num_pts) =
                        buffer_geometry(dims, nbr, &settings.rank_sizes, &left, &right, dir);
                    let name = format!("{var}_{dir}_{}", nbr.offset.make_val_str("_"));
                    HaloBuf::new(name, dir, begin, num_pts).with_vec_copy(fold)
                };
                let send = mk(BufDir::Send);
                let recv = mk(BufDir::Recv);
                if send.get_size() == 0 && recv.get_size() == 0 {
                    return;
                }
                let use_shm = settings.use_shm && comm.same_node(rank);
                if use_shm {
                    shm_words += send.padded_words(true);
                } else {
                    owned_words += send.padded_words(false) + recv.padded_words(false);
                }
                vb.by_neighbor[nbr.index] = Some(NeighborBufs {
                    neighbor_rank: rank,
                    send,
                    recv,
                    use_shm,
                });
            });
            self.vars.push(vb);
        }

        let word_bytes = std::mem::size_of::<u64>();
        let owned_bytes = owned_words * word_bytes;
        let owned_policy =
            settings.halo_alloc_policy(allocator.dram_bytes().saturating_add(owned_bytes));
        if owned_words > 0 {
            self.owned = Some(allocator.allocate(owned_bytes, owned_policy)?);
        }
        if shm_words > 0 {
            self.shm = Some(allocator.allocate(shm_words * word_bytes, AllocPolicy::Shm)?);
        }

        // Carve the pools and publish shared send segments.
        let (mut owned_ofs, mut shm_ofs) = (0usize, 0usize);
        for vb in &mut self.vars {
            for nb in vb.by_neighbor.iter_mut().flatten() {
                if nb.use_shm {
                    let shm = self.shm.as_ref().map(Arc::clone).ok_or_else(|| TilingError::Alloc {
                        nbytes: shm_words * word_bytes,
                        policy: AllocPolicy::Shm.to_string(),
                        reason: "shared pool missing".into(),
                    })?;
                    let len = nb.send.padded_words(true);
                    nb.send.set_storage(Arc::clone(&shm), shm_ofs, Ownership::Owned, true)?;
                    comm.shm_publish(
                        ShmKey {
                            owner: me,
                            dest: nb.neighbor_rank,
                            var: vb.var.clone(),
                        },
                        ShmSegment {
                            alloc: shm,
                            ofs: shm_ofs,
                            len,
                        },
                    );
                    shm_ofs += len;
                } else {
                    let owned = self.owned.as_ref().map(Arc::clone).ok_or_else(|| TilingError::Alloc {
                        nbytes: owned_bytes,
                        policy: owned_policy.to_string(),
                        reason: "owned pool missing".into(),
                    })?;
                    nb.send.set_storage(Arc::clone(&owned), owned_ofs, Ownership::Owned, false)?;
                    owned_ofs += nb.send.padded_words(false);
                    nb.recv.set_storage(owned, owned_ofs, Ownership::Owned, false)?;
                    owned_ofs += nb.recv.padded_words(false);
                }
            }
        }

        if settings.use_shm {
            comm.barrier();
            for vb in &mut self.vars {
                for nb in vb.by_neighbor.iter_mut().flatten().filter(|nb| nb.use_shm) {
                    let key = ShmKey {
                        owner: nb.neighbor_rank,
                        dest: me,
                        var: vb.var.clone(),
                    };
                    let attach_err = |reason: String| TilingError::ShmAttach {
                        owner: key.owner,
                        var: key.var.clone(),
                        reason,
                    };
                    let seg = comm
                        .shm_lookup(&key)
                        .ok_or_else(|| attach_err("segment was not published".into()))?;
                    if seg.len != nb.recv.padded_words(true) {
                        return Err(attach_err(format!(
                            "segment holds {} words, expected {}",
                            seg.len,
                            nb.recv.padded_words(true)
                        )));
                    }
                    nb.recv
                        .set_storage(seg.alloc, seg.ofs, Ownership::Attached, true)
                        .map_err(|e| attach_err(e.to_string()))?;
                }
            }
            // Nobody may re-allocate while a peer is still attaching.
            comm.barrier();
        }

        log::info!(
            "rank {me}: halo buffers for {} var(s), {} bytes owned, {} bytes shared",
            self.vars.len(),
            owned_words * word_bytes,
            shm_words * word_bytes
        );
        Ok(())
    }

    /// Drop every buffer and this rank's hold on both pools.
    pub fn release(&mut self) {
        for vb in &mut self.vars {
            for nb in vb.by_neighbor.iter_mut().flatten() {
                nb.send.release_storage();
                nb.recv.release_storage();
            }
        }
        self.vars.clear();
        self.owned = None;
        self.shm = None;
    }

    pub fn num_bytes(&self) -> usize {
        self.owned.as_ref().map_or(0, |a| a.nbytes()) + self.shm.as_ref().map_or(0, |a| a.nbytes())
    }

    /// Buffers of `var` toward the neighbor at offset index `nbr_idx`.
    pub fn get(&self, var: &str, nbr_idx: usize) -> Option<&NeighborBufs> {
        self.vars
            .iter()
            .find(|vb| vb.var == var)
            .and_then(|vb| vb.by_neighbor.get(nbr_idx))
            .and_then(Option::as_ref)
    }

    /// All buffers, in var order then offset order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NeighborBufs)> + '_ {
        self.vars.iter().flat_map(|vb| {
            vb.by_neighbor
                .iter()
                .flatten()
                .map(move |nb| (vb.var.as_str(), nb))
        })
    }

    /// Exchange halos of every variable with every neighbor.
    ///
    /// `pack(var, buf, out)` fills `out` with the points of send buffer
    /// `buf` in row-major order; `unpack(var, buf, data)` stores a received
    /// buffer. `interior` runs after all sends are posted and before any
    /// receive is waited on; receives that have already arrived by then are
    /// unpacked first.
    pub fn exchange<C, P, U, I>(
        &self,
        comm: &C,
        topo: &RankTopology,
        mut pack: P,
        mut unpack: U,
        interior: I,
    ) -> Result<ExchangeStats, TilingError>
    where
        C: Communicator,
        P: FnMut(&str, &HaloBuf, &mut [Real]),
        U: FnMut(&str, &HaloBuf, &[Real]),
        I: FnOnce(),
    {
        let nsize = self.neighborhood_size;
        let mut stats = ExchangeStats::default();

        // Post receives.
        let mut pending = Vec::new();
        for (vi, vb) in self.vars.iter().enumerate() {
            for (ni, nb) in vb.by_neighbor.iter().enumerate() {
                let Some(nb) = nb else { continue };
                if nb.use_shm || nb.recv.get_size() == 0 {
                    continue;
                }
                let t = tag(vi, ni, nsize, nb.neighbor_rank)?;
                let mut expect = vec![0u8; nb.recv.get_bytes()];
                let h = comm.irecv(nb.neighbor_rank, t, &mut expect);
                pending.push((vi, ni, h));
            }
        }

        // Pack and send.
        let mut sends = Vec::new();
        let mut vals = Vec::new();
        for (vi, vb) in self.vars.iter().enumerate() {
            for (ni, nb) in vb.by_neighbor.iter().enumerate() {
                let Some(nb) = nb else { continue };
                let n = nb.send.get_size();
                if n == 0 {
                    continue;
                }
                vals.clear();
                vals.resize(n, 0.0);
                pack(&vb.var, &nb.send, &mut vals);
                if nb.use_shm {
                    // Wait for the reader to drain the previous exchange.
                    while nb.send.is_ready() {
                        std::thread::yield_now();
                    }
                    let _lock = nb.send.lock();
                    nb.send.write(&vals)?;
                    nb.send.set_ready(true);
                    stats.shm_copies += 1;
                } else {
                    // The receiver knows us by the mirrored offset.
                    let mirror = topo.mirror_index(ni).unwrap_or(ni);
                    let t = tag(vi, mirror, nsize, nb.neighbor_rank)?;
                    nb.send.write(&vals)?;
                    sends.push(comm.isend(nb.neighbor_rank, t, bytemuck::cast_slice(&vals)));
                    stats.messages += 1;
                }
                stats.bytes_sent += nb.send.get_bytes();
            }
        }

        interior();

        // Unpack whatever already arrived, then wait for the rest.
        let mut waiting = Vec::with_capacity(pending.len());
        for (vi, ni, mut h) in pending {
            if h.test() {
                self.finish_recv(vi, ni, h.wait(), &mut unpack, &mut stats)?;
            } else {
                waiting.push((vi, ni, h));
            }
        }
        for (vi, ni, h) in waiting {
            self.finish_recv(vi, ni, h.wait(), &mut unpack, &mut stats)?;
        }

        // Shared-memory receives.
        let mut buf = Vec::new();
        for vb in &self.vars {
            for nb in vb.by_neighbor.iter().flatten().filter(|nb| nb.use_shm) {
                let n = nb.recv.get_size();
                if n == 0 {
                    continue;
                }
                while !nb.recv.is_ready() {
                    std::thread::yield_now();
                }
                buf.clear();
                buf.resize(n, 0.0);
                {
                    let _lock = nb.recv.lock();
                    nb.recv.read(&mut buf)?;
                    nb.recv.set_ready(false);
                }
                unpack(&vb.var, &nb.recv, &buf);
                stats.bytes_received += nb.recv.get_bytes();
                stats.shm_copies += 1;
            }
        }

        for s in sends {
            s.wait();
        }
        Ok(stats)
    }

    fn finish_recv<U>(
        &self,
        vi: usize,
        ni: usize,
        data: Option<Vec<u8>>,
        unpack: &mut U,
        stats: &mut ExchangeStats,
    ) -> Result<(), TilingError>
    where
        U: FnMut(&str, &HaloBuf, &[Real]),
    {
        let vb = &self.vars[vi];
        let Some(nb) = vb.by_neighbor.get(ni).and_then(Option::as_ref) else {
            return Ok(());
        };
        let bytes = data.unwrap_or_default();
        if bytes.len() != nb.recv.get_bytes() {
            return Err(TilingError::CommError {
                neighbor: nb.neighbor_rank,
                reason: format!(
                    "received {} bytes for '{}', expected {}",
                    bytes.len(),
                    nb.recv.name(),
                    nb.recv.get_bytes()
                ),
            });
        }
        let vals: Vec<Real> = bytemuck::pod_collect_to_vec(&bytes);
        nb.recv.write(&vals)?;
        unpack(&vb.var, &nb.recv, &vals);
        stats.bytes_received += bytes.len();
        stats.messages += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::NoComm;
    use crate::data::HostAllocator;
    use parking_lot::Mutex;

    /// Host memory, pretending `placed` bytes of DRAM are already in use.
    struct PlacedAllocator {
        placed: usize,
        requests: Mutex<Vec<(usize, AllocPolicy)>>,
    }

    impl PlacedAllocator {
        fn new(placed: usize) -> Self {
            Self {
                placed,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl Allocator for PlacedAllocator {
        fn allocate(&self, nbytes: usize, policy: AllocPolicy) -> Result<Arc<Allocation>, TilingError> {
            self.requests.lock().push((nbytes, policy));
            HostAllocator::new().allocate(nbytes, policy)
        }

        fn dram_bytes(&self) -> usize {
            self.placed
        }
    }

    fn setup() -> (StencilDescriptor, TileSettings) {
        let dims = DimCatalog::new("t", &["x", "y"], &[]).unwrap();
        let mut st = StencilDescriptor::new("heat", dims.clone());
        st.add_halo("u", "main", true, 0, &[1, 2]).unwrap();
        st.add_halo("u", "main", false, 0, &[1, 2]).unwrap();
        let mut s = TileSettings::new(&dims);
        s.rank_sizes = DimTuple::from_pairs([("x", 8), ("y", 8)]);
        (st, s)
    }

    #[test]
    fn single_rank_has_no_buffers() {
        let (st, s) = setup();
        let nr = DimTuple::from_pairs([("x", 1), ("y", 1)]);
        let topo = RankTopology::build(&nr, &st.dims().new_domain_tuple(0)).unwrap();
        let mut hb = HaloBuffers::new();
        hb.alloc(&st, &s, &topo, &NoComm, &HostAllocator::new()).unwrap();
        assert_eq!(hb.iter().count(), 0);
        assert_eq!(hb.num_bytes(), 0);
        let stats = hb
            .exchange(&NoComm, &topo, |_, _, _| {}, |_, _, _| {}, || {})
            .unwrap();
        assert_eq!(stats, ExchangeStats::default());
    }

    #[test]
    fn buffers_face_each_neighbor() {
        let (st, s) = setup();
        let nr = DimTuple::from_pairs([("x", 2), ("y", 2)]);
        let topo = RankTopology::build(&nr, &DimTuple::from_pairs([("x", 0), ("y", 1)])).unwrap();
        let mut hb = HaloBuffers::new();
        hb.alloc(&st, &s, &topo, &NoComm, &HostAllocator::new()).unwrap();
        // Neighbors at (0,-1), (1,-1) and (1,0).
        assert_eq!(hb.iter().count(), 3);

        let down = topo.neighbor_index(&DimTuple::from_pairs([("x", 1), ("y", 0)])).unwrap();
        let nb = hb.get("u", down).unwrap();
        assert_eq!(nb.neighbor_rank, 3);
        assert_eq!(nb.send.begin().make_val_str(","), "7,0");
        assert_eq!(nb.send.num_pts().make_val_str(","), "1,8");
        assert_eq!(nb.recv.begin().make_val_str(","), "8,0");

        let corner = topo.neighbor_index(&DimTuple::from_pairs([("x", 1), ("y", -1)])).unwrap();
        let nb = hb.get("u", corner).unwrap();
        assert_eq!(nb.send.num_pts().make_val_str(","), "1,2");
        assert_eq!(nb.recv.begin().make_val_str(","), "8,-2");
        assert_eq!(nb.send.ownership(), Some(Ownership::Owned));
        assert!(hb.num_bytes() > 0);

        hb.release();
        assert_eq!(hb.num_bytes(), 0);
        assert!(hb.get("u", down).is_none());
    }

    #[test]
    fn zero_width_halo_means_no_buffer() {
        let dims = DimCatalog::new("t", &["x", "y"], &[]).unwrap();
        let mut st = StencilDescriptor::new("sweep", dims.clone());
        st.add_halo("u", "main", true, 0, &[1, 0]).unwrap();
        st.add_halo("u", "main", false, 0, &[1, 0]).unwrap();
        let mut s = TileSettings::new(&dims);
        s.rank_sizes = DimTuple::from_pairs([("x", 8), ("y", 8)]);
        let nr = DimTuple::from_pairs([("x", 3), ("y", 3)]);
        let topo = RankTopology::build(&nr, &DimTuple::from_pairs([("x", 1), ("y", 1)])).unwrap();
        let mut hb = HaloBuffers::new();
        hb.alloc(&st, &s, &topo, &NoComm, &HostAllocator::new()).unwrap();
        // Only the two x-faces carry data.
        assert_eq!(hb.iter().count(), 2);
    }

    #[test]
    fn halo_pool_moves_to_pmem_past_threshold() {
        const GIB: usize = 1 << 30;
        let (st, mut s) = setup();
        s.numa_pref = 1;
        s.pmem_threshold = 1;
        let nr = DimTuple::from_pairs([("x", 2), ("y", 1)]);
        let topo = RankTopology::build(&nr, &DimTuple::from_pairs([("x", 0), ("y", 0)])).unwrap();

        let place = |s: &TileSettings, placed: usize| {
            let a = PlacedAllocator::new(placed);
            let mut hb = HaloBuffers::new();
            hb.alloc(&st, s, &topo, &NoComm, &a).unwrap();
            let reqs = a.requests.into_inner();
            assert_eq!(reqs.len(), 1);
            reqs[0]
        };

        let (nbytes, policy) = place(&s, 0);
        assert!(nbytes > 0);
        assert_eq!(policy, AllocPolicy::Numa(1));
        // Exactly at the threshold stays in DRAM; one more byte does not fit.
        assert_eq!(place(&s, GIB - nbytes).1, AllocPolicy::Numa(1));
        assert_eq!(place(&s, GIB - nbytes + 1), (nbytes, AllocPolicy::Pmem(1)));

        s.pmem_threshold = 0;
        assert_eq!(place(&s, 4 * GIB).1, AllocPolicy::Numa(1));
    }
}
