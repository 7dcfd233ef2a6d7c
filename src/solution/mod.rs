//! The stencil solution: settings, rank placement, tiling plan, thread pools
//! and halo buffers behind one handle.
//!
//! A solution moves between two states. Setters leave it (or put it back)
//! in the unprepared state; [`Solution::prepare_solution`] places the rank,
//! resolves every tiling level, sizes the thread pools and allocates halo
//! buffers. APIs that report resolved values require the prepared state.
//!
//! ```
//! use stencil_tiling::prelude::*;
//!
//! let dims = DimCatalog::new("t", &["x", "y"], &[])?;
//! let mut stencil = StencilDescriptor::new("heat2d", dims);
//! stencil.add_halo("u", "main", true, 0, &[1, 1])?;
//! stencil.add_halo("u", "main", false, 0, &[1, 1])?;
//!
//! let mut soln = Solution::new(std::sync::Arc::new(KernelEnv::single()), stencil);
//! soln.set_overall_domain_size("x", 256)?;
//! soln.set_overall_domain_size("y", 256)?;
//! soln.set_block_size("x", 64)?;
//! soln.prepare_solution()?;
//! assert_eq!(soln.plan()?.counts.blocks.total, 4 * 8);
//! soln.end_solution();
//! # Ok::<(), TilingError>(())
//! ```

pub mod env;
pub mod rank;
pub mod tuning;

pub use env::KernelEnv;
pub use rank::{fill_rank_counts, setup_rank, RankSetup};
pub use tuning::{TrialReport, TrialTiming, TuningTarget};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::comm::{Communicator, ExchangeStats, HaloBuf, HaloBuffers, NoComm, RankTopology};
use crate::data::Real;
use crate::dims::{DimCatalog, DimTuple, Idx};
use crate::settings::{adjust_settings, TileSettings, TilingPlan};
use crate::stencil::StencilDescriptor;
use crate::threads::{compute_layout, NestedThreads, ThreadLayout};
use crate::tiling_error::TilingError;

#[derive(Debug)]
struct Prepared {
    plan: TilingPlan,
    topology: RankTopology,
    rank_offsets: DimTuple,
    thread_layout: ThreadLayout,
}

pub struct Solution<C: Communicator = NoComm> {
    env: Arc<KernelEnv<C>>,
    stencil: StencilDescriptor,
    settings: TileSettings,
    prepared: Option<Prepared>,
    halos: HaloBuffers,
    // Built on first use after each prepare.
    threads: OnceCell<NestedThreads>,
    exchanged: Mutex<ExchangeStats>,
}

impl<C: Communicator> std::fmt::Debug for Solution<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Solution")
            .field("name", &self.stencil.name())
            .field("env", &self.env)
            .field("prepared", &self.prepared.is_some())
            .finish()
    }
}

impl<C: Communicator> Solution<C> {
    pub fn new(env: Arc<KernelEnv<C>>, stencil: StencilDescriptor) -> Self {
        let settings = TileSettings::new(stencil.dims());
        Self {
            env,
            stencil,
            settings,
            prepared: None,
            halos: HaloBuffers::new(),
            threads: OnceCell::new(),
            exchanged: Mutex::new(ExchangeStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        self.stencil.name()
    }

    pub fn env(&self) -> &KernelEnv<C> {
        &self.env
    }

    pub fn stencil(&self) -> &StencilDescriptor {
        &self.stencil
    }

    pub fn dims(&self) -> &DimCatalog {
        self.stencil.dims()
    }

    /// Settings as given by the caller, before resolution.
    pub fn settings(&self) -> &TileSettings {
        &self.settings
    }

    /// Mutable settings; the solution becomes unprepared.
    pub fn settings_mut(&mut self) -> &mut TileSettings {
        self.mark_unprepared();
        &mut self.settings
    }

    /// Apply one `name value` settings option; the solution becomes
    /// unprepared.
    pub fn apply_option(&mut self, name: &str, value: &str) -> Result<(), TilingError> {
        self.mark_unprepared();
        let dims = self.stencil.dims().clone();
        self.settings.apply_option(&dims, name, value)
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    fn mark_unprepared(&mut self) {
        if self.prepared.take().is_some() {
            log::debug!("solution '{}' is no longer prepared", self.stencil.name());
            self.halos.release();
            self.threads.take();
        }
    }

    fn require_prepared(&self, func: &'static str) -> Result<&Prepared, TilingError> {
        self.prepared.as_ref().ok_or(TilingError::NotPrepared(func))
    }

    /// Resolved settings once prepared, the caller's settings before.
    fn current(&self) -> &TileSettings {
        self.prepared
            .as_ref()
            .map_or(&self.settings, |p| &p.plan.sizes)
    }

    /// Place the rank, resolve all tiling levels, lay out threads and
    /// allocate halo buffers. Every rank must call this together.
    pub fn prepare_solution(&mut self) -> Result<(), TilingError> {
        self.mark_unprepared();
        log::info!(
            "preparing solution '{}' on rank {} of {}",
            self.stencil.name(),
            self.env.rank(),
            self.env.num_ranks()
        );
        let dims = self.stencil.dims();
        let mut placed = self.settings.clone();
        let RankSetup {
            topology,
            rank_offsets,
        } = setup_rank(&mut placed, dims, self.env.comm())?;
        let plan = adjust_settings(&placed, dims)?;

        let s = &plan.sizes;
        let thread_layout = compute_layout(
            s.effective_max_threads(self.env.host_threads()),
            s.thread_divisor,
            s.block_threads,
        );

        if let Err(e) = self.halos.alloc(
            &self.stencil,
            s,
            &topology,
            self.env.comm(),
            self.env.allocator(),
        ) {
            self.halos.release();
            return Err(e);
        }
        self.env.global_barrier();

        log::info!(
            "solution '{}' prepared: {} region(s), {} block(s) per rank, {} x {} threads",
            self.stencil.name(),
            plan.counts.regions_per_rank(),
            plan.counts.blocks_per_rank(),
            thread_layout.region_threads,
            thread_layout.block_threads
        );
        *self.exchanged.lock() = ExchangeStats::default();
        self.prepared = Some(Prepared {
            plan,
            topology,
            rank_offsets,
            thread_layout,
        });
        Ok(())
    }

    /// Release halo buffers and thread pools, then synchronise all ranks.
    pub fn end_solution(&mut self) {
        self.mark_unprepared();
        self.env.global_barrier();
        log::info!("solution '{}' ended", self.stencil.name());
    }

    pub fn plan(&self) -> Result<&TilingPlan, TilingError> {
        Ok(&self.require_prepared("plan")?.plan)
    }

    pub fn topology(&self) -> Result<&RankTopology, TilingError> {
        Ok(&self.require_prepared("topology")?.topology)
    }

    pub fn thread_layout(&self) -> Result<ThreadLayout, TilingError> {
        Ok(self.require_prepared("thread_layout")?.thread_layout)
    }

    pub fn halo_buffers(&self) -> &HaloBuffers {
        &self.halos
    }

    fn thread_pools(&self, func: &'static str) -> Result<&NestedThreads, TilingError> {
        let layout = self.require_prepared(func)?.thread_layout;
        self.threads.get_or_try_init(|| NestedThreads::new(layout))
    }

    /// Run `f(i)` for each of `n` regions on the region threads.
    pub fn run_regions<F>(&self, n: usize, f: F) -> Result<(), TilingError>
    where
        F: Fn(usize) + Send + Sync,
    {
        self.thread_pools("run_regions")?.run_regions(n, f)
    }

    /// Run `f(i)` for each of `n` blocks on the calling region thread's
    /// block threads. Only valid inside [`run_regions`](Self::run_regions).
    pub fn run_blocks<F>(&self, n: usize, f: F) -> Result<(), TilingError>
    where
        F: Fn(usize) + Send + Sync,
    {
        self.thread_pools("run_blocks")?.run_blocks(n, f)
    }

    /// Exchange halos with every neighbor. See
    /// [`HaloBuffers::exchange`] for the roles of `pack` and `unpack`.
    pub fn exchange_halos<P, U>(&self, pack: P, unpack: U) -> Result<ExchangeStats, TilingError>
    where
        P: FnMut(&str, &HaloBuf, &mut [Real]),
        U: FnMut(&str, &HaloBuf, &[Real]),
    {
        self.exchange_halos_with(pack, unpack, || {})
    }

    /// Like [`exchange_halos`](Self::exchange_halos), running `interior`
    /// while messages are in flight when `overlap_comms` is set, or after
    /// the exchange otherwise.
    pub fn exchange_halos_with<P, U, I>(
        &self,
        pack: P,
        unpack: U,
        interior: I,
    ) -> Result<ExchangeStats, TilingError>
    where
        P: FnMut(&str, &HaloBuf, &mut [Real]),
        U: FnMut(&str, &HaloBuf, &[Real]),
        I: FnOnce(),
    {
        let p = self.require_prepared("exchange_halos")?;
        let comm = self.env.comm();
        let stats = if p.plan.sizes.overlap_comms {
            self.halos.exchange(comm, &p.topology, pack, unpack, interior)?
        } else {
            let stats = self.halos.exchange(comm, &p.topology, pack, unpack, || {})?;
            interior();
            stats
        };
        let mut total = self.exchanged.lock();
        total.bytes_sent += stats.bytes_sent;
        total.bytes_received += stats.bytes_received;
        total.shm_copies += stats.shm_copies;
        total.messages += stats.messages;
        Ok(stats)
    }

    /// Totals over every exchange since the last prepare.
    pub fn exchange_totals(&self) -> ExchangeStats {
        *self.exchanged.lock()
    }

    fn check_domain_dim(&self, dim: &str, func: &'static str) -> Result<(), TilingError> {
        self.dims().check_dim_type(dim, func, false, true, false)?;
        Ok(())
    }

    fn check_tile_dim(&self, dim: &str, func: &'static str) -> Result<(), TilingError> {
        self.dims().check_dim_type(dim, func, true, true, false)?;
        Ok(())
    }

    fn set_in(&mut self, func: &'static str, dim: &str, pick: fn(&mut TileSettings) -> &mut DimTuple, v: Idx) {
        log::trace!("{func}({dim}, {v})");
        self.mark_unprepared();
        pick(&mut self.settings).set_val(dim, v);
    }

    pub fn get_num_ranks(&self, dim: &str) -> Result<Idx, TilingError> {
        self.check_domain_dim(dim, "get_num_ranks")?;
        Ok(self.current().num_ranks.get(dim).unwrap_or(0))
    }

    /// 0 lets `prepare_solution` choose.
    pub fn set_num_ranks(&mut self, dim: &str, n: Idx) -> Result<(), TilingError> {
        self.check_domain_dim(dim, "set_num_ranks")?;
        self.set_in("set_num_ranks", dim, |s| &mut s.num_ranks, n);
        Ok(())
    }

    pub fn get_rank_index(&self, dim: &str) -> Result<Idx, TilingError> {
        self.check_domain_dim(dim, "get_rank_index")?;
        let p = self.require_prepared("get_rank_index")?;
        Ok(p.topology.rank_indices().get(dim).unwrap_or(0))
    }

    /// Setting any index makes all indices explicit.
    pub fn set_rank_index(&mut self, dim: &str, index: Idx) -> Result<(), TilingError> {
        self.check_domain_dim(dim, "set_rank_index")?;
        self.set_in("set_rank_index", dim, |s| &mut s.rank_indices, index);
        self.settings.explicit_rank_indices = true;
        Ok(())
    }

    pub fn get_overall_domain_size(&self, dim: &str) -> Result<Idx, TilingError> {
        self.check_domain_dim(dim, "get_overall_domain_size")?;
        let p = self.require_prepared("get_overall_domain_size")?;
        Ok(p.plan.sizes.global_sizes.get(dim).unwrap_or(0))
    }

    pub fn set_overall_domain_size(&mut self, dim: &str, size: Idx) -> Result<(), TilingError> {
        self.check_domain_dim(dim, "set_overall_domain_size")?;
        self.set_in("set_overall_domain_size", dim, |s| &mut s.global_sizes, size);
        Ok(())
    }

    pub fn get_rank_domain_size(&self, dim: &str) -> Result<Idx, TilingError> {
        self.check_domain_dim(dim, "get_rank_domain_size")?;
        Ok(self.current().rank_sizes.get(dim).unwrap_or(0))
    }

    pub fn set_rank_domain_size(&mut self, dim: &str, size: Idx) -> Result<(), TilingError> {
        self.check_domain_dim(dim, "set_rank_domain_size")?;
        self.set_in("set_rank_domain_size", dim, |s| &mut s.rank_sizes, size);
        Ok(())
    }

    pub fn get_region_size(&self, dim: &str) -> Result<Idx, TilingError> {
        self.check_tile_dim(dim, "get_region_size")?;
        Ok(self.current().region_sizes.get(dim).unwrap_or(0))
    }

    pub fn set_region_size(&mut self, dim: &str, size: Idx) -> Result<(), TilingError> {
        self.check_tile_dim(dim, "set_region_size")?;
        self.set_in("set_region_size", dim, |s| &mut s.region_sizes, size);
        Ok(())
    }

    pub fn get_block_size(&self, dim: &str) -> Result<Idx, TilingError> {
        self.check_tile_dim(dim, "get_block_size")?;
        Ok(self.current().block_sizes.get(dim).unwrap_or(0))
    }

    pub fn set_block_size(&mut self, dim: &str, size: Idx) -> Result<(), TilingError> {
        self.check_tile_dim(dim, "set_block_size")?;
        self.set_in("set_block_size", dim, |s| &mut s.block_sizes, size);
        Ok(())
    }

    /// Global index of this rank's first point in `dim`.
    pub fn get_first_rank_domain_index(&self, dim: &str) -> Result<Idx, TilingError> {
        self.check_domain_dim(dim, "get_first_rank_domain_index")?;
        let p = self.require_prepared("get_first_rank_domain_index")?;
        Ok(p.rank_offsets.get(dim).unwrap_or(0))
    }

    /// Global index of this rank's last point in `dim`.
    pub fn get_last_rank_domain_index(&self, dim: &str) -> Result<Idx, TilingError> {
        self.check_domain_dim(dim, "get_last_rank_domain_index")?;
        let p = self.require_prepared("get_last_rank_domain_index")?;
        let first = p.rank_offsets.get(dim).unwrap_or(0);
        Ok(first + p.plan.sizes.rank_sizes.get(dim).unwrap_or(0) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TilingLevel;

    fn soln() -> Solution {
        let dims = DimCatalog::new("t", &["x", "y"], &[]).unwrap();
        let mut st = StencilDescriptor::new("heat2d", dims);
        st.add_halo("u", "main", true, 0, &[1, 1]).unwrap();
        st.add_halo("u", "main", false, 0, &[1, 1]).unwrap();
        let env = KernelEnv::single().with_host_threads(4);
        Solution::new(Arc::new(env), st)
    }

    #[test]
    fn prepared_getters_need_prepare() {
        let mut s = soln();
        s.set_overall_domain_size("x", 64).unwrap();
        s.set_overall_domain_size("y", 32).unwrap();
        assert_eq!(
            s.get_first_rank_domain_index("x"),
            Err(TilingError::NotPrepared("get_first_rank_domain_index"))
        );
        assert!(s.get_overall_domain_size("x").is_err());
        assert_eq!(s.get_rank_domain_size("x").unwrap(), 0);

        s.prepare_solution().unwrap();
        assert_eq!(s.get_overall_domain_size("x").unwrap(), 64);
        assert_eq!(s.get_rank_domain_size("y").unwrap(), 32);
        assert_eq!(s.get_region_size("x").unwrap(), 64);
        assert_eq!(s.get_block_size("y").unwrap(), 32);
        assert_eq!(s.get_num_ranks("x").unwrap(), 1);
        assert_eq!(s.get_rank_index("y").unwrap(), 0);
        assert_eq!(s.get_first_rank_domain_index("x").unwrap(), 0);
        assert_eq!(s.get_last_rank_domain_index("x").unwrap(), 63);
    }

    #[test]
    fn setters_unprepare() {
        let mut s = soln();
        s.set_rank_domain_size("x", 64).unwrap();
        s.set_rank_domain_size("y", 64).unwrap();
        s.prepare_solution().unwrap();
        assert!(s.is_prepared());
        s.set_block_size("x", 16).unwrap();
        assert!(!s.is_prepared());
        s.prepare_solution().unwrap();
        assert_eq!(s.plan().unwrap().counts.blocks.total, 4 * 2);
        s.apply_option("by", "16").unwrap();
        assert!(!s.is_prepared());
    }

    #[test]
    fn dimension_kinds_are_checked() {
        let mut s = soln();
        let err = s.set_rank_domain_size("t", 8).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error in set_rank_domain_size(): dimension 't' is the step dimension, which is not allowed"
        );
        assert!(matches!(s.get_block_size("z"), Err(TilingError::UnknownDim { .. })));
        // Step dim is fine for tile sizes.
        s.set_block_size("t", 2).unwrap();
        assert_eq!(s.settings().sizes(TilingLevel::Block).get("t"), Some(2));
    }

    #[test]
    fn regions_and_blocks_run_on_pools() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let mut s = soln();
        s.set_rank_domain_size("x", 32).unwrap();
        s.set_rank_domain_size("y", 32).unwrap();
        s.settings_mut().max_threads = 4;
        s.settings_mut().block_threads = 2;
        assert!(s.run_regions(1, |_| {}).is_err());
        s.prepare_solution().unwrap();
        assert_eq!(s.thread_layout().unwrap().block_threads, 2);
        let hits = AtomicUsize::new(0);
        s.run_regions(3, |_| {
            s.run_blocks(4, |_| {
                hits.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        })
        .unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 12);
    }

    #[test]
    fn single_rank_exchange_is_empty() {
        let mut s = soln();
        s.set_rank_domain_size("x", 16).unwrap();
        s.set_rank_domain_size("y", 16).unwrap();
        s.prepare_solution().unwrap();
        let mut ran = false;
        let stats = s
            .exchange_halos_with(|_, _, _| {}, |_, _, _| {}, || ran = true)
            .unwrap();
        assert!(ran);
        assert_eq!(stats, ExchangeStats::default());
        s.end_solution();
        assert!(s.exchange_halos(|_, _, _| {}, |_, _, _| {}).is_err());
    }
}
