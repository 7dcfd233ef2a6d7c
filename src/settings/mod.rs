//! Tile-size settings and their resolution.
//!
//! [`TileSettings`] is the one configuration struct of a solution: a size
//! tuple per tiling level plus the thread, rank and communication knobs.
//! Values are set through the API or the option surface in
//! [`TileSettings::apply_option`]; [`orchestrator::adjust_settings`] turns a
//! copy of them into a fully resolved [`orchestrator::TilingPlan`].

pub mod binding;
pub mod orchestrator;
pub mod resolver;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::data::AllocPolicy;
use crate::dims::{DimCatalog, DimTuple, Idx};
use crate::tiling_error::TilingError;

pub use orchestrator::{adjust_settings, LevelCounts, TemporalTiling, TilingPlan};
pub use resolver::{resolve_subsets, DimSubsets, SubsetReport};

/// Default block size in every domain dimension.
pub const DEFAULT_BLOCK_SIZE: Idx = 32;

/// NUMA preference meaning "allocate on the local node".
pub const NUMA_LOCAL: i32 = -1;

const GIB: usize = 1 << 30;

/// The sized levels of the tiling hierarchy, largest first, then the
/// traversal-order group levels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TilingLevel {
    LocalDomain,
    Region,
    Block,
    MiniBlock,
    SubBlock,
    BlockGroup,
    MiniBlockGroup,
    SubBlockGroup,
}

impl TilingLevel {
    /// Levels that must nest, outer to inner.
    pub const NESTED: [TilingLevel; 5] = [
        TilingLevel::LocalDomain,
        TilingLevel::Region,
        TilingLevel::Block,
        TilingLevel::MiniBlock,
        TilingLevel::SubBlock,
    ];

    pub const ALL: [TilingLevel; 8] = [
        TilingLevel::LocalDomain,
        TilingLevel::Region,
        TilingLevel::Block,
        TilingLevel::MiniBlock,
        TilingLevel::SubBlock,
        TilingLevel::BlockGroup,
        TilingLevel::MiniBlockGroup,
        TilingLevel::SubBlockGroup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TilingLevel::LocalDomain => "local-domain",
            TilingLevel::Region => "region",
            TilingLevel::Block => "block",
            TilingLevel::MiniBlock => "mini-block",
            TilingLevel::SubBlock => "sub-block",
            TilingLevel::BlockGroup => "block-group",
            TilingLevel::MiniBlockGroup => "mini-block-group",
            TilingLevel::SubBlockGroup => "sub-block-group",
        }
    }

    /// Option-name prefix, e.g. `"mb"` for `mbx`.
    pub fn option_prefix(self) -> &'static str {
        match self {
            TilingLevel::LocalDomain => "l",
            TilingLevel::Region => "r",
            TilingLevel::Block => "b",
            TilingLevel::MiniBlock => "mb",
            TilingLevel::SubBlock => "sb",
            TilingLevel::BlockGroup => "bg",
            TilingLevel::MiniBlockGroup => "mbg",
            TilingLevel::SubBlockGroup => "sbg",
        }
    }

    /// Whether a step-dimension size may be set at this level.
    pub fn allows_step(self) -> bool {
        matches!(
            self,
            TilingLevel::Region | TilingLevel::Block | TilingLevel::MiniBlock
        )
    }
}

impl fmt::Display for TilingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileSettings {
    /// Overall-problem size (domain dims).
    pub global_sizes: DimTuple,
    /// Local-domain (rank) size (domain dims).
    pub rank_sizes: DimTuple,
    pub region_sizes: DimTuple,
    pub block_sizes: DimTuple,
    pub mini_block_sizes: DimTuple,
    pub sub_block_sizes: DimTuple,
    pub block_group_sizes: DimTuple,
    pub mini_block_group_sizes: DimTuple,
    pub sub_block_group_sizes: DimTuple,
    pub num_ranks: DimTuple,
    pub rank_indices: DimTuple,
    /// Set once any rank index is given; otherwise indices come from the
    /// communicator rank.
    pub explicit_rank_indices: bool,
    /// 0 means the host's parallelism.
    pub max_threads: usize,
    pub thread_divisor: usize,
    pub block_threads: usize,
    pub bind_block_threads: bool,
    pub overlap_comms: bool,
    pub use_shm: bool,
    pub numa_pref: i32,
    /// GiB of DRAM to fill with `numa_pref` before halo storage goes to
    /// PMEM; 0 never uses PMEM.
    pub pmem_threshold: i32,
    pub min_exterior: Idx,
    pub auto_tune_min_secs: f64,
}

impl TileSettings {
    pub fn new(dims: &DimCatalog) -> Self {
        let stencil = dims.new_stencil_tuple(0);
        let domain = dims.new_domain_tuple(0);
        let mut block = dims.new_stencil_tuple(DEFAULT_BLOCK_SIZE);
        block.set_val(dims.step_dim(), 0);
        Self {
            global_sizes: domain.clone(),
            rank_sizes: domain.clone(),
            region_sizes: stencil.clone(),
            block_sizes: block,
            mini_block_sizes: stencil.clone(),
            sub_block_sizes: stencil.clone(),
            block_group_sizes: stencil.clone(),
            mini_block_group_sizes: stencil.clone(),
            sub_block_group_sizes: stencil,
            // 0 lets `setup_rank` factor the communicator size.
            num_ranks: domain.clone(),
            rank_indices: domain,
            explicit_rank_indices: false,
            max_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_divisor: 1,
            block_threads: 1,
            bind_block_threads: false,
            overlap_comms: true,
            use_shm: false,
            numa_pref: NUMA_LOCAL,
            pmem_threshold: 128,
            min_exterior: 0,
            auto_tune_min_secs: 0.25,
        }
    }

    pub fn sizes(&self, level: TilingLevel) -> &DimTuple {
        match level {
            TilingLevel::LocalDomain => &self.rank_sizes,
            TilingLevel::Region => &self.region_sizes,
            TilingLevel::Block => &self.block_sizes,
            TilingLevel::MiniBlock => &self.mini_block_sizes,
            TilingLevel::SubBlock => &self.sub_block_sizes,
            TilingLevel::BlockGroup => &self.block_group_sizes,
            TilingLevel::MiniBlockGroup => &self.mini_block_group_sizes,
            TilingLevel::SubBlockGroup => &self.sub_block_group_sizes,
        }
    }

    pub fn sizes_mut(&mut self, level: TilingLevel) -> &mut DimTuple {
        match level {
            TilingLevel::LocalDomain => &mut self.rank_sizes,
            TilingLevel::Region => &mut self.region_sizes,
            TilingLevel::Block => &mut self.block_sizes,
            TilingLevel::MiniBlock => &mut self.mini_block_sizes,
            TilingLevel::SubBlock => &mut self.sub_block_sizes,
            TilingLevel::BlockGroup => &mut self.block_group_sizes,
            TilingLevel::MiniBlockGroup => &mut self.mini_block_group_sizes,
            TilingLevel::SubBlockGroup => &mut self.sub_block_group_sizes,
        }
    }

    /// Set one entry of a level, checking the dimension kind.
    pub fn set_size(
        &mut self,
        dims: &DimCatalog,
        level: TilingLevel,
        dim: &str,
        size: Idx,
    ) -> Result<(), TilingError> {
        dims.check_dim_type(dim, "set_size", level.allows_step(), true, false)?;
        self.sizes_mut(level).set_val(dim, size);
        Ok(())
    }

    /// Thread budget with 0 replaced by `host_threads`.
    pub fn effective_max_threads(&self, host_threads: usize) -> usize {
        if self.max_threads == 0 {
            host_threads
        } else {
            self.max_threads
        }
    }

    /// Placement for halo storage once `dram_bytes` (earlier placements
    /// plus this request) would sit in DRAM. A `pmem_threshold` of 0 or less
    /// keeps everything in DRAM.
    pub fn halo_alloc_policy(&self, dram_bytes: usize) -> AllocPolicy {
        let threshold = usize::try_from(self.pmem_threshold)
            .ok()
            .filter(|&gib| gib > 0)
            .map(|gib| gib.saturating_mul(GIB));
        if threshold.is_some_and(|t| dram_bytes > t) {
            AllocPolicy::Pmem(self.numa_pref.max(0))
        } else if self.numa_pref >= 0 {
            AllocPolicy::Numa(self.numa_pref)
        } else {
            AllocPolicy::Aligned
        }
    }

    /// Apply one `name value` option, e.g. `("bx", "64")`, `("b", "32")` for
    /// every domain dim, `("bt", "2")`, or `("use_shm", "true")`.
    pub fn apply_option(&mut self, dims: &DimCatalog, name: &str, value: &str) -> Result<(), TilingError> {
        log::trace!("apply_option({name}, {value})");
        let bad = || TilingError::InvalidOptionValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        match name {
            "max_threads" => self.max_threads = parse_num(value).ok_or_else(bad)?,
            "thread_divisor" => self.thread_divisor = parse_num(value).ok_or_else(bad)?,
            "block_threads" => self.block_threads = parse_num(value).ok_or_else(bad)?,
            "bind_block_threads" => self.bind_block_threads = parse_bool(value).ok_or_else(bad)?,
            "overlap_comms" => self.overlap_comms = parse_bool(value).ok_or_else(bad)?,
            "use_shm" => self.use_shm = parse_bool(value).ok_or_else(bad)?,
            "numa_pref" => self.numa_pref = parse_num(value).ok_or_else(bad)?,
            "pmem_threshold" => self.pmem_threshold = parse_num(value).ok_or_else(bad)?,
            "min_exterior" => self.min_exterior = parse_num(value).ok_or_else(bad)?,
            "auto_tune_min_secs" => {
                self.auto_tune_min_secs = value.trim().parse::<f64>().map_err(|_| bad())?
            }
            _ => {
                let v: Idx = match parse_num(value) {
                    Some(v) => v,
                    None if self.size_option_target(dims, name).is_some() => return Err(bad()),
                    None => return Err(TilingError::UnknownOption(name.to_string())),
                };
                let (target, dim) = self
                    .size_option_target(dims, name)
                    .ok_or_else(|| TilingError::UnknownOption(name.to_string()))?;
                self.apply_size_option(dims, target, dim, v)?;
            }
        }
        Ok(())
    }

    // Longest prefix first so that "mbgx" is never read as "mb" + "gx".
    fn size_option_target<'n>(&self, dims: &DimCatalog, name: &'n str) -> Option<(SizeOption, &'n str)> {
        SizeOption::BY_PREFIX_LEN.iter().find_map(|&opt| {
            let rest = name.strip_prefix(opt.prefix())?;
            (rest.is_empty() || dims.dim_kind(rest).is_some()).then_some((opt, rest))
        })
    }

    fn apply_size_option(
        &mut self,
        dims: &DimCatalog,
        opt: SizeOption,
        dim: &str,
        v: Idx,
    ) -> Result<(), TilingError> {
        let func = format!("-{}", opt.prefix());
        let tuple = match opt {
            SizeOption::Global => &mut self.global_sizes,
            SizeOption::NumRanks => &mut self.num_ranks,
            SizeOption::RankIndex => {
                self.explicit_rank_indices = true;
                &mut self.rank_indices
            }
            SizeOption::Level(level) => {
                if !dim.is_empty() {
                    dims.check_dim_type(dim, &func, level.allows_step(), true, false)?;
                }
                self.sizes_mut(level)
            }
            SizeOption::LocalAlias => &mut self.rank_sizes,
        };
        if dim.is_empty() {
            for d in dims.domain_dims().names() {
                tuple.set_val(d, v);
            }
        } else {
            dims.check_dim_type(dim, &func, tuple.contains(dims.step_dim()), true, false)?;
            tuple.set_val(dim, v);
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SizeOption {
    Global,
    NumRanks,
    RankIndex,
    Level(TilingLevel),
    /// `d` is accepted as an old name for the local-domain size.
    LocalAlias,
}

impl SizeOption {
    const BY_PREFIX_LEN: [SizeOption; 12] = [
        SizeOption::Level(TilingLevel::MiniBlockGroup),
        SizeOption::Level(TilingLevel::SubBlockGroup),
        SizeOption::Level(TilingLevel::BlockGroup),
        SizeOption::Level(TilingLevel::MiniBlock),
        SizeOption::Level(TilingLevel::SubBlock),
        SizeOption::NumRanks,
        SizeOption::RankIndex,
        SizeOption::Global,
        SizeOption::Level(TilingLevel::LocalDomain),
        SizeOption::LocalAlias,
        SizeOption::Level(TilingLevel::Region),
        SizeOption::Level(TilingLevel::Block),
    ];

    fn prefix(self) -> &'static str {
        match self {
            SizeOption::Global => "g",
            SizeOption::NumRanks => "nr",
            SizeOption::RankIndex => "ri",
            SizeOption::LocalAlias => "d",
            SizeOption::Level(level) => level.option_prefix(),
        }
    }
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Option<T> {
    s.trim().parse().ok()
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> DimCatalog {
        DimCatalog::new("t", &["x", "y", "z"], &["m"]).unwrap()
    }

    #[test]
    fn defaults() {
        let d = dims();
        let s = TileSettings::new(&d);
        assert_eq!(s.block_sizes.make_dim_val_str(" "), "t=0 x=32 y=32 z=32");
        assert_eq!(s.region_sizes.sum(), 0);
        assert_eq!(s.num_ranks.make_val_str(" "), "0 0 0");
        assert_eq!(s.block_threads, 1);
        assert!(s.overlap_comms);
        assert!(!s.use_shm);
        assert!(s.max_threads >= 1);
    }

    #[test]
    fn per_dim_and_shortcut_options() {
        let d = dims();
        let mut s = TileSettings::new(&d);
        s.apply_option(&d, "b", "64").unwrap();
        s.apply_option(&d, "by", "16").unwrap();
        s.apply_option(&d, "bt", "2").unwrap();
        assert_eq!(s.block_sizes.make_val_str(" "), "2 64 16 64");
        s.apply_option(&d, "mbgz", "8").unwrap();
        assert_eq!(s.mini_block_group_sizes.get("z"), Some(8));
        s.apply_option(&d, "nrx", "4").unwrap();
        s.apply_option(&d, "g", "256").unwrap();
        s.apply_option(&d, "dz", "128").unwrap();
        assert_eq!(s.num_ranks.make_val_str(" "), "4 0 0");
        assert_eq!(s.global_sizes.make_val_str(" "), "256 256 256");
        assert_eq!(s.rank_sizes.get("z"), Some(128));
        assert!(!s.explicit_rank_indices);
        s.apply_option(&d, "rix", "1").unwrap();
        assert!(s.explicit_rank_indices);
    }

    #[test]
    fn scalar_options() {
        let d = dims();
        let mut s = TileSettings::new(&d);
        s.apply_option(&d, "block_threads", "4").unwrap();
        s.apply_option(&d, "bind_block_threads", "true").unwrap();
        s.apply_option(&d, "use_shm", "1").unwrap();
        s.apply_option(&d, "overlap_comms", "off").unwrap();
        s.apply_option(&d, "numa_pref", "2").unwrap();
        s.apply_option(&d, "auto_tune_min_secs", "0.5").unwrap();
        assert_eq!(s.block_threads, 4);
        assert!(s.bind_block_threads && s.use_shm && !s.overlap_comms);
        assert_eq!(s.halo_alloc_policy(0), AllocPolicy::Numa(2));
        assert_eq!(s.auto_tune_min_secs, 0.5);
    }

    #[test]
    fn option_errors() {
        let d = dims();
        let mut s = TileSettings::new(&d);
        assert!(matches!(
            s.apply_option(&d, "sbt", "2"),
            Err(TilingError::WrongDimKind { .. })
        ));
        assert!(matches!(
            s.apply_option(&d, "nrt", "2"),
            Err(TilingError::WrongDimKind { .. })
        ));
        assert!(matches!(
            s.apply_option(&d, "bm", "2"),
            Err(TilingError::WrongDimKind { .. })
        ));
        assert!(matches!(
            s.apply_option(&d, "bq", "2"),
            Err(TilingError::UnknownOption(_))
        ));
        assert!(matches!(
            s.apply_option(&d, "bx", "big"),
            Err(TilingError::InvalidOptionValue { .. })
        ));
        assert!(matches!(
            s.apply_option(&d, "use_shm", "maybe"),
            Err(TilingError::InvalidOptionValue { .. })
        ));
    }

    #[test]
    fn pmem_after_threshold() {
        let d = dims();
        let mut s = TileSettings::new(&d);
        s.pmem_threshold = 1;
        assert_eq!(s.halo_alloc_policy(0), AllocPolicy::Aligned);
        assert_eq!(s.halo_alloc_policy(GIB), AllocPolicy::Aligned);
        assert_eq!(s.halo_alloc_policy(GIB + 1), AllocPolicy::Pmem(0));

        s.numa_pref = 2;
        assert_eq!(s.halo_alloc_policy(GIB + 1), AllocPolicy::Pmem(2));
        for off in [0, -3] {
            s.pmem_threshold = off;
            assert_eq!(s.halo_alloc_policy(0), AllocPolicy::Numa(2));
            assert_eq!(s.halo_alloc_policy(usize::MAX), AllocPolicy::Numa(2));
        }
    }

    #[test]
    fn settings_roundtrip_json() {
        let d = dims();
        let mut s = TileSettings::new(&d);
        s.apply_option(&d, "rx", "96").unwrap();
        let json = serde_json::to_string(&s).unwrap();
        let back: TileSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
