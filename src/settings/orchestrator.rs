//! Resolution of all tiling levels in dependency order.
//!
//! `local-domain -> region -> block -> mini-block -> sub-block -> groups`.
//! The caller's settings are never modified: [`adjust_settings`] resolves a
//! copy and returns it inside a [`TilingPlan`], so repeated calls with the
//! same input give the same plan.

use crate::debug_invariants::DebugInvariants;
use crate::dims::{DimCatalog, DimTuple, Idx};
use crate::settings::binding::{default_binding_dim, default_sub_block_size, explicit_binding_dim};
use crate::settings::resolver::{resolve_subsets, SubsetReport};
use crate::settings::{TileSettings, TilingLevel};
use crate::tiling_error::TilingError;

/// Subset counts at every level, each relative to its parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelCounts {
    pub regions: SubsetReport,
    pub blocks: SubsetReport,
    pub mini_blocks: SubsetReport,
    pub sub_blocks: SubsetReport,
    pub block_groups: SubsetReport,
    pub mini_block_groups: SubsetReport,
    pub sub_block_groups: SubsetReport,
}

impl LevelCounts {
    pub fn regions_per_rank(&self) -> Idx {
        self.regions.total
    }

    pub fn blocks_per_rank(&self) -> Idx {
        self.regions.total * self.blocks.total
    }

    pub fn mini_blocks_per_rank(&self) -> Idx {
        self.blocks_per_rank() * self.mini_blocks.total
    }

    pub fn sub_blocks_per_rank(&self) -> Idx {
        self.mini_blocks_per_rank() * self.sub_blocks.total
    }
}

/// Step-dimension sizes. The tiling modes are derived from them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TemporalTiling {
    pub region_steps: Idx,
    pub block_steps: Idx,
    pub mini_block_steps: Idx,
}

impl TemporalTiling {
    pub fn temporal_blocking(&self) -> bool {
        self.block_steps > 0
    }

    pub fn wave_front_rank_tiling(&self) -> bool {
        self.region_steps > 1
    }

    pub fn wave_front_block_tiling(&self) -> bool {
        self.mini_block_steps > 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TilingPlan {
    /// Fully resolved copy of the input settings.
    pub sizes: TileSettings,
    pub counts: LevelCounts,
    /// Domain dim that block threads split along.
    pub bind_dim: String,
    step_dim: String,
    cluster_pts: DimTuple,
}

impl TilingPlan {
    pub fn temporal(&self) -> TemporalTiling {
        let step = |t: &DimTuple| t.get(&self.step_dim).unwrap_or(0);
        TemporalTiling {
            region_steps: step(&self.sizes.region_sizes),
            block_steps: step(&self.sizes.block_sizes),
            mini_block_steps: step(&self.sizes.mini_block_sizes),
        }
    }

    pub fn step_dim(&self) -> &str {
        &self.step_dim
    }

    /// Points in one block, over the domain dims.
    pub fn points_per_block(&self) -> Idx {
        self.sizes
            .block_sizes
            .iter()
            .filter(|&(d, _)| d != self.step_dim)
            .map(|(_, v)| v)
            .product()
    }
}

impl DebugInvariants for TilingPlan {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "TilingPlan");
    }

    fn validate_invariants(&self) -> Result<(), TilingError> {
        for (dim, cpts) in self.cluster_pts.iter() {
            let mut outer: Option<(TilingLevel, Idx)> = None;
            for level in TilingLevel::NESTED {
                let size = self.sizes.sizes(level).get(dim).unwrap_or(0);
                if size <= 0 {
                    return Err(TilingError::UnresolvedSize {
                        level: level.name(),
                        dim: dim.to_string(),
                        size,
                    });
                }
                if size % cpts != 0 {
                    return Err(TilingError::NotMultiple {
                        level: level.name(),
                        dim: dim.to_string(),
                        size,
                        mult: cpts,
                    });
                }
                if let Some((olevel, osize)) = outer {
                    if size > osize {
                        return Err(TilingError::NestingViolation {
                            outer: olevel.name(),
                            inner: level.name(),
                            dim: dim.to_string(),
                            outer_size: osize,
                            inner_size: size,
                        });
                    }
                }
                outer = Some((level, size));
            }
        }
        let t = self.temporal();
        if t.region_steps < 0 || t.block_steps < 0 || t.mini_block_steps < 0 {
            return Err(TilingError::UnresolvedSize {
                level: TilingLevel::Region.name(),
                dim: self.step_dim.clone(),
                size: t.region_steps.min(t.block_steps).min(t.mini_block_steps),
            });
        }
        Ok(())
    }
}

// An inner level may never exceed the level that contains it.
fn clamp_to_parent(parent: &DimTuple, child: &mut DimTuple, level: TilingLevel, step_dim: &str) {
    for (dim, size) in child.iter_mut() {
        if dim == step_dim {
            continue;
        }
        if let Some(p) = parent.get(dim) {
            if p > 0 && *size > p {
                log::warn!(
                    "{} size {} in '{dim}' dimension exceeds enclosing size {p}; using {p}",
                    level.name(),
                    *size
                );
                *size = p;
            }
        }
    }
}

fn resolve_level(
    s: &mut TileSettings,
    parent: TilingLevel,
    child: TilingLevel,
    mults: &DimTuple,
    step_dim: &str,
) -> SubsetReport {
    let p = s.sizes(parent).clone();
    let c = s.sizes_mut(child);
    clamp_to_parent(&p, c, child, step_dim);
    resolve_subsets(&p, parent.name(), c, child.name(), mults, step_dim)
}

// Groups are traversal-order hints: unset entries start at 1 and are rounded
// up to whole tiles of the level they group.
fn resolve_group(
    s: &mut TileSettings,
    parent: TilingLevel,
    group: TilingLevel,
    grouped: TilingLevel,
    step_dim: &str,
) -> SubsetReport {
    let p = s.sizes(parent).clone();
    let mults = s.sizes(grouped).clone();
    let g = s.sizes_mut(group);
    for (dim, v) in g.iter_mut() {
        if dim != step_dim && *v == 0 {
            *v = 1;
        }
    }
    resolve_subsets(&p, parent.name(), g, group.name(), &mults, step_dim)
}

/// Resolve every tiling level of `settings`.
///
/// Local-domain sizes must already be set (see `setup_rank`) and be
/// multiples of the cluster shape.
pub fn adjust_settings(settings: &TileSettings, dims: &DimCatalog) -> Result<TilingPlan, TilingError> {
    let mut s = settings.clone();
    let step_dim = dims.step_dim();
    let cluster_pts = dims.cluster_pts().clone();

    for (dim, size) in s.rank_sizes.iter() {
        let cpts = cluster_pts.get(dim).unwrap_or(1);
        if size <= 0 {
            return Err(TilingError::UnresolvedSize {
                level: TilingLevel::LocalDomain.name(),
                dim: dim.to_string(),
                size,
            });
        }
        if size % cpts != 0 {
            return Err(TilingError::NotMultiple {
                level: TilingLevel::LocalDomain.name(),
                dim: dim.to_string(),
                size,
                mult: cpts,
            });
        }
    }

    // Step-dim sizes first.
    let mut steps = [
        s.region_sizes.get(step_dim).unwrap_or(0).max(0),
        s.block_sizes.get(step_dim).unwrap_or(0).max(0),
        s.mini_block_sizes.get(step_dim).unwrap_or(0).max(0),
    ];
    let [rt, bt, mbt] = &mut steps;
    if *rt == 0 {
        *rt = *bt;
    }
    if *rt < *bt {
        log::warn!("region size {rt} in '{step_dim}' dimension is below block size {bt}; using {bt}");
        *rt = *bt;
    }
    if *mbt == 0 || (*bt > 0 && *mbt > *bt) {
        *mbt = *bt;
    }
    s.region_sizes.set_val(step_dim, steps[0]);
    s.block_sizes.set_val(step_dim, steps[1]);
    s.mini_block_sizes.set_val(step_dim, steps[2]);

    let regions = resolve_level(&mut s, TilingLevel::LocalDomain, TilingLevel::Region, &cluster_pts, step_dim);
    log::info!("num-regions-per-local-domain-per-step: {}", regions.total);
    let blocks = resolve_level(&mut s, TilingLevel::Region, TilingLevel::Block, &cluster_pts, step_dim);
    log::info!("num-blocks-per-region-per-step: {}", blocks.total);
    let mini_blocks = resolve_level(&mut s, TilingLevel::Block, TilingLevel::MiniBlock, &cluster_pts, step_dim);
    log::info!("num-mini-blocks-per-block-per-step: {}", mini_blocks.total);

    // Slab-shaped default sub-blocks when block threads share a block.
    let nbt = Idx::try_from(s.block_threads).unwrap_or(Idx::MAX);
    let mut bind_dim = dims.outer_dim().to_string();
    if nbt > 1 && s.sub_block_sizes.sum() == 0 {
        let d = default_binding_dim(dims, &s.block_sizes, nbt);
        let sz = default_sub_block_size(dims, &s.block_sizes, d, nbt);
        s.sub_block_sizes.set_val(d, sz);
        bind_dim = d.to_string();
    }

    let sub_blocks = resolve_level(&mut s, TilingLevel::MiniBlock, TilingLevel::SubBlock, &cluster_pts, step_dim);
    log::info!("num-sub-blocks-per-mini-block-per-step: {}", sub_blocks.total);

    if s.bind_block_threads && nbt > 1 {
        bind_dim = explicit_binding_dim(dims, &s.block_sizes, &s.sub_block_sizes, nbt, &bind_dim).to_string();
        log::info!(
            "only the sub-block size in the '{bind_dim}' dimension is used at run-time \
             because block-thread binding is enabled on {nbt} block threads"
        );
    }

    let block_groups = resolve_group(&mut s, TilingLevel::Region, TilingLevel::BlockGroup, TilingLevel::Block, step_dim);
    let mini_block_groups = resolve_group(
        &mut s,
        TilingLevel::Block,
        TilingLevel::MiniBlockGroup,
        TilingLevel::MiniBlock,
        step_dim,
    );
    let sub_block_groups = resolve_group(
        &mut s,
        TilingLevel::MiniBlock,
        TilingLevel::SubBlockGroup,
        TilingLevel::SubBlock,
        step_dim,
    );

    let plan = TilingPlan {
        sizes: s,
        counts: LevelCounts {
            regions,
            blocks,
            mini_blocks,
            sub_blocks,
            block_groups,
            mini_block_groups,
            sub_block_groups,
        },
        bind_dim,
        step_dim: step_dim.to_string(),
        cluster_pts,
    };
    plan.validate_invariants()?;

    let t = plan.temporal();
    log::debug!(
        "temporal blocking {}, wave-front rank tiling {}, wave-front block tiling {}",
        t.temporal_blocking(),
        t.wave_front_rank_tiling(),
        t.wave_front_block_tiling()
    );
    Ok(plan)
}
