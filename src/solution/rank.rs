//! Placement of this rank in the rank grid and its share of the domain.

use crate::comm::{Communicator, RankTopology};
use crate::dims::{DimCatalog, DimTuple, Idx};
use crate::settings::{TileSettings, TilingLevel};
use crate::tiling_error::TilingError;

/// Result of [`setup_rank`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankSetup {
    pub topology: RankTopology,
    /// Global index of this rank's first point, per domain dim.
    pub rank_offsets: DimTuple,
}

fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            out.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        out.push(n);
    }
    out.sort_unstable_by(|a, b| b.cmp(a));
    out
}

/// Fill zero entries of `num_ranks` so that the grid holds `comm_size` ranks.
///
/// Prime factors of what is left to place are handed out largest first,
/// each to the unset dim with the fewest ranks so far (outer-most on ties).
pub fn fill_rank_counts(num_ranks: &mut DimTuple, comm_size: usize) -> Result<(), TilingError> {
    let mismatch = |grid: Idx| TilingError::RankCountMismatch {
        grid,
        comm: comm_size,
    };
    if let Some((dim, count)) = num_ranks.iter().find(|&(_, n)| n < 0) {
        return Err(TilingError::InvalidRankCount {
            dim: dim.to_string(),
            count,
        });
    }
    let unset: Vec<usize> = num_ranks
        .vals()
        .enumerate()
        .filter(|&(_, n)| n == 0)
        .map(|(i, _)| i)
        .collect();
    let fixed: Idx = num_ranks.vals().filter(|&n| n > 0).product();
    if unset.is_empty() {
        return if fixed as usize == comm_size {
            Ok(())
        } else {
            Err(mismatch(fixed))
        };
    }
    let fixed_u = usize::try_from(fixed).map_err(|_| mismatch(fixed))?;
    if fixed_u == 0 || comm_size % fixed_u != 0 {
        return Err(mismatch(fixed));
    }
    for &i in &unset {
        num_ranks[i] = 1;
    }
    for f in prime_factors(comm_size / fixed_u) {
        let mut best = unset[0];
        for &i in &unset[1..] {
            if num_ranks[i] < num_ranks[best] {
                best = i;
            }
        }
        num_ranks[best] *= f as Idx;
    }
    log::debug!("rank grid filled to {}", num_ranks.make_dim_val_str(" * "));
    Ok(())
}

/// Place this rank and size its local domain.
///
/// Updates `num_ranks`, `rank_indices`, `global_sizes` and `rank_sizes` of
/// `settings` in place.
pub fn setup_rank<C: Communicator>(
    settings: &mut TileSettings,
    dims: &DimCatalog,
    comm: &C,
) -> Result<RankSetup, TilingError> {
    let me = comm.rank();
    fill_rank_counts(&mut settings.num_ranks, comm.size())?;

    if !settings.explicit_rank_indices {
        settings.rank_indices = settings.num_ranks.unlayout(me);
    }
    let topology = RankTopology::build(&settings.num_ranks, &settings.rank_indices)?;
    if topology.my_rank() != me {
        return Err(TilingError::RankIndexMismatch {
            indices: settings.rank_indices.make_dim_val_str("="),
            expected: me,
            found: topology.my_rank(),
        });
    }

    let cluster_pts = dims.cluster_pts();
    let mut rank_offsets = dims.new_domain_tuple(0);
    for dd in dims.domain_iter() {
        let j = dd.domain_posn;
        let nr = settings.num_ranks.get(dd.name).unwrap_or(1);
        let ri = topology.rank_indices().get(dd.name).unwrap_or(0);
        let global = settings.global_sizes[j];
        let mut local = settings.rank_sizes[j];

        if local <= 0 {
            if global <= 0 {
                return Err(TilingError::DomainSizeMissing(dd.name.to_string()));
            }
            let base = global / nr;
            if base == 0 {
                return Err(TilingError::UnresolvedSize {
                    level: TilingLevel::LocalDomain.name(),
                    dim: dd.name.to_string(),
                    size: 0,
                });
            }
            local = if ri == nr - 1 { global - base * (nr - 1) } else { base };
            rank_offsets[j] = base * ri;
        } else {
            if global <= 0 {
                settings.global_sizes[j] = local * nr;
            } else if global != local * nr {
                log::warn!(
                    "global size {global} in '{}' dimension differs from {nr} ranks of {local}",
                    dd.name
                );
            }
            rank_offsets[j] = local * ri;
        }

        let cpts = cluster_pts.get(dd.name).unwrap_or(1);
        if local % cpts != 0 {
            return Err(TilingError::NotMultiple {
                level: TilingLevel::LocalDomain.name(),
                dim: dd.name.to_string(),
                size: local,
                mult: cpts,
            });
        }
        settings.rank_sizes[j] = local;
    }
    settings.rank_indices = topology.rank_indices().clone();

    log::info!(
        "rank {me}: indices ({}), local domain {} at offset ({})",
        settings.rank_indices,
        settings.rank_sizes.make_dim_val_str(" * "),
        rank_offsets
    );
    Ok(RankSetup {
        topology,
        rank_offsets,
    })
}
