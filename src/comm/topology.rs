//! Position of this rank in the Cartesian rank grid and its neighbors.
//!
//! Rank numbers are the row-major linearisation of per-dimension rank
//! indices (last domain dim fastest). Neighbor offsets are the points of
//! `{-1, 0, +1}^d`, enumerated in the same row-major order, so every rank
//! assigns the same index to the same offset. There is no wraparound: a
//! neighbor outside the grid does not exist.

use crate::debug_invariants::{ensure, DebugInvariants};
use crate::dims::{DimTuple, Idx};
use crate::tiling_error::TilingError;

/// One entry of the neighborhood, including the self entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighborInfo {
    /// Flat index in the offset enumeration.
    pub index: usize,
    /// Values in {-1, 0, +1} per domain dim.
    pub offset: DimTuple,
    /// Rank number, `None` if the neighbor would lie outside the grid.
    pub rank: Option<usize>,
}

impl NeighborInfo {
    pub fn is_self(&self) -> bool {
        self.offset.vals().all(|v| v == 0)
    }

    /// Manhattan distance of the offset (1 = face, 2 = edge, ...).
    pub fn distance(&self) -> Idx {
        self.offset.vals().map(Idx::abs).sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankTopology {
    num_ranks: DimTuple,
    rank_indices: DimTuple,
    my_rank: usize,
    // 3 in every domain dim.
    neighborhood_sizes: DimTuple,
    self_index: usize,
    neighbors: Vec<NeighborInfo>,
}

impl RankTopology {
    /// Build the neighbor table for the rank at `rank_indices` in a grid of
    /// `num_ranks` ranks per dimension.
    pub fn build(num_ranks: &DimTuple, rank_indices: &DimTuple) -> Result<Self, TilingError> {
        if num_ranks.is_empty() {
            return Err(TilingError::InvalidDims("rank grid has no dimensions".into()));
        }
        for (dim, count) in num_ranks.iter() {
            if count < 1 {
                return Err(TilingError::InvalidRankCount {
                    dim: dim.to_string(),
                    count,
                });
            }
            let index = rank_indices.get(dim).ok_or_else(|| TilingError::UnknownDim {
                func: "RankTopology::build".into(),
                dim: dim.to_string(),
            })?;
            if index < 0 || index >= count {
                return Err(TilingError::InvalidRankIndex {
                    dim: dim.to_string(),
                    index,
                    count,
                });
            }
        }
        // Reorder indices to the grid's dim order.
        let mut indices = num_ranks.clone();
        for (dim, v) in indices.iter_mut() {
            *v = rank_indices.get(dim).unwrap_or(0);
        }
        let my_rank = num_ranks.layout(&indices).ok_or_else(|| TilingError::InvalidRankIndex {
            dim: num_ranks.names().collect::<Vec<_>>().join(","),
            index: -1,
            count: num_ranks.product(),
        })?;

        let mut neighborhood_sizes = num_ranks.clone();
        neighborhood_sizes.set_vals_same(3);

        let mut neighbors = Vec::with_capacity(neighborhood_sizes.product() as usize);
        let mut self_index = 0;
        neighborhood_sizes.visit_all_points(|pt, index| {
            let mut offset = pt.clone();
            let mut nbr = indices.clone();
            let mut exists = true;
            for (k, (_, o)) in offset.iter_mut().enumerate() {
                *o -= 1;
                nbr[k] += *o;
                if nbr[k] < 0 || nbr[k] >= num_ranks[k] {
                    exists = false;
                }
            }
            let rank = if exists { num_ranks.layout(&nbr) } else { None };
            let info = NeighborInfo {
                index,
                offset,
                rank,
            };
            if info.is_self() {
                self_index = index;
            }
            neighbors.push(info);
            true
        });

        let topo = Self {
            num_ranks: num_ranks.clone(),
            rank_indices: indices,
            my_rank,
            neighborhood_sizes,
            self_index,
            neighbors,
        };
        topo.debug_assert_invariants();
        log::debug!(
            "rank {} at ({}) of ({}) has {} neighbor(s)",
            topo.my_rank,
            topo.rank_indices,
            topo.num_ranks,
            topo.num_existing_neighbors()
        );
        Ok(topo)
    }

    pub fn num_ranks(&self) -> &DimTuple {
        &self.num_ranks
    }

    pub fn rank_indices(&self) -> &DimTuple {
        &self.rank_indices
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    /// `3^d`, self included.
    pub fn neighborhood_size(&self) -> usize {
        self.neighbors.len()
    }

    pub fn self_index(&self) -> usize {
        self.self_index
    }

    /// Flat index of `offset`, or `None` if any value is outside {-1, 0, +1}.
    pub fn neighbor_index(&self, offset: &DimTuple) -> Option<usize> {
        let mut shifted = self.neighborhood_sizes.clone();
        for (dim, v) in shifted.iter_mut() {
            *v = offset.get(dim)? + 1;
        }
        self.neighborhood_sizes.layout(&shifted)
    }

    /// Rank number of the neighbor at `offset`; `None` if it does not exist.
    pub fn neighbor_rank(&self, offset: &DimTuple) -> Option<usize> {
        self.neighbor_index(offset)
            .and_then(|i| self.neighbors.get(i))
            .and_then(|n| n.rank)
    }

    pub fn neighbor(&self, index: usize) -> Option<&NeighborInfo> {
        self.neighbors.get(index)
    }

    /// Index of `offset` negated: how the neighbor at `offset` sees us.
    pub fn mirror_index(&self, index: usize) -> Option<usize> {
        // Row-major over a symmetric box: negating every coordinate
        // reverses the flat index.
        (index < self.neighbors.len()).then(|| self.neighbors.len() - 1 - index)
    }

    /// Call `f` for every existing, non-self neighbor in offset order.
    pub fn visit_neighbors<F>(&self, mut f: F)
    where
        F: FnMut(&NeighborInfo),
    {
        for n in self.existing_neighbors() {
            f(n);
        }
    }

    pub fn existing_neighbors(&self) -> impl Iterator<Item = &NeighborInfo> + '_ {
        self.neighbors
            .iter()
            .filter(move |n| n.index != self.self_index && n.rank.is_some())
    }

    pub fn num_existing_neighbors(&self) -> usize {
        self.existing_neighbors().count()
    }
}

impl DebugInvariants for RankTopology {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "RankTopology");
    }

    fn validate_invariants(&self) -> Result<(), TilingError> {
        const WHAT: &str = "rank topology";
        let total = self.num_ranks.product() as usize;
        let expected = 3usize.pow(self.num_ranks.num_dims() as u32);
        ensure(self.my_rank < total, WHAT, || format!("rank {} of {total}", self.my_rank))?;
        ensure(self.neighbors.len() == expected, WHAT, || {
            format!("{} neighborhood entries, expected {expected}", self.neighbors.len())
        })?;
        ensure(
            self.num_ranks.layout(&self.rank_indices) == Some(self.my_rank),
            WHAT,
            || format!("indices ({}) do not give rank {}", self.rank_indices, self.my_rank),
        )?;
        ensure(
            self.self_index == expected / 2
                && self.neighbors[self.self_index].rank == Some(self.my_rank),
            WHAT,
            || format!("self entry {} is not the center of the neighborhood", self.self_index),
        )?;
        for n in &self.neighbors {
            let ok = match n.rank {
                Some(r) if n.is_self() => r == self.my_rank,
                Some(r) => r < total && r != self.my_rank,
                None => !n.is_self(),
            };
            ensure(ok, WHAT, || format!("neighbor at offset ({}) has rank {:?}", n.offset, n.rank))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xy(x: Idx, y: Idx) -> DimTuple {
        DimTuple::from_pairs([("x", x), ("y", y)])
    }

    #[test]
    fn corner_rank_of_2x2() {
        let topo = RankTopology::build(&xy(2, 2), &xy(0, 0)).unwrap();
        assert_eq!(topo.my_rank(), 0);
        assert_eq!(topo.neighborhood_size(), 9);
        assert_eq!(topo.self_index(), 4);
        let mut seen = Vec::new();
        topo.visit_neighbors(|n| seen.push((n.offset.make_val_str(","), n.rank)));
        assert_eq!(
            seen,
            [
                ("0,1".to_string(), Some(1)),
                ("1,0".to_string(), Some(2)),
                ("1,1".to_string(), Some(3)),
            ]
        );
        assert_eq!(topo.neighbor_rank(&xy(-1, 0)), None);
        assert_eq!(topo.neighbor_rank(&xy(0, -1)), None);
        assert_eq!(topo.neighbor_rank(&xy(2, 0)), None);
    }

    #[test]
    fn interior_rank_sees_all_neighbors() {
        let d3 = |x, y, z| DimTuple::from_pairs([("x", x), ("y", y), ("z", z)]);
        let topo = RankTopology::build(&d3(3, 3, 3), &d3(1, 1, 1)).unwrap();
        assert_eq!(topo.my_rank(), 13);
        assert_eq!(topo.num_existing_neighbors(), 26);
        let mut n = 0;
        topo.visit_neighbors(|nb| {
            assert!(!nb.is_self());
            n += 1;
        });
        assert_eq!(n, 26);
    }

    #[test]
    fn mirror_index_negates_offset() {
        let topo = RankTopology::build(&xy(3, 3), &xy(1, 1)).unwrap();
        for i in 0..topo.neighborhood_size() {
            let m = topo.mirror_index(i).unwrap();
            let a = &topo.neighbor(i).unwrap().offset;
            let b = &topo.neighbor(m).unwrap().offset;
            assert!(a.vals().zip(b.vals()).all(|(u, v)| u == -v));
        }
        assert_eq!(topo.mirror_index(9), None);
    }

    #[test]
    fn rejects_out_of_grid_rank() {
        assert!(matches!(
            RankTopology::build(&xy(2, 2), &xy(0, 2)),
            Err(TilingError::InvalidRankIndex { index: 2, count: 2, .. })
        ));
        assert!(matches!(
            RankTopology::build(&xy(0, 2), &xy(0, 0)),
            Err(TilingError::InvalidRankCount { .. })
        ));
    }

    #[test]
    fn neighbor_ranks_are_symmetric() {
        let nr = xy(2, 3);
        let topos: Vec<_> = (0..6)
            .map(|r| RankTopology::build(&nr, &nr.unlayout(r)).unwrap())
            .collect();
        for t in &topos {
            t.visit_neighbors(|n| {
                let other = &topos[n.rank.unwrap()];
                let back = other.neighbor(t.mirror_index(n.index).unwrap()).unwrap();
                assert_eq!(back.rank, Some(t.my_rank()));
            });
        }
    }

    #[test]
    fn invariants_catch_a_moved_rank() {
        let mut topo = RankTopology::build(&xy(2, 2), &xy(1, 0)).unwrap();
        assert!(topo.validate_invariants().is_ok());
        topo.my_rank = 3;
        let err = topo.validate_invariants().unwrap_err();
        assert!(err.to_string().contains("indices (x=1, y=0) do not give rank 3"), "{err}");

        let mut topo = RankTopology::build(&xy(2, 2), &xy(1, 0)).unwrap();
        topo.self_index = 0;
        assert!(topo.validate_invariants().is_err());
    }
}
