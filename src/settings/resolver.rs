//! Tile-size resolution: how many child tiles cover a parent tile.

use std::fmt;

use crate::dims::{round_up, DimTuple, Idx};

/// Per-dimension outcome of one resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DimSubsets {
    pub dim: String,
    pub parent_size: Idx,
    pub child_size: Idx,
    /// Full and partial children.
    pub num_subsets: Idx,
    pub num_full: Idx,
    /// Size of the trailing partial child, 0 if none.
    pub remainder: Idx,
}

impl DimSubsets {
    pub fn has_remainder(&self) -> bool {
        self.remainder != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubsetReport {
    pub parent_name: &'static str,
    pub child_name: &'static str,
    pub per_dim: Vec<DimSubsets>,
    /// Product of the per-dimension subset counts.
    pub total: Idx,
}

impl SubsetReport {
    pub fn dim(&self, name: &str) -> Option<&DimSubsets> {
        self.per_dim.iter().find(|d| d.dim == name)
    }
}

impl fmt::Display for SubsetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in self.per_dim.iter().filter(|d| d.parent_size > 0) {
            write!(
                f,
                " In '{}' dimension, {} of size {} contains {} {}(s) of size {}",
                d.dim, self.parent_name, d.parent_size, d.num_full, self.child_name, d.child_size
            )?;
            if d.has_remainder() {
                write!(f, " plus 1 remainder {} of size {}", self.child_name, d.remainder)?;
            }
            writeln!(f, ".")?;
        }
        Ok(())
    }
}

/// Resolve `child` against `parent` in every dimension except `step_dim`.
///
/// A child entry `<= 0` inherits the parent size; the result is then rounded
/// up to the dimension's entry in `mults` when that is above 1. The child
/// tuple is updated in place. A parent size of 0 gives 0 subsets.
pub fn resolve_subsets(
    parent: &DimTuple,
    parent_name: &'static str,
    child: &mut DimTuple,
    child_name: &'static str,
    mults: &DimTuple,
    step_dim: &str,
) -> SubsetReport {
    let mut per_dim = Vec::with_capacity(child.num_dims());
    let mut total: Idx = 1;
    for (dim, size) in child.iter_mut() {
        if dim == step_dim {
            continue;
        }
        let parent_size = parent.get(dim).unwrap_or(0);
        if *size <= 0 {
            *size = parent_size;
        }
        *size = round_up(*size, mults.get(dim).unwrap_or(1));
        let child_size = *size;

        let (num_subsets, remainder) = if child_size <= 0 {
            (0, 0)
        } else {
            (
                (parent_size + child_size - 1) / child_size,
                parent_size % child_size,
            )
        };
        let num_full = if remainder != 0 { num_subsets - 1 } else { num_subsets };
        total *= num_subsets;
        per_dim.push(DimSubsets {
            dim: dim.to_string(),
            parent_size,
            child_size,
            num_subsets,
            num_full,
            remainder,
        });
    }
    let report = SubsetReport {
        parent_name,
        child_name,
        per_dim,
        total,
    };
    log::debug!("{child_name}s per {parent_name}: {total}\n{report}");
    report
}
