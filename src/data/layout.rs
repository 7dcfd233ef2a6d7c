//! Variable storage layouts.
//!
//! A variable's shape is a [`DimTuple`] of allocated sizes plus one of a small
//! closed set of layouts. All three answer the same questions:
//! [`get_dims`](VarShape::get_dims), [`layout`](VarShape::layout) and
//! [`unlayout`](VarShape::unlayout).

use serde::{Deserialize, Serialize};

use crate::dims::{ceil_div, DimTuple};
use crate::tiling_error::TilingError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarLayout {
    /// A single element with no dimensions.
    Scalar,
    /// Vector-blocked: each run of `fold` points is stored contiguously,
    /// and the folds themselves are laid out row-major.
    Folded { fold: DimTuple },
    /// Plain row-major order, last dimension unit-stride.
    Traditional,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarShape {
    name: String,
    dims: DimTuple,
    layout: VarLayout,
    // Folded only: number of folds per dim, and the fold extent per dim.
    vec_sizes: DimTuple,
    fold_full: DimTuple,
}

impl VarShape {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dims: DimTuple::new(),
            layout: VarLayout::Scalar,
            vec_sizes: DimTuple::new(),
            fold_full: DimTuple::new(),
        }
    }

    pub fn traditional(name: impl Into<String>, dims: DimTuple) -> Result<Self, TilingError> {
        let name = name.into();
        check_sizes(&name, &dims)?;
        let ones = ones_like(&dims);
        Ok(Self {
            name,
            vec_sizes: dims.clone(),
            fold_full: ones,
            dims,
            layout: VarLayout::Traditional,
        })
    }

    /// A folded layout. Every dimension of `fold` must be a dimension of
    /// `dims`; dimensions missing from `fold` have a fold extent of 1.
    pub fn folded(name: impl Into<String>, dims: DimTuple, fold: DimTuple) -> Result<Self, TilingError> {
        let name = name.into();
        check_sizes(&name, &dims)?;
        let mut fold_full = ones_like(&dims);
        for (fd, fv) in fold.iter() {
            if fv < 1 {
                return Err(TilingError::InvalidDims(format!(
                    "fold value {fv} in '{fd}' dimension of var '{name}' is not positive"
                )));
            }
            if !fold_full.set_val(fd, fv) {
                return Err(TilingError::UnknownDim {
                    func: "VarShape::folded".into(),
                    dim: fd.to_string(),
                });
            }
        }
        let mut vec_sizes = dims.clone();
        for (i, (_, f)) in fold_full.iter().enumerate() {
            vec_sizes[i] = ceil_div(dims[i], f);
        }
        Ok(Self {
            name,
            dims,
            layout: VarLayout::Folded { fold },
            vec_sizes,
            fold_full,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &VarLayout {
        &self.layout
    }

    /// Logical sizes of the variable.
    pub fn get_dims(&self) -> &DimTuple {
        &self.dims
    }

    /// Number of storage elements, including fold padding.
    pub fn num_elements(&self) -> usize {
        match self.layout {
            VarLayout::Scalar => 1,
            _ => (self.vec_sizes.product() * self.fold_full.product()) as usize,
        }
    }

    /// Storage index of the point `idx`, or `None` if outside the variable.
    pub fn layout(&self, idx: &DimTuple) -> Option<usize> {
        match self.layout {
            VarLayout::Scalar => idx.is_empty().then_some(0),
            VarLayout::Traditional => self.dims.layout(idx),
            VarLayout::Folded { .. } => {
                // Bounds are checked against the logical sizes, not the padding.
                self.dims.layout(idx)?;
                let mut vec_idx = idx.clone();
                let mut elem_idx = idx.clone();
                for (i, (_, f)) in self.fold_full.iter().enumerate() {
                    vec_idx[i] = idx[i] / f;
                    elem_idx[i] = idx[i] % f;
                }
                let outer = self.vec_sizes.layout(&vec_idx)?;
                let inner = self.fold_full.layout(&elem_idx)?;
                Some(outer * self.fold_full.product() as usize + inner)
            }
        }
    }

    /// Point stored at storage index `i`. `None` for padding or out-of-range.
    pub fn unlayout(&self, i: usize) -> Option<DimTuple> {
        if i >= self.num_elements() {
            return None;
        }
        match self.layout {
            VarLayout::Scalar => Some(DimTuple::new()),
            VarLayout::Traditional => Some(self.dims.unlayout(i)),
            VarLayout::Folded { .. } => {
                let fold_pts = self.fold_full.product() as usize;
                let vec_idx = self.vec_sizes.unlayout(i / fold_pts);
                let elem_idx = self.fold_full.unlayout(i % fold_pts);
                let mut pt = vec_idx;
                for (k, (_, f)) in self.fold_full.iter().enumerate() {
                    pt[k] = pt[k] * f + elem_idx[k];
                }
                self.dims.layout(&pt).map(|_| pt)
            }
        }
    }
}

fn ones_like(dims: &DimTuple) -> DimTuple {
    let mut t = dims.clone();
    t.set_vals_same(1);
    t
}

fn check_sizes(name: &str, dims: &DimTuple) -> Result<(), TilingError> {
    match dims.iter().find(|&(_, v)| v < 1) {
        Some((d, v)) => Err(TilingError::InvalidDims(format!(
            "size {v} in '{d}' dimension of var '{name}' is not positive"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(pairs: &[(&str, i64)]) -> DimTuple {
        DimTuple::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn scalar_has_one_element() {
        let s = VarShape::scalar("c");
        assert_eq!(s.num_elements(), 1);
        assert_eq!(s.layout(&DimTuple::new()), Some(0));
        assert_eq!(s.unlayout(0), Some(DimTuple::new()));
        assert_eq!(s.unlayout(1), None);
    }

    #[test]
    fn traditional_is_row_major() {
        let s = VarShape::traditional("u", sizes(&[("x", 3), ("y", 5)])).unwrap();
        assert_eq!(s.layout(&sizes(&[("x", 1), ("y", 2)])), Some(7));
        assert_eq!(s.unlayout(7), Some(sizes(&[("x", 1), ("y", 2)])));
        assert_eq!(s.layout(&sizes(&[("x", 3), ("y", 0)])), None);
    }

    #[test]
    fn folded_keeps_vectors_contiguous() {
        let s = VarShape::folded("u", sizes(&[("x", 4), ("y", 8)]), sizes(&[("y", 4)])).unwrap();
        assert_eq!(s.num_elements(), 32);
        // y = 0..4 of row x = 0 form the first vector.
        for y in 0..4 {
            assert_eq!(s.layout(&sizes(&[("x", 0), ("y", y)])), Some(y as usize));
        }
        // Next vector is still x = 0, y = 4..8.
        assert_eq!(s.layout(&sizes(&[("x", 0), ("y", 4)])), Some(4));
        assert_eq!(s.layout(&sizes(&[("x", 1), ("y", 0)])), Some(8));
        let mut seen = vec![false; s.num_elements()];
        s.get_dims().visit_all_points(|pt, _| {
            let i = s.layout(pt).unwrap();
            assert!(!seen[i]);
            seen[i] = true;
            assert_eq!(s.unlayout(i).as_ref(), Some(pt));
            true
        });
        assert!(seen.iter().all(|&b| b));
    }

    #[test]
    fn folded_pads_partial_vectors() {
        let s = VarShape::folded("u", sizes(&[("x", 5)]), sizes(&[("x", 4)])).unwrap();
        assert_eq!(s.num_elements(), 8);
        assert_eq!(s.layout(&sizes(&[("x", 4)])), Some(4));
        assert_eq!(s.unlayout(5), None);
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(VarShape::traditional("u", sizes(&[("x", 0)])).is_err());
        assert!(VarShape::folded("u", sizes(&[("x", 4)]), sizes(&[("z", 2)])).is_err());
        assert!(VarShape::folded("u", sizes(&[("x", 4)]), sizes(&[("x", 0)])).is_err());
    }
}
