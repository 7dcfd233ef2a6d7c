//! Dimension catalog: the step/domain/misc classification of dimension names.
//!
//! The catalog is fixed by the stencil compiler and never mutated at run
//! time. The step dimension is always first in the stencil-dims ordering;
//! the last domain dimension is the inner-most (unit-stride) one.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dims::tuple::{DimTuple, Idx};
use crate::tiling_error::TilingError;

/// The three disjoint kinds of dimension.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimKind {
    Step,
    Domain,
    Misc,
}

impl fmt::Display for DimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DimKind::Step => "the step dimension",
            DimKind::Domain => "a domain dimension",
            DimKind::Misc => "a misc dimension",
        })
    }
}

/// One entry of [`DimCatalog::domain_iter`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DomainDim<'a> {
    /// Position in the stencil dims (step dim is position 0).
    pub stencil_posn: usize,
    /// Position among the domain dims.
    pub domain_posn: usize,
    pub name: &'a str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimCatalog {
    step_dim: String,
    domain_dims: DimTuple,
    stencil_dims: DimTuple,
    misc_dims: DimTuple,
    inner_dim: String,
    outer_dim: String,
    fold_pts: DimTuple,
    cluster_mults: DimTuple,
    cluster_pts: DimTuple,
}

impl DimCatalog {
    /// Declare the step dimension, the domain dimensions (outer to inner) and
    /// any misc dimensions. Fold and cluster shapes start as all ones.
    pub fn new(step_dim: &str, domain_dims: &[&str], misc_dims: &[&str]) -> Result<Self, TilingError> {
        if step_dim.is_empty() {
            return Err(TilingError::InvalidDims("step dimension name is empty".into()));
        }
        let (outer, inner) = match (domain_dims.first(), domain_dims.last()) {
            (Some(o), Some(i)) => (o.to_string(), i.to_string()),
            _ => {
                return Err(TilingError::InvalidDims(
                    "at least one domain dimension is required".into(),
                ));
            }
        };
        let mut seen: Vec<&str> = vec![step_dim];
        for &d in domain_dims.iter().chain(misc_dims) {
            if d.is_empty() || seen.contains(&d) {
                return Err(TilingError::InvalidDims(format!(
                    "dimension name '{d}' is empty or declared twice"
                )));
            }
            seen.push(d);
        }

        let domain = DimTuple::from_names(domain_dims.iter().copied(), 0);
        let mut stencil = domain.clone();
        stencil.add_dim_front(step_dim, 0);
        let ones = DimTuple::from_names(domain_dims.iter().copied(), 1);

        Ok(Self {
            step_dim: step_dim.to_string(),
            domain_dims: domain,
            stencil_dims: stencil,
            misc_dims: DimTuple::from_names(misc_dims.iter().copied(), 0),
            inner_dim: inner,
            outer_dim: outer,
            fold_pts: ones.clone(),
            cluster_mults: ones.clone(),
            cluster_pts: ones,
        })
    }

    /// Set the vector-fold shape (points per SIMD unit, per domain dim).
    pub fn with_fold(mut self, fold: &[Idx]) -> Result<Self, TilingError> {
        self.fold_pts = self.positive_domain_tuple("fold", fold)?;
        self.update_cluster_pts();
        Ok(self)
    }

    /// Set the cluster multipliers (vectors per inner-loop iteration).
    pub fn with_cluster_mults(mut self, mults: &[Idx]) -> Result<Self, TilingError> {
        self.cluster_mults = self.positive_domain_tuple("cluster", mults)?;
        self.update_cluster_pts();
        Ok(self)
    }

    fn positive_domain_tuple(&self, what: &str, vals: &[Idx]) -> Result<DimTuple, TilingError> {
        if vals.len() != self.domain_dims.num_dims() {
            return Err(TilingError::InvalidDims(format!(
                "{what} shape has {} values for {} domain dimensions",
                vals.len(),
                self.domain_dims.num_dims()
            )));
        }
        if let Some(v) = vals.iter().find(|&&v| v < 1) {
            return Err(TilingError::InvalidDims(format!(
                "{what} shape value {v} is not positive"
            )));
        }
        let mut t = self.domain_dims.clone();
        for (i, &v) in vals.iter().enumerate() {
            t[i] = v;
        }
        Ok(t)
    }

    fn update_cluster_pts(&mut self) {
        let mut pts = self.fold_pts.clone();
        for i in 0..pts.num_dims() {
            pts[i] *= self.cluster_mults[i];
        }
        self.cluster_pts = pts;
    }

    pub fn step_dim(&self) -> &str {
        &self.step_dim
    }

    pub fn domain_dims(&self) -> &DimTuple {
        &self.domain_dims
    }

    pub fn stencil_dims(&self) -> &DimTuple {
        &self.stencil_dims
    }

    pub fn misc_dims(&self) -> &DimTuple {
        &self.misc_dims
    }

    pub fn inner_dim(&self) -> &str {
        &self.inner_dim
    }

    pub fn outer_dim(&self) -> &str {
        &self.outer_dim
    }

    pub fn fold_pts(&self) -> &DimTuple {
        &self.fold_pts
    }

    pub fn cluster_mults(&self) -> &DimTuple {
        &self.cluster_mults
    }

    /// Points consumed per inner-most loop iteration, per domain dim.
    pub fn cluster_pts(&self) -> &DimTuple {
        &self.cluster_pts
    }

    pub fn num_domain_dims(&self) -> usize {
        self.domain_dims.num_dims()
    }

    /// A stencil-dims tuple with every value set to `val`.
    pub fn new_stencil_tuple(&self, val: Idx) -> DimTuple {
        let mut t = self.stencil_dims.clone();
        t.set_vals_same(val);
        t
    }

    /// A domain-dims tuple with every value set to `val`.
    pub fn new_domain_tuple(&self, val: Idx) -> DimTuple {
        let mut t = self.domain_dims.clone();
        t.set_vals_same(val);
        t
    }

    pub fn dim_kind(&self, dim: &str) -> Option<DimKind> {
        if dim == self.step_dim {
            Some(DimKind::Step)
        } else if self.domain_dims.contains(dim) {
            Some(DimKind::Domain)
        } else if self.misc_dims.contains(dim) {
            Some(DimKind::Misc)
        } else {
            None
        }
    }

    /// Fail with a descriptive error unless `dim` is of an allowed kind.
    pub fn check_dim_type(
        &self,
        dim: &str,
        fn_name: &str,
        step_ok: bool,
        domain_ok: bool,
        misc_ok: bool,
    ) -> Result<DimKind, TilingError> {
        let kind = self.dim_kind(dim).ok_or_else(|| TilingError::UnknownDim {
            func: fn_name.to_string(),
            dim: dim.to_string(),
        })?;
        let ok = match kind {
            DimKind::Step => step_ok,
            DimKind::Domain => domain_ok,
            DimKind::Misc => misc_ok,
        };
        if ok {
            Ok(kind)
        } else {
            Err(TilingError::WrongDimKind {
                func: fn_name.to_string(),
                dim: dim.to_string(),
                kind,
            })
        }
    }

    /// Domain dims in order, with their stencil and domain positions.
    pub fn domain_iter(&self) -> impl Iterator<Item = DomainDim<'_>> + '_ {
        self.domain_dims
            .names()
            .enumerate()
            .map(|(j, name)| DomainDim {
                stencil_posn: j + 1,
                domain_posn: j,
                name,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txyz() -> DimCatalog {
        DimCatalog::new("t", &["x", "y", "z"], &["m"]).unwrap()
    }

    #[test]
    fn stencil_dims_start_with_step() {
        let d = txyz();
        assert_eq!(d.stencil_dims().names().collect::<Vec<_>>(), ["t", "x", "y", "z"]);
        assert_eq!(d.outer_dim(), "x");
        assert_eq!(d.inner_dim(), "z");
        let posns: Vec<_> = d.domain_iter().map(|dd| (dd.stencil_posn, dd.name)).collect();
        assert_eq!(posns, [(1, "x"), (2, "y"), (3, "z")]);
    }

    #[test]
    fn classifies_every_name_once() {
        let d = txyz();
        assert_eq!(d.dim_kind("t"), Some(DimKind::Step));
        assert_eq!(d.dim_kind("y"), Some(DimKind::Domain));
        assert_eq!(d.dim_kind("m"), Some(DimKind::Misc));
        assert_eq!(d.dim_kind("q"), None);
        assert!(DimCatalog::new("t", &["x", "t"], &[]).is_err());
        assert!(DimCatalog::new("t", &[], &[]).is_err());
    }

    #[test]
    fn check_dim_type_reports_kind() {
        let d = txyz();
        let err = d.check_dim_type("t", "get_num_ranks", false, true, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error in get_num_ranks(): dimension 't' is the step dimension, which is not allowed"
        );
        assert!(d.check_dim_type("x", "f", false, true, false).is_ok());
        assert!(matches!(
            d.check_dim_type("m", "f", true, true, false),
            Err(TilingError::WrongDimKind { kind: DimKind::Misc, .. })
        ));
        assert!(matches!(
            d.check_dim_type("w", "f", true, true, true),
            Err(TilingError::UnknownDim { .. })
        ));
    }

    #[test]
    fn cluster_is_fold_times_mults() {
        let d = txyz()
            .with_fold(&[1, 2, 8])
            .unwrap()
            .with_cluster_mults(&[2, 1, 1])
            .unwrap();
        assert_eq!(d.cluster_pts().make_val_str(" "), "2 2 8");
        assert!(txyz().with_fold(&[1, 0, 8]).is_err());
        assert!(txyz().with_fold(&[1, 8]).is_err());
    }
}
