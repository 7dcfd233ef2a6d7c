//! Constants handed over by the stencil compiler.
//!
//! The compiler fixes the dimension catalog (with fold and cluster shape),
//! the element width, a flop estimate and, per variable, how wide a halo each
//! stage needs on each side at each step offset.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::Real;
use crate::dims::{DimCatalog, DimTuple, Idx};
use crate::tiling_error::TilingError;

/// Key of one halo requirement.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HaloKey {
    pub stage: String,
    pub left: bool,
    pub step_ofs: Idx,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StencilDescriptor {
    name: String,
    dims: DimCatalog,
    elem_bytes: usize,
    fpops_per_point: u64,
    // Var names in declaration order; exchange order follows it.
    vars: Vec<String>,
    halos: BTreeMap<String, BTreeMap<HaloKey, DimTuple>>,
}

impl StencilDescriptor {
    pub fn new(name: impl Into<String>, dims: DimCatalog) -> Self {
        Self {
            name: name.into(),
            dims,
            elem_bytes: std::mem::size_of::<Real>(),
            fpops_per_point: 0,
            vars: Vec::new(),
            halos: BTreeMap::new(),
        }
    }

    /// Declared element width. Only the width of [`Real`] is supported.
    pub fn with_elem_bytes(mut self, elem_bytes: usize) -> Result<Self, TilingError> {
        if elem_bytes != std::mem::size_of::<Real>() {
            return Err(TilingError::InvalidStencil(format!(
                "element width of {elem_bytes} bytes; this build uses {}-byte reals",
                std::mem::size_of::<Real>()
            )));
        }
        self.elem_bytes = elem_bytes;
        Ok(self)
    }

    pub fn with_fpops_per_point(mut self, fpops: u64) -> Self {
        self.fpops_per_point = fpops;
        self
    }

    /// Declare a variable with no halo (yet).
    pub fn add_var(&mut self, var: &str) {
        if !self.vars.iter().any(|v| v == var) {
            self.vars.push(var.to_string());
            self.halos.insert(var.to_string(), BTreeMap::new());
        }
    }

    /// Record the halo `sizes` (one per domain dim, in catalog order) that
    /// `stage` needs on one side of `var` at `step_ofs`. Declares `var` if new.
    pub fn add_halo(
        &mut self,
        var: &str,
        stage: &str,
        left: bool,
        step_ofs: Idx,
        sizes: &[Idx],
    ) -> Result<(), TilingError> {
        let nd = self.dims.num_domain_dims();
        if sizes.len() != nd {
            return Err(TilingError::InvalidStencil(format!(
                "halo of var '{var}' has {} sizes for {nd} domain dimensions",
                sizes.len()
            )));
        }
        if let Some(s) = sizes.iter().find(|&&s| s < 0) {
            return Err(TilingError::InvalidStencil(format!(
                "negative halo size {s} for var '{var}'"
            )));
        }
        let mut t = self.dims.new_domain_tuple(0);
        for (i, &s) in sizes.iter().enumerate() {
            t[i] = s;
        }
        self.add_var(var);
        let key = HaloKey {
            stage: stage.to_string(),
            left,
            step_ofs,
        };
        if let Some(m) = self.halos.get_mut(var) {
            m.insert(key, t);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &DimCatalog {
        &self.dims
    }

    pub fn elem_bytes(&self) -> usize {
        self.elem_bytes
    }

    pub fn fpops_per_point(&self) -> u64 {
        self.fpops_per_point
    }

    pub fn var_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.vars.iter().map(String::as_str)
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    /// Halo width on one side of `var`: the element-wise max over step
    /// offsets, restricted to `stage` if given. All zeros for unknown vars.
    pub fn halo_sizes(&self, var: &str, stage: Option<&str>, left: bool) -> DimTuple {
        let mut out = self.dims.new_domain_tuple(0);
        if let Some(m) = self.halos.get(var) {
            for (k, sizes) in m {
                if k.left == left && stage.is_none_or(|s| s == k.stage) {
                    out = out.max_elements(sizes);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> StencilDescriptor {
        let dims = DimCatalog::new("t", &["x", "y"], &[]).unwrap();
        let mut d = StencilDescriptor::new("iso3dfd", dims).with_fpops_per_point(61);
        d.add_halo("p", "main", true, 0, &[2, 1]).unwrap();
        d.add_halo("p", "main", true, 1, &[4, 0]).unwrap();
        d.add_halo("p", "bc", true, 0, &[1, 3]).unwrap();
        d.add_halo("p", "main", false, 0, &[2, 2]).unwrap();
        d.add_var("vel");
        d
    }

    #[test]
    fn halo_is_max_over_step_offsets() {
        let d = desc();
        assert_eq!(d.halo_sizes("p", Some("main"), true).make_val_str(","), "4,1");
        assert_eq!(d.halo_sizes("p", None, true).make_val_str(","), "4,3");
        assert_eq!(d.halo_sizes("p", None, false).make_val_str(","), "2,2");
        assert_eq!(d.halo_sizes("vel", None, false).make_val_str(","), "0,0");
        assert_eq!(d.halo_sizes("nope", None, true).make_val_str(","), "0,0");
        assert_eq!(d.var_names().collect::<Vec<_>>(), ["p", "vel"]);
    }

    #[test]
    fn rejects_bad_constants() {
        let mut d = desc();
        assert!(d.add_halo("p", "main", true, 0, &[1]).is_err());
        assert!(d.add_halo("p", "main", true, 0, &[1, -1]).is_err());
        let dims = DimCatalog::new("t", &["x"], &[]).unwrap();
        assert!(StencilDescriptor::new("s", dims.clone()).with_elem_bytes(4).is_err());
        assert!(StencilDescriptor::new("s", dims).with_elem_bytes(8).is_ok());
    }
}
