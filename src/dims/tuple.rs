//! `DimTuple`: an ordered mapping from dimension name to integer value.
//!
//! Insertion order is significant: it encodes memory layout, with the last
//! dimension having unit stride. All layout helpers here are row-major in
//! that order, which is also the order used to linearise the rank grid and
//! the neighbor-offset space.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Index, IndexMut};

/// Signed index/size type used for every tile, rank and offset value.
pub type Idx = i64;

/// Ordered sequence of `(name, value)` pairs with unique names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimTuple {
    dims: Vec<(String, Idx)>,
}

impl DimTuple {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tuple with the given names, all set to `val`.
    pub fn from_names<I, S>(names: I, val: Idx) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut t = Self::new();
        for n in names {
            t.add_dim_back(n, val);
        }
        t
    }

    /// Build a tuple from `(name, value)` pairs in order.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Idx)>,
        S: Into<String>,
    {
        let mut t = Self::new();
        for (n, v) in pairs {
            t.add_dim_back(n, v);
        }
        t
    }

    /// Append a dimension. If the name already exists only its value changes,
    /// so names stay unique.
    pub fn add_dim_back(&mut self, name: impl Into<String>, val: Idx) {
        let name = name.into();
        match self.get_mut(&name) {
            Some(v) => *v = val,
            None => self.dims.push((name, val)),
        }
    }

    /// Prepend a dimension (or update it in place if present).
    pub fn add_dim_front(&mut self, name: impl Into<String>, val: Idx) {
        let name = name.into();
        match self.get_mut(&name) {
            Some(v) => *v = val,
            None => self.dims.insert(0, (name, val)),
        }
    }

    #[inline]
    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn dim_name(&self, posn: usize) -> Option<&str> {
        self.dims.get(posn).map(|(n, _)| n.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.dims.iter().map(|(n, _)| n.as_str())
    }

    pub fn vals(&self) -> impl Iterator<Item = Idx> + '_ {
        self.dims.iter().map(|&(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Idx)> + '_ {
        self.dims.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Idx)> + '_ {
        self.dims.iter_mut().map(|(n, v)| (n.as_str(), v))
    }

    /// Position of `name`, if present.
    pub fn posn(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|(n, _)| n == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.posn(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Idx> {
        self.dims.iter().find(|(n, _)| n == name).map(|&(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Idx> {
        self.dims
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Set the value of an existing dimension. Returns `false` if absent.
    pub fn set_val(&mut self, name: &str, val: Idx) -> bool {
        match self.get_mut(name) {
            Some(v) => {
                *v = val;
                true
            }
            None => false,
        }
    }

    pub fn set_vals_same(&mut self, val: Idx) {
        for (_, v) in &mut self.dims {
            *v = val;
        }
    }

    /// Product of all values; 1 for an empty tuple.
    pub fn product(&self) -> Idx {
        self.vals().product()
    }

    pub fn sum(&self) -> Idx {
        self.vals().sum()
    }

    /// Copy of this tuple without the dimension at `posn`.
    pub fn remove_dim(&self, posn: usize) -> DimTuple {
        let mut out = self.clone();
        if posn < out.dims.len() {
            out.dims.remove(posn);
        }
        out
    }

    /// Element-wise max over the dimensions of `self` that `other` also has.
    pub fn max_elements(&self, other: &DimTuple) -> DimTuple {
        let mut out = self.clone();
        for (n, v) in out.iter_mut() {
            if let Some(o) = other.get(n) {
                *v = (*v).max(o);
            }
        }
        out
    }

    /// `self` followed by any dimensions of `other` that `self` lacks.
    pub fn make_union_with(&self, other: &DimTuple) -> DimTuple {
        let mut out = self.clone();
        for (n, v) in other.iter() {
            if !out.contains(n) {
                out.dims.push((n.to_string(), v));
            }
        }
        out
    }

    /// Flat row-major index of the point `offsets` inside the box whose sizes
    /// are `self`. `None` if the point lies outside the box.
    pub fn layout(&self, offsets: &DimTuple) -> Option<usize> {
        if offsets.num_dims() != self.num_dims() {
            return None;
        }
        let mut idx: usize = 0;
        for (&(_, size), &(_, ofs)) in self.dims.iter().zip(offsets.dims.iter()) {
            if ofs < 0 || ofs >= size {
                return None;
            }
            idx = idx * size as usize + ofs as usize;
        }
        Some(idx)
    }

    /// Inverse of [`layout`](Self::layout): the point with flat index `idx`.
    pub fn unlayout(&self, mut idx: usize) -> DimTuple {
        let mut out = self.clone();
        for (_, v) in out.dims.iter_mut().rev() {
            let size = (*v).max(1) as usize;
            *v = (idx % size) as Idx;
            idx /= size;
        }
        out
    }

    /// Call `visitor(point, flat_index)` for every point of the box whose sizes
    /// are `self`, in lexicographic (row-major) order. Stops early and returns
    /// `false` as soon as the visitor does.
    pub fn visit_all_points<F>(&self, mut visitor: F) -> bool
    where
        F: FnMut(&DimTuple, usize) -> bool,
    {
        if self.vals().any(|v| v <= 0) {
            return true;
        }
        if self.is_empty() {
            return visitor(self, 0);
        }
        let mut pt = self.clone();
        for (i, combo) in self
            .vals()
            .map(|v| 0..v)
            .multi_cartesian_product()
            .enumerate()
        {
            for ((_, slot), val) in pt.dims.iter_mut().zip(combo) {
                *slot = val;
            }
            if !visitor(&pt, i) {
                return false;
            }
        }
        true
    }

    /// `"x=3, y=4"` style rendering with a custom separator.
    pub fn make_dim_val_str(&self, sep: &str) -> String {
        self.iter().map(|(n, v)| format!("{n}={v}")).join(sep)
    }

    /// `"3 * 4"` style rendering of the values only.
    pub fn make_val_str(&self, sep: &str) -> String {
        self.vals().join(sep)
    }
}

impl fmt::Display for DimTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.make_dim_val_str(", "))
    }
}

/// Ordered by dimension count, then per-position value, then names.
impl Ord for DimTuple {
    fn cmp(&self, other: &Self) -> Ordering {
        self.num_dims()
            .cmp(&other.num_dims())
            .then_with(|| self.vals().cmp(other.vals()))
            .then_with(|| self.names().cmp(other.names()))
    }
}

impl PartialOrd for DimTuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Index<usize> for DimTuple {
    type Output = Idx;

    fn index(&self, posn: usize) -> &Idx {
        &self.dims[posn].1
    }
}

impl IndexMut<usize> for DimTuple {
    fn index_mut(&mut self, posn: usize) -> &mut Idx {
        &mut self.dims[posn].1
    }
}
