//! Choice of the dimension along which block threads split a block.
//!
//! Two scans exist. [`default_binding_dim`] runs before sub-block resolution
//! when several block threads share a block and no sub-block size was given;
//! it shapes the default sub-blocks as slabs. [`explicit_binding_dim`] runs
//! after sub-block resolution when binding is requested, using the actual
//! sub-block sizes. They are kept apart; `tests/resolver_properties.rs`
//! checks where they agree.

use crate::dims::{ceil_div, round_up, DimCatalog, DimTuple, Idx};

/// First non-inner domain dim holding at least `block_threads` clusters of
/// the block, else the outer-most domain dim.
pub fn default_binding_dim<'d>(dims: &'d DimCatalog, block: &DimTuple, block_threads: Idx) -> &'d str {
    dims.domain_iter()
        .filter(|dd| dd.name != dims.inner_dim())
        .find(|dd| {
            let bsz = block.get(dd.name).unwrap_or(0);
            let cpts = dims.cluster_pts()[dd.domain_posn];
            bsz / cpts >= block_threads
        })
        .map_or(dims.outer_dim(), |dd| dd.name)
}

/// Sub-block size given to `bind_dim` by default: one cluster thick when
/// there are at least two domain dims, else an even share of the block.
pub fn default_sub_block_size(dims: &DimCatalog, block: &DimTuple, bind_dim: &str, block_threads: Idx) -> Idx {
    let cpts = dims.cluster_pts().get(bind_dim).unwrap_or(1);
    if dims.num_domain_dims() >= 2 {
        cpts
    } else {
        let bsz = block.get(bind_dim).unwrap_or(0);
        round_up(bsz / block_threads.max(1), cpts)
    }
}

/// First non-inner domain dim with at least `block_threads` sub-blocks per
/// block. Keeps `previous` when none qualifies.
pub fn explicit_binding_dim<'a>(
    dims: &'a DimCatalog,
    block: &DimTuple,
    sub_block: &DimTuple,
    block_threads: Idx,
    previous: &'a str,
) -> &'a str {
    dims.domain_iter()
        .filter(|dd| dd.name != dims.inner_dim())
        .find(|dd| {
            let bsz = block.get(dd.name).unwrap_or(0);
            let sbsz = sub_block.get(dd.name).unwrap_or(0);
            ceil_div(bsz, sbsz) >= block_threads
        })
        .map_or(previous, |dd| dd.name)
}
