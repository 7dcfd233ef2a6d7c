use proptest::prelude::*;

use stencil_tiling::comm::RankTopology;
use stencil_tiling::dims::{DimCatalog, DimTuple, Idx};
use stencil_tiling::settings::binding::default_binding_dim;
use stencil_tiling::settings::{adjust_settings, resolve_subsets, TileSettings, TilingLevel};
use stencil_tiling::threads::compute_layout;

fn one_dim(parent: Idx, child: Idx, mult: Idx) -> (DimTuple, DimTuple, DimTuple) {
    (
        DimTuple::from_pairs([("t", 0), ("x", parent)]),
        DimTuple::from_pairs([("t", 0), ("x", child)]),
        DimTuple::from_pairs([("x", mult)]),
    )
}

fn catalog(cx: Idx, cy: Idx) -> DimCatalog {
    DimCatalog::new("t", &["x", "y"], &[])
        .unwrap()
        .with_cluster_mults(&[cx, cy])
        .unwrap()
}

proptest! {
    #[test]
    fn resolved_child_is_aligned_and_tiles_parent(
        parent in 1i64..2000,
        child in -5i64..500,
        mult in 1i64..16,
    ) {
        let (p, mut c, m) = one_dim(parent, child, mult);
        let r = resolve_subsets(&p, "block", &mut c, "mini-block", &m, "t");
        let size = c.get("x").unwrap();
        let n = r.dim("x").unwrap().num_subsets;
        prop_assert!(size > 0);
        prop_assert_eq!(size % mult, 0);
        prop_assert!(n * size >= parent);
        prop_assert!((n - 1) * size < parent);
        prop_assert_eq!(r.total, n);
        // Step dim untouched.
        prop_assert_eq!(c.get("t"), Some(0));
    }

    #[test]
    fn resolution_is_idempotent(
        parent in 1i64..2000,
        child in 0i64..500,
        mult in 1i64..16,
    ) {
        let (p, mut c, m) = one_dim(parent, child, mult);
        let first = resolve_subsets(&p, "region", &mut c, "block", &m, "t");
        let once = c.clone();
        let second = resolve_subsets(&p, "region", &mut c, "block", &m, "t");
        prop_assert_eq!(&c, &once);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn levels_nest_and_stay_aligned(
        cx in 1i64..4,
        cy in 1i64..4,
        kx in 1i64..48,
        ky in 1i64..48,
        sizes in proptest::collection::vec(0i64..300, 8),
        block_threads in 1usize..6,
        bind in any::<bool>(),
    ) {
        let d = catalog(cx, cy);
        let mut s = TileSettings::new(&d);
        s.rank_sizes = DimTuple::from_pairs([("x", kx * cx), ("y", ky * cy)]);
        for (i, level) in [TilingLevel::Region, TilingLevel::Block, TilingLevel::MiniBlock, TilingLevel::SubBlock]
            .into_iter()
            .enumerate()
        {
            s.sizes_mut(level).set_val("x", sizes[2 * i]);
            s.sizes_mut(level).set_val("y", sizes[2 * i + 1]);
        }
        s.block_threads = block_threads;
        s.bind_block_threads = bind;

        let plan = adjust_settings(&s, &d).unwrap();
        for (dim, c) in [("x", cx), ("y", cy)] {
            let mut outer = Idx::MAX;
            for level in TilingLevel::NESTED {
                let v = plan.sizes.sizes(level).get(dim).unwrap();
                prop_assert!(v > 0);
                prop_assert_eq!(v % c, 0);
                prop_assert!(v <= outer, "{} size {} above enclosing {}", level, v, outer);
                outer = v;
            }
        }
        // Same input, same plan.
        prop_assert_eq!(adjust_settings(&s, &d).unwrap(), plan);
    }

    #[test]
    fn binding_scans_agree_on_default_sub_blocks(
        kx in 1i64..64,
        ky in 1i64..64,
        bx in 0i64..256,
        by in 0i64..64,
        block_threads in 2usize..9,
        cx in 1i64..4,
    ) {
        let d = DimCatalog::new("t", &["x", "y", "z"], &[])
            .unwrap()
            .with_cluster_mults(&[cx, 1, 1])
            .unwrap();
        let mut s = TileSettings::new(&d);
        s.rank_sizes = DimTuple::from_pairs([("x", kx * cx), ("y", ky), ("z", 16)]);
        s.block_sizes.set_val("x", bx);
        s.block_sizes.set_val("y", by);
        s.block_threads = block_threads;
        s.bind_block_threads = true;
        let plan = adjust_settings(&s, &d).unwrap();
        let nbt = block_threads as Idx;
        prop_assert_eq!(
            plan.bind_dim.as_str(),
            default_binding_dim(&d, &plan.sizes.block_sizes, nbt)
        );
    }

    #[test]
    fn thread_layout_fits_budget(
        max_threads in 0usize..512,
        divisor in 0usize..16,
        requested in 0usize..64,
    ) {
        let l = compute_layout(max_threads, divisor, requested);
        let available = (max_threads.max(1) / divisor.max(1)).max(1);
        prop_assert_eq!(l.available, available);
        prop_assert!(l.region_threads * l.block_threads <= available);
        prop_assert!(l.region_threads >= 1 && l.block_threads >= 1);
        if requested >= 1 && requested <= available {
            prop_assert_eq!(l.block_threads, requested);
        } else if requested > available {
            prop_assert_eq!(l.block_threads, available);
        }
    }

    #[test]
    fn neighbor_count_matches_position(
        nx in 1i64..5,
        ny in 1i64..5,
        nz in 1i64..5,
        seed in any::<u64>(),
    ) {
        let nr = DimTuple::from_pairs([("x", nx), ("y", ny), ("z", nz)]);
        let me = (seed % (nx * ny * nz) as u64) as usize;
        let idx = nr.unlayout(me);
        let topo = RankTopology::build(&nr, &idx).unwrap();
        prop_assert_eq!(topo.my_rank(), me);
        // Per dim: 1 (self) plus one per side that has a rank.
        let mut expected = 1usize;
        for (dim, n) in nr.iter() {
            let i = idx.get(dim).unwrap();
            expected *= 1 + usize::from(i > 0) + usize::from(i < n - 1);
        }
        prop_assert_eq!(topo.num_existing_neighbors(), expected - 1);
        let mut seen = 0;
        topo.visit_neighbors(|n| {
            assert!(!n.is_self());
            seen += 1;
        });
        prop_assert_eq!(seen, expected - 1);
    }
}
