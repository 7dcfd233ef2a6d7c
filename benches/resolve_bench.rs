use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use stencil_tiling::comm::RankTopology;
use stencil_tiling::dims::{DimCatalog, DimTuple};
use stencil_tiling::settings::{adjust_settings, TileSettings};

fn catalog() -> DimCatalog {
    DimCatalog::new("t", &["x", "y", "z"], &[])
        .unwrap()
        .with_fold(&[1, 4, 4])
        .unwrap()
        .with_cluster_mults(&[2, 1, 1])
        .unwrap()
}

fn bench_adjust_settings(c: &mut Criterion) {
    let mut group = c.benchmark_group("adjust_settings");
    let dims = catalog();

    for &(rank, block, threads) in &[(256, 64, 1usize), (512, 48, 4), (1024, 96, 8)] {
        let mut s = TileSettings::new(&dims);
        s.rank_sizes = DimTuple::from_pairs([("x", rank), ("y", rank), ("z", rank)]);
        s.block_sizes = DimTuple::from_pairs([("t", 2), ("x", block), ("y", block), ("z", block)]);
        s.block_threads = threads;
        s.bind_block_threads = threads > 1;

        group.bench_with_input(
            BenchmarkId::new(format!("rank{rank}_block{block}"), threads),
            &s,
            |b, s| {
                b.iter(|| {
                    let plan = adjust_settings(black_box(s), &dims).unwrap();
                    black_box(plan.counts.sub_blocks_per_rank())
                });
            },
        );
    }

    group.finish();
}

fn bench_topology(c: &mut Criterion) {
    let mut group = c.benchmark_group("rank_topology");
    let nr = DimTuple::from_pairs([("x", 8), ("y", 8), ("z", 8)]);
    let me = DimTuple::from_pairs([("x", 3), ("y", 4), ("z", 5)]);
    group.bench_function("build_3d_interior", |b| {
        b.iter(|| RankTopology::build(black_box(&nr), black_box(&me)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_adjust_settings, bench_topology);
criterion_main!(benches);
