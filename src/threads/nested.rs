//! Nested rayon pools for the region/block thread levels.
//!
//! The calling thread is nesting level 0. Work handed out by
//! [`NestedThreads::run_regions`] runs at level 1 on the region pool; work
//! from [`NestedThreads::run_blocks`] runs at level 2 on the block pool that
//! belongs to the calling region thread. The level is tracked per thread.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::cell::Cell;

use crate::threads::layout::ThreadLayout;
use crate::tiling_error::TilingError;

thread_local! {
    static NEST_LEVEL: Cell<usize> = const { Cell::new(0) };
}

/// Current parallel nesting level of this thread.
pub fn nest_level() -> usize {
    NEST_LEVEL.with(Cell::get)
}

struct LevelGuard {
    prev: usize,
}

impl LevelGuard {
    fn enter(level: usize) -> Self {
        let prev = NEST_LEVEL.with(|c| c.replace(level));
        Self { prev }
    }
}

impl Drop for LevelGuard {
    fn drop(&mut self) {
        NEST_LEVEL.with(|c| c.set(self.prev));
    }
}

fn check_level(setter: &'static str, expected: usize) -> Result<(), TilingError> {
    let found = nest_level();
    if found == expected {
        return Ok(());
    }
    let err = TilingError::ThreadNesting {
        setter,
        expected,
        found,
    };
    if cfg!(any(debug_assertions, feature = "strict-invariants")) {
        panic!("{err}");
    }
    Err(err)
}

pub struct NestedThreads {
    layout: ThreadLayout,
    region_pool: ThreadPool,
    // One per region thread.
    block_pools: Vec<ThreadPool>,
}

impl std::fmt::Debug for NestedThreads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedThreads")
            .field("layout", &self.layout)
            .finish()
    }
}

fn build_pool(n: usize, prefix: &'static str) -> Result<ThreadPool, TilingError> {
    ThreadPoolBuilder::new()
        .num_threads(n)
        .thread_name(move |i| format!("{prefix}-{i}"))
        .build()
        .map_err(|e| TilingError::ThreadPool(e.to_string()))
}

impl NestedThreads {
    pub fn new(layout: ThreadLayout) -> Result<Self, TilingError> {
        let region_pool = build_pool(layout.region_threads, "region")?;
        let block_pools = (0..layout.region_threads)
            .map(|_| build_pool(layout.block_threads, "block"))
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!(
            "nested thread pools: {} region x {} block",
            layout.region_threads,
            layout.block_threads
        );
        Ok(Self {
            layout,
            region_pool,
            block_pools,
        })
    }

    pub fn layout(&self) -> ThreadLayout {
        self.layout
    }

    /// Thread count for the outer region loop. Only valid at level 0.
    pub fn set_region_threads(&self) -> Result<usize, TilingError> {
        check_level("set_region_threads", 0)?;
        Ok(self.layout.region_threads)
    }

    /// Thread count for a block loop. Only valid inside a region (level 1).
    pub fn set_block_threads(&self) -> Result<usize, TilingError> {
        check_level("set_block_threads", 1)?;
        Ok(self.layout.block_threads)
    }

    /// Run `f(i)` for `i in 0..n` on the region threads.
    pub fn run_regions<F>(&self, n: usize, f: F) -> Result<(), TilingError>
    where
        F: Fn(usize) + Send + Sync,
    {
        self.set_region_threads()?;
        self.region_pool.install(|| {
            (0..n).into_par_iter().for_each(|i| {
                let _level = LevelGuard::enter(1);
                f(i);
            })
        });
        Ok(())
    }

    /// Run `f(i)` for `i in 0..n` on the block threads of the calling region
    /// thread.
    pub fn run_blocks<F>(&self, n: usize, f: F) -> Result<(), TilingError>
    where
        F: Fn(usize) + Send + Sync,
    {
        self.set_block_threads()?;
        let which = rayon::current_thread_index().unwrap_or(0) % self.block_pools.len().max(1);
        let pool = self
            .block_pools
            .get(which)
            .ok_or_else(|| TilingError::ThreadPool("no block pool".into()))?;
        pool.install(|| {
            (0..n).into_par_iter().for_each(|i| {
                let _level = LevelGuard::enter(2);
                f(i);
            })
        });
        Ok(())
    }
}
