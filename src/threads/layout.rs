//! Two-level thread layout: region threads times block threads.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadLayout {
    /// Threads sharing out the regions (outer level).
    pub region_threads: usize,
    /// Threads inside each region thread (inner level).
    pub block_threads: usize,
    /// Budget after applying the divisor.
    pub available: usize,
}

impl ThreadLayout {
    pub fn total_threads(&self) -> usize {
        self.region_threads * self.block_threads
    }
}

/// Split `max_threads / thread_divisor` into region and block threads.
///
/// Integer truncation may leave some of the budget unused.
pub fn compute_layout(max_threads: usize, thread_divisor: usize, requested_block_threads: usize) -> ThreadLayout {
    let mt = max_threads.max(1);
    let td = thread_divisor.max(1);
    let available = (mt / td).max(1);
    let block_threads = requested_block_threads.clamp(1, available);
    let region_threads = (available / block_threads).max(1);
    log::debug!(
        "{available} threads available: {region_threads} region thread(s) x {block_threads} block thread(s)"
    );
    ThreadLayout {
        region_threads,
        block_threads,
        available,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_then_block_threads() {
        let l = compute_layout(16, 2, 4);
        assert_eq!((l.available, l.block_threads, l.region_threads), (8, 4, 2));
    }

    #[test]
    fn truncation_leaves_threads_idle() {
        let l = compute_layout(10, 1, 3);
        assert_eq!((l.region_threads, l.block_threads), (3, 3));
        assert_eq!(l.total_threads(), 9);
    }

    #[test]
    fn degenerate_inputs_give_one_thread() {
        assert_eq!(compute_layout(0, 0, 0).total_threads(), 1);
        assert_eq!(compute_layout(3, 8, 2).total_threads(), 1);
        let l = compute_layout(4, 1, 64);
        assert_eq!((l.region_threads, l.block_threads), (1, 4));
    }
}
