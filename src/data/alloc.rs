//! Host allocator for halo buffers.
//!
//! Storage is a slice of `AtomicU64` words so that one allocation can be
//! read and written through shared references from several ranks (threads)
//! at once; `Real` values travel through `to_bits`/`from_bits`. Ownership is
//! an `Arc<Allocation>`: the memory is freed when the last holder drops it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Real;
use crate::tiling_error::TilingError;

/// Allocations are rounded up to whole cache lines.
pub const CACHE_LINE_BYTES: usize = 64;
const WORD_BYTES: usize = std::mem::size_of::<u64>();

static_assertions::const_assert!(CACHE_LINE_BYTES % WORD_BYTES == 0);

/// Placement policy requested for an allocation. Fixed for its lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocPolicy {
    Aligned,
    /// Prefer the given NUMA node.
    Numa(i32),
    /// Persistent-memory device.
    Pmem(i32),
    /// Shareable with co-located ranks.
    Shm,
}

impl fmt::Display for AllocPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocPolicy::Aligned => write!(f, "aligned"),
            AllocPolicy::Numa(n) => write!(f, "NUMA node {n}"),
            AllocPolicy::Pmem(d) => write!(f, "PMEM device {d}"),
            AllocPolicy::Shm => write!(f, "shared memory"),
        }
    }
}

pub struct Allocation {
    words: Box<[AtomicU64]>,
    policy: AllocPolicy,
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("nbytes", &self.nbytes())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Allocation {
    pub fn policy(&self) -> AllocPolicy {
        self.policy
    }

    /// Capacity in 8-byte words.
    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    pub fn nbytes(&self) -> usize {
        self.words.len() * WORD_BYTES
    }

    /// Raw word access, used for the adjoined lock and ready flags.
    pub fn word(&self, i: usize) -> Option<&AtomicU64> {
        self.words.get(i)
    }

    pub fn load(&self, i: usize) -> Option<Real> {
        self.words
            .get(i)
            .map(|w| Real::from_bits(w.load(Ordering::Relaxed)))
    }

    pub fn store(&self, i: usize, v: Real) -> bool {
        match self.words.get(i) {
            Some(w) => {
                w.store(v.to_bits(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Copy `dst.len()` values starting at word `ofs` into `dst`.
    pub fn read_into(&self, ofs: usize, dst: &mut [Real]) -> Result<(), TilingError> {
        let src = self.range(ofs, dst.len())?;
        for (d, w) in dst.iter_mut().zip(src) {
            *d = Real::from_bits(w.load(Ordering::Relaxed));
        }
        Ok(())
    }

    /// Copy `src` into the words starting at `ofs`.
    pub fn write_from(&self, ofs: usize, src: &[Real]) -> Result<(), TilingError> {
        let dst = self.range(ofs, src.len())?;
        for (w, v) in dst.iter().zip(src) {
            w.store(v.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }

    fn range(&self, ofs: usize, len: usize) -> Result<&[AtomicU64], TilingError> {
        ofs.checked_add(len)
            .and_then(|end| self.words.get(ofs..end))
            .ok_or_else(|| TilingError::BufferSize {
                name: format!("allocation ({})", self.policy),
                len: self.words.len(),
                requested: ofs.saturating_add(len),
            })
    }
}

/// `allocate(bytes, policy) -> owned handle`; release is the last `Arc` drop.
pub trait Allocator: Send + Sync {
    fn allocate(&self, nbytes: usize, policy: AllocPolicy) -> Result<Arc<Allocation>, TilingError>;

    /// Bytes this allocator has already placed in DRAM for other data.
    fn dram_bytes(&self) -> usize {
        0
    }
}

/// Zero-initialised host memory. Placement policies are recorded, not
/// enforced; `limit_bytes` makes requests above a size fail like an
/// exhausted device would.
#[derive(Clone, Debug, Default)]
pub struct HostAllocator {
    pub limit_bytes: Option<usize>,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit_bytes: usize) -> Self {
        Self {
            limit_bytes: Some(limit_bytes),
        }
    }
}

/// Round `nbytes` up to whole cache lines.
pub fn round_to_cache_lines(nbytes: usize) -> usize {
    nbytes.div_ceil(CACHE_LINE_BYTES) * CACHE_LINE_BYTES
}

impl Allocator for HostAllocator {
    fn allocate(&self, nbytes: usize, policy: AllocPolicy) -> Result<Arc<Allocation>, TilingError> {
        let padded = round_to_cache_lines(nbytes);
        let alloc_err = |reason: String| TilingError::Alloc {
            nbytes,
            policy: policy.to_string(),
            reason,
        };
        if let Some(limit) = self.limit_bytes {
            if padded > limit {
                return Err(alloc_err(format!("request exceeds limit of {limit} bytes")));
            }
        }
        let nwords = padded / WORD_BYTES;
        let mut v: Vec<AtomicU64> = Vec::new();
        v.try_reserve_exact(nwords)
            .map_err(|e| alloc_err(e.to_string()))?;
        v.extend((0..nwords).map(|_| AtomicU64::new(0)));
        log::debug!("allocated {padded} bytes ({policy})");
        Ok(Arc::new(Allocation {
            words: v.into_boxed_slice(),
            policy,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_cache_lines_and_zeroes() {
        let a = HostAllocator::new().allocate(100, AllocPolicy::Aligned).unwrap();
        assert_eq!(a.nbytes(), 128);
        assert_eq!(a.len_words(), 16);
        assert!((0..16).all(|i| a.load(i) == Some(0.0)));
        assert_eq!(a.load(16), None);
    }

    #[test]
    fn read_write_ranges() {
        let a = HostAllocator::new().allocate(64, AllocPolicy::Numa(0)).unwrap();
        a.write_from(2, &[1.5, 2.5, 3.5]).unwrap();
        let mut out = [0.0; 3];
        a.read_into(2, &mut out).unwrap();
        assert_eq!(out, [1.5, 2.5, 3.5]);
        assert!(a.write_from(6, &[0.0; 3]).is_err());
        assert_eq!(a.policy(), AllocPolicy::Numa(0));
    }

    #[test]
    fn limit_reports_policy() {
        let err = HostAllocator::with_limit(64)
            .allocate(65, AllocPolicy::Pmem(1))
            .unwrap_err();
        assert!(matches!(err, TilingError::Alloc { nbytes: 65, .. }));
        assert!(err.to_string().contains("PMEM device 1"));
    }

    #[test]
    fn last_holder_frees() {
        let a = HostAllocator::new().allocate(8, AllocPolicy::Shm).unwrap();
        let b = Arc::clone(&a);
        assert_eq!(Arc::strong_count(&a), 2);
        drop(a);
        assert_eq!(Arc::strong_count(&b), 1);
    }
}
