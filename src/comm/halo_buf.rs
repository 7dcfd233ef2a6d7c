//! One halo buffer: the box of points it covers plus a window into storage.
//!
//! Storage is either owned by this rank or attached to a segment another
//! co-located rank owns. Either way it is held through an `Arc`, so the
//! memory goes away when the last holder releases it. Shared buffers carry
//! two extra words right after the data: a spin lock and a ready flag.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::data::{Allocation, Real, CACHE_LINE_BYTES};
use crate::dims::{DimTuple, Idx};
use crate::tiling_error::TilingError;

const WORDS_PER_LINE: usize = CACHE_LINE_BYTES / std::mem::size_of::<u64>();

/// Lock word and ready-flag word.
pub const SHM_CONTROL_WORDS: usize = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufDir {
    Send,
    Recv,
}

impl fmt::Display for BufDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BufDir::Send => "send",
            BufDir::Recv => "recv",
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// This rank allocated the storage.
    Owned,
    /// Storage belongs to a neighbor's shared segment.
    Attached,
}

#[derive(Clone, Debug)]
struct Storage {
    alloc: Arc<Allocation>,
    ofs: usize,
    ownership: Ownership,
    shared: bool,
}

#[derive(Clone, Debug)]
pub struct HaloBuf {
    name: String,
    dir: BufDir,
    /// First point, in rank-local coordinates.
    begin: DimTuple,
    num_pts: DimTuple,
    vec_copy_ok: bool,
    storage: Option<Storage>,
}

/// Spin-lock guard over a shared buffer's lock word.
pub struct BufLock<'a> {
    word: &'a AtomicU64,
}

impl Drop for BufLock<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

impl HaloBuf {
    pub fn new(name: impl Into<String>, dir: BufDir, begin: DimTuple, num_pts: DimTuple) -> Self {
        Self {
            name: name.into(),
            dir,
            begin,
            num_pts,
            vec_copy_ok: false,
            storage: None,
        }
    }

    /// Mark whether whole vectors can be copied (extents and starts are
    /// fold multiples).
    pub fn with_vec_copy(mut self, fold: &DimTuple) -> Self {
        self.vec_copy_ok = self.num_pts.iter().all(|(d, n)| {
            let f = fold.get(d).unwrap_or(1).max(1);
            n % f == 0 && self.begin.get(d).unwrap_or(0) % f == 0
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> BufDir {
        self.dir
    }

    pub fn begin(&self) -> &DimTuple {
        &self.begin
    }

    /// Last point (inclusive), in rank-local coordinates.
    pub fn last(&self) -> DimTuple {
        let mut last = self.begin.clone();
        for (i, n) in self.num_pts.vals().enumerate() {
            last[i] += n - 1;
        }
        last
    }

    pub fn num_pts(&self) -> &DimTuple {
        &self.num_pts
    }

    pub fn vec_copy_ok(&self) -> bool {
        self.vec_copy_ok
    }

    /// Number of elements; 0 if any extent is 0.
    pub fn get_size(&self) -> usize {
        if self.num_pts.vals().any(|n| n <= 0) {
            0
        } else {
            self.num_pts.product() as usize
        }
    }

    pub fn get_bytes(&self) -> usize {
        self.get_size() * std::mem::size_of::<Real>()
    }

    /// Words to reserve for this buffer, padded to whole cache lines.
    pub fn padded_words(&self, shared: bool) -> usize {
        let n = self.get_size() + if shared { SHM_CONTROL_WORDS } else { 0 };
        n.div_ceil(WORDS_PER_LINE) * WORDS_PER_LINE
    }

    pub fn has_storage(&self) -> bool {
        self.storage.is_some()
    }

    pub fn ownership(&self) -> Option<Ownership> {
        self.storage.as_ref().map(|s| s.ownership)
    }

    pub fn is_shared(&self) -> bool {
        self.storage.as_ref().is_some_and(|s| s.shared)
    }

    /// Point this buffer at `ofs` words into `alloc`. Any storage held before
    /// is released first.
    pub fn set_storage(
        &mut self,
        alloc: Arc<Allocation>,
        ofs: usize,
        ownership: Ownership,
        shared: bool,
    ) -> Result<(), TilingError> {
        self.release_storage();
        let need = self.get_size() + if shared { SHM_CONTROL_WORDS } else { 0 };
        if ofs.saturating_add(need) > alloc.len_words() {
            return Err(TilingError::BufferSize {
                name: self.name.clone(),
                len: alloc.len_words().saturating_sub(ofs),
                requested: need,
            });
        }
        self.storage = Some(Storage {
            alloc,
            ofs,
            ownership,
            shared,
        });
        Ok(())
    }

    /// Drop this buffer's hold on its storage.
    pub fn release_storage(&mut self) {
        if let Some(s) = self.storage.take() {
            log::trace!(
                "releasing {:?} storage of '{}' ({} holder(s) left)",
                s.ownership,
                self.name,
                Arc::strong_count(&s.alloc) - 1
            );
        }
    }

    fn storage(&self) -> Result<&Storage, TilingError> {
        self.storage.as_ref().ok_or_else(|| TilingError::BufferSize {
            name: self.name.clone(),
            len: 0,
            requested: self.get_size(),
        })
    }

    fn check_len(&self, len: usize) -> Result<(), TilingError> {
        if len == self.get_size() {
            Ok(())
        } else {
            Err(TilingError::BufferSize {
                name: self.name.clone(),
                len: self.get_size(),
                requested: len,
            })
        }
    }

    /// Copy the whole buffer into `dst`.
    pub fn read(&self, dst: &mut [Real]) -> Result<(), TilingError> {
        self.check_len(dst.len())?;
        let s = self.storage()?;
        s.alloc.read_into(s.ofs, dst)
    }

    /// Overwrite the whole buffer from `src`.
    pub fn write(&self, src: &[Real]) -> Result<(), TilingError> {
        self.check_len(src.len())?;
        let s = self.storage()?;
        s.alloc.write_from(s.ofs, src)
    }

    fn control_word(&self, which: usize) -> Option<&AtomicU64> {
        let s = self.storage.as_ref().filter(|s| s.shared)?;
        s.alloc.word(s.ofs + self.get_size() + which)
    }

    /// Take the adjoined lock. `None` for buffers that are not shared.
    pub fn lock(&self) -> Option<BufLock<'_>> {
        let word = self.control_word(0)?;
        while word
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        Some(BufLock { word })
    }

    /// Whether the writer has filled the buffer and the reader has not yet
    /// drained it. Always `false` for buffers that are not shared.
    pub fn is_ready(&self) -> bool {
        self.control_word(1)
            .is_some_and(|w| w.load(Ordering::Acquire) != 0)
    }

    pub fn set_ready(&self, ready: bool) {
        if let Some(w) = self.control_word(1) {
            w.store(u64::from(ready), Ordering::Release);
        }
    }

    /// Visit every point of the buffer in row-major order.
    pub fn visit_points<F>(&self, mut f: F)
    where
        F: FnMut(&DimTuple, usize),
    {
        if self.get_size() == 0 {
            return;
        }
        let mut pt = self.begin.clone();
        self.num_pts.visit_all_points(|ofs, i| {
            for (k, v) in ofs.vals().enumerate() {
                pt[k] = self.begin[k] + v;
            }
            f(&pt, i);
            true
        });
    }
}

/// Start and width of a halo slab in one dimension.
pub fn slab(dir: BufDir, offset: Idx, rank_size: Idx, left_halo: Idx, right_halo: Idx) -> (Idx, Idx) {
    match (dir, offset.signum()) {
        (_, 0) => (0, rank_size),
        // Neighbor on the left: it needs our first `right_halo` points for
        // its right halo, and fills our left halo.
        (BufDir::Send, -1) => (0, right_halo),
        (BufDir::Recv, -1) => (-left_halo, left_halo),
        (BufDir::Send, _) => (rank_size - left_halo, left_halo),
        (BufDir::Recv, _) => (rank_size, right_halo),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AllocPolicy, Allocator, HostAllocator};

    fn buf(n: Idx) -> HaloBuf {
        HaloBuf::new(
            "u_send_x",
            BufDir::Send,
            DimTuple::from_pairs([("x", 0), ("y", 2)]),
            DimTuple::from_pairs([("x", n), ("y", 3)]),
        )
    }

    #[test]
    fn geometry() {
        let b = buf(2);
        assert_eq!(b.get_size(), 6);
        assert_eq!(b.get_bytes(), 48);
        assert_eq!(b.last().make_val_str(","), "1,4");
        assert_eq!(b.padded_words(false), 8);
        assert_eq!(b.padded_words(true), 8);
        assert_eq!(buf(0).get_size(), 0);
        let mut pts = Vec::new();
        b.visit_points(|p, i| pts.push((p.make_val_str(","), i)));
        assert_eq!(pts[0], ("0,2".to_string(), 0));
        assert_eq!(pts[5], ("1,4".to_string(), 5));
    }

    #[test]
    fn vec_copy_needs_fold_multiples() {
        let fold = DimTuple::from_pairs([("y", 2)]);
        assert!(!buf(2).with_vec_copy(&fold).vec_copy_ok());
        let fold = DimTuple::from_pairs([("x", 2)]);
        assert!(buf(2).with_vec_copy(&fold).vec_copy_ok());
    }

    #[test]
    fn set_storage_releases_previous() {
        let alloc = HostAllocator::new();
        let a = alloc.allocate(64, AllocPolicy::Aligned).unwrap();
        let b = alloc.allocate(64, AllocPolicy::Aligned).unwrap();
        let mut hb = buf(2);
        hb.set_storage(Arc::clone(&a), 0, Ownership::Owned, false).unwrap();
        assert_eq!(Arc::strong_count(&a), 2);
        hb.set_storage(Arc::clone(&b), 2, Ownership::Owned, false).unwrap();
        assert_eq!(Arc::strong_count(&a), 1);
        assert_eq!(Arc::strong_count(&b), 2);
        assert!(hb.set_storage(Arc::clone(&b), 4, Ownership::Owned, false).is_err());
        assert!(!hb.has_storage());
        assert_eq!(Arc::strong_count(&b), 1);
    }

    #[test]
    fn read_write_and_control_words() {
        let a = HostAllocator::new().allocate(64, AllocPolicy::Shm).unwrap();
        let mut hb = buf(2);
        hb.set_storage(a, 0, Ownership::Owned, true).unwrap();
        let vals = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        {
            let _g = hb.lock().expect("shared");
            hb.write(&vals).unwrap();
            hb.set_ready(true);
        }
        assert!(hb.is_ready());
        let mut out = [0.0; 6];
        hb.read(&mut out).unwrap();
        assert_eq!(out, vals);
        assert!(hb.read(&mut [0.0; 5]).is_err());
        hb.set_ready(false);
        assert!(!hb.is_ready());
        // Lock is free again.
        drop(hb.lock());
    }

    #[test]
    fn slabs_face_the_neighbor() {
        // size 10, left halo 2, right halo 3
        assert_eq!(slab(BufDir::Send, -1, 10, 2, 3), (0, 3));
        assert_eq!(slab(BufDir::Recv, -1, 10, 2, 3), (-2, 2));
        assert_eq!(slab(BufDir::Send, 1, 10, 2, 3), (8, 2));
        assert_eq!(slab(BufDir::Recv, 1, 10, 2, 3), (10, 3));
        assert_eq!(slab(BufDir::Recv, 0, 10, 2, 3), (0, 10));
    }
}
