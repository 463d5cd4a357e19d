//! Which blocks of a device are already materialized in the cache.
//!
//! Presence is monotonic: there is no unmark. Every call is atomic on its own,
//! and the lock behind it is never held past the call.

mod bitset;
mod hashset;
mod sparse;

pub use bitset::BitsetTracker;
pub use hashset::HashSetTracker;
pub use sparse::SparseTracker;

use serde::{Deserialize, Serialize};

use crate::{
    block::{block_idx, block_offset},
    error::Result,
    sparse::SparseFile,
};

pub trait Tracker: Send + Sync {
    /// Mark the block containing `offset` as present.
    fn mark(&self, offset: u64);
    fn is_marked(&self, offset: u64) -> bool;
    fn block_size(&self) -> u64;
    /// number of marked blocks
    fn marked_count(&self) -> u64;
    /// Indices of the marked blocks, ascending.
    fn marked_blocks(&self) -> Vec<u64>;
    /// Mark every block spanned by `offset..offset + len`.
    fn mark_range(&self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let bs = self.block_size();
        for idx in block_idx(offset, bs)..=block_idx(offset + len - 1, bs) {
            self.mark(block_offset(idx, bs));
        }
    }
    /// Presence follows cache writes instead of explicit marks.
    fn implicit(&self) -> bool {
        false
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TrackerKind {
    /// one bit per block of the device
    #[default]
    Bitset,
    /// one entry per touched block
    HashSet,
    /// no bookkeeping, ask the cache file
    Sparse,
}

/// Static dispatch over the tracker implementations, chosen at construction.
#[derive(Debug)]
pub enum AnyTracker {
    Bitset(BitsetTracker),
    HashSet(HashSetTracker),
    Sparse(SparseTracker),
}

impl AnyTracker {
    /// `sparse` is only called for [`TrackerKind::Sparse`].
    pub fn new(
        kind: TrackerKind,
        size: u64,
        block_size: u64,
        sparse: impl FnOnce() -> Result<SparseFile>,
    ) -> Result<Self> {
        Ok(match kind {
            TrackerKind::Bitset => Self::Bitset(BitsetTracker::new(size, block_size)),
            TrackerKind::HashSet => Self::HashSet(HashSetTracker::new(block_size)),
            TrackerKind::Sparse => Self::Sparse(SparseTracker::new(sparse()?, size, block_size)?),
        })
    }
    pub fn kind(&self) -> TrackerKind {
        match self {
            Self::Bitset(_) => TrackerKind::Bitset,
            Self::HashSet(_) => TrackerKind::HashSet,
            Self::Sparse(_) => TrackerKind::Sparse,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $x:ident => $call:expr) => {
        match $self {
            AnyTracker::Bitset($x) => $call,
            AnyTracker::HashSet($x) => $call,
            AnyTracker::Sparse($x) => $call,
        }
    };
}

impl Tracker for AnyTracker {
    fn mark(&self, offset: u64) {
        dispatch!(self, x => x.mark(offset))
    }
    fn is_marked(&self, offset: u64) -> bool {
        dispatch!(self, x => x.is_marked(offset))
    }
    fn block_size(&self) -> u64 {
        dispatch!(self, x => x.block_size())
    }
    fn marked_count(&self) -> u64 {
        dispatch!(self, x => x.marked_count())
    }
    fn marked_blocks(&self) -> Vec<u64> {
        dispatch!(self, x => x.marked_blocks())
    }
    fn mark_range(&self, offset: u64, len: u64) {
        dispatch!(self, x => x.mark_range(offset, len))
    }
    fn implicit(&self) -> bool {
        dispatch!(self, x => x.implicit())
    }
}

/// Seed an explicit tracker from the data regions of a reopened cache file.
///
/// Returns the number of bytes found present. Fails with `InvalidBlockSize`
/// when the tracker's blocks are finer than the file's hole granularity.
pub fn restore<T: Tracker + ?Sized>(tracker: &T, sparse: &SparseFile) -> Result<u64> {
    sparse.check_block_size(tracker.block_size())?;
    let mut restored = 0;
    for range in sparse.data_ranges() {
        let (start, end) = range?;
        tracker.mark_range(start, end - start);
        restored += end - start;
    }
    log::debug!(
        "restored {} bytes of presence ({} blocks)",
        restored,
        tracker.marked_count()
    );
    Ok(restored)
}
