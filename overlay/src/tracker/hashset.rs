use std::collections::HashSet;

use spin::rwlock::RwLock;

use super::Tracker;
use crate::block::block_idx;

/// Sparse tracker, one entry per touched block.
///
/// Fits lazily-faulted memory images where only a small part of a large
/// device is ever read.
#[derive(Debug)]
pub struct HashSetTracker {
    block_size: u64,
    blocks: RwLock<HashSet<u64>>,
}

impl HashSetTracker {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            blocks: RwLock::new(HashSet::new()),
        }
    }
}

impl Tracker for HashSetTracker {
    fn mark(&self, offset: u64) {
        let idx = block_idx(offset, self.block_size);
        // skip the writer lock when already present
        if self.blocks.read().contains(&idx) {
            return;
        }
        self.blocks.write().insert(idx);
    }
    fn is_marked(&self, offset: u64) -> bool {
        self.blocks
            .read()
            .contains(&block_idx(offset, self.block_size))
    }
    fn block_size(&self) -> u64 {
        self.block_size
    }
    fn marked_count(&self) -> u64 {
        self.blocks.read().len() as u64
    }
    fn marked_blocks(&self) -> Vec<u64> {
        let mut blocks: Vec<u64> = self.blocks.read().iter().copied().collect();
        blocks.sort_unstable();
        blocks
    }
}
