use spin::rwlock::RwLock;

use super::Tracker;
use crate::block::{block_count, block_idx};

const WORD_BITS: u64 = u64::BITS as u64;

/// Dense tracker, one bit per block.
///
/// Memory is fixed at `size / block_size` bits however few blocks are touched,
/// which pays off when most of the device ends up being read.
#[derive(Debug)]
pub struct BitsetTracker {
    block_size: u64,
    blocks: u64,
    words: RwLock<Vec<u64>>,
}

impl BitsetTracker {
    pub fn new(size: u64, block_size: u64) -> Self {
        let blocks = block_count(size, block_size);
        let words = blocks.div_ceil(WORD_BITS) as usize;
        Self {
            block_size,
            blocks,
            words: RwLock::new(vec![0; words]),
        }
    }
    #[inline]
    fn locate(&self, offset: u64) -> Option<(usize, u64)> {
        let idx = block_idx(offset, self.block_size);
        (idx < self.blocks).then(|| ((idx / WORD_BITS) as usize, 1 << (idx % WORD_BITS)))
    }
}

impl Tracker for BitsetTracker {
    fn mark(&self, offset: u64) {
        // marks past the end of the device are dropped
        if let Some((word, bit)) = self.locate(offset) {
            self.words.write()[word] |= bit;
        }
    }
    fn is_marked(&self, offset: u64) -> bool {
        match self.locate(offset) {
            Some((word, bit)) => self.words.read()[word] & bit != 0,
            None => false,
        }
    }
    fn block_size(&self) -> u64 {
        self.block_size
    }
    fn marked_count(&self) -> u64 {
        self.words
            .read()
            .iter()
            .map(|x| x.count_ones() as u64)
            .sum()
    }
    fn marked_blocks(&self) -> Vec<u64> {
        let words = self.words.read();
        let mut blocks = Vec::new();
        for (i, word) in words.iter().enumerate() {
            let mut bits = *word;
            while bits != 0 {
                blocks.push(i as u64 * WORD_BITS + bits.trailing_zeros() as u64);
                bits &= bits - 1;
            }
        }
        blocks
    }
}
