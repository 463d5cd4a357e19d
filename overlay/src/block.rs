//! Block arithmetic shared by trackers, the cache and the overlay.
//!
//! A block is the unit of presence tracking and of Base fetches. Any byte
//! offset maps to the block containing it, so marking or checking is block
//! granular, never byte granular.

use crate::error::{Error, Result};

/// Default block size, matching the memory page size of the target hosts.
pub const BLOCK_SIZE: u64 = 4096;

#[inline]
pub fn block_idx(offset: u64, block_size: u64) -> u64 {
    offset / block_size
}

#[inline]
pub fn block_offset(idx: u64, block_size: u64) -> u64 {
    idx * block_size
}

/// number of blocks needed to cover `size` bytes
#[inline]
pub fn block_count(size: u64, block_size: u64) -> u64 {
    size.div_ceil(block_size)
}

pub fn validate_block_size(block_size: u64) -> Result<()> {
    if block_size == 0 || !block_size.is_power_of_two() {
        return Err(Error::InvalidBlockSize(block_size));
    }
    Ok(())
}

/// One block's share of a byte-range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// block index
    pub index: u64,
    /// device offset of the first byte of the block
    pub block_start: u64,
    /// length of the block, shorter than the block size only for the tail block
    pub block_len: usize,
    /// offset of the requested bytes inside the block
    pub inner: usize,
    /// number of requested bytes inside the block
    pub len: usize,
    /// offset of those bytes inside the caller's buffer
    pub buf_start: usize,
}

impl Span {
    #[inline]
    pub fn is_full(&self) -> bool {
        self.inner == 0 && self.len == self.block_len
    }
    #[inline]
    pub fn offset(&self) -> u64 {
        self.block_start + self.inner as u64
    }
    #[inline]
    pub fn buf_range(&self) -> std::ops::Range<usize> {
        self.buf_start..self.buf_start + self.len
    }
    #[inline]
    pub fn inner_range(&self) -> std::ops::Range<usize> {
        self.inner..self.inner + self.len
    }
}

/// Decomposes `offset..offset + len` into the blocks it spans, in offset order.
///
/// The range must already be bounds-checked against `device_size`.
#[derive(Debug, Clone)]
pub struct BlockSpans {
    block_size: u64,
    device_size: u64,
    cursor: u64,
    end: u64,
    buf_start: usize,
}

impl BlockSpans {
    pub fn new(offset: u64, len: usize, block_size: u64, device_size: u64) -> Self {
        Self {
            block_size,
            device_size,
            cursor: offset,
            end: offset + len as u64,
            buf_start: 0,
        }
    }
}

impl Iterator for BlockSpans {
    type Item = Span;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.end {
            return None;
        }
        let index = block_idx(self.cursor, self.block_size);
        let block_start = block_offset(index, self.block_size);
        let block_end = (block_start + self.block_size).min(self.device_size);
        let stop = block_end.min(self.end);
        let span = Span {
            index,
            block_start,
            block_len: (block_end - block_start) as usize,
            inner: (self.cursor - block_start) as usize,
            len: (stop - self.cursor) as usize,
            buf_start: self.buf_start,
        };
        self.buf_start += span.len;
        self.cursor = stop;
        Some(span)
    }
}
