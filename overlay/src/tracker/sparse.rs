use super::Tracker;
use crate::{
    block::{block_count, block_idx, block_offset},
    error::Result,
    sparse::SparseFile,
};

/// Tracker without bookkeeping: a block is present once the cache file holds
/// data for it.
///
/// Marks are implied by the cache write that precedes them, so [`mark`] does
/// nothing. Presence survives restarts for free.
///
/// [`mark`]: Tracker::mark
#[derive(Debug)]
pub struct SparseTracker {
    file: SparseFile,
    size: u64,
    block_size: u64,
}

impl SparseTracker {
    /// Fails with `InvalidBlockSize` when blocks are finer than the file
    /// system tracks holes.
    pub fn new(file: SparseFile, size: u64, block_size: u64) -> Result<Self> {
        file.check_block_size(block_size)?;
        Ok(Self {
            file,
            size,
            block_size,
        })
    }
}

impl Tracker for SparseTracker {
    fn mark(&self, _: u64) {}
    fn is_marked(&self, offset: u64) -> bool {
        let start = block_offset(block_idx(offset, self.block_size), self.block_size);
        if start >= self.size {
            return false;
        }
        match self.file.first_marked(start) {
            Ok(data) => data < (start + self.block_size).min(self.size),
            Err(err) if err.is_end_of_data() => false,
            Err(err) => {
                // reading as absent only costs a refetch
                log::warn!("sparse presence check at {} failed: {}", start, err);
                false
            }
        }
    }
    fn block_size(&self) -> u64 {
        self.block_size
    }
    fn marked_count(&self) -> u64 {
        self.marked_blocks().len() as u64
    }
    fn marked_blocks(&self) -> Vec<u64> {
        let mut blocks: Vec<u64> = Vec::new();
        for range in self.file.data_ranges() {
            let (start, end) = match range {
                Ok(x) => x,
                Err(err) => {
                    log::warn!(
                        "sparse block scan stopped after {} blocks: {}",
                        blocks.len(),
                        err
                    );
                    break;
                }
            };
            let end = end.min(self.size);
            if end <= start {
                continue;
            }
            let mut first = block_idx(start, self.block_size);
            // a block straddling two data regions is listed once
            if let Some(last) = blocks.last() {
                first = first.max(last + 1);
            }
            blocks.extend(first..block_count(end, self.block_size));
        }
        blocks
    }
    fn implicit(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::FileExt;

    use super::*;
    use crate::error::Error;

    #[test]
    fn presence_from_file_layout() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(16 * 4096).unwrap();
        let tr = SparseTracker::new(SparseFile::open(file.path()).unwrap(), 16 * 4096, 4096)
            .unwrap();

        assert!(!tr.is_marked(5 * 4096));
        assert_eq!(tr.marked_count(), 0);

        file.as_file().write_all_at(&[9_u8; 4096], 5 * 4096).unwrap();
        file.as_file().write_all_at(&[9_u8; 8192], 9 * 4096).unwrap();
        tr.mark(5 * 4096);
        assert!(tr.is_marked(5 * 4096 + 100));
        assert!(!tr.is_marked(4 * 4096));
        assert!(!tr.is_marked(6 * 4096));
        assert_eq!(tr.marked_count(), 3);
        assert_eq!(tr.marked_blocks(), vec![5, 9, 10]);
    }
    #[test]
    fn rejects_blocks_finer_than_holes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(16 * 4096).unwrap();
        let sparse = SparseFile::open(file.path()).unwrap();
        assert!(matches!(
            SparseTracker::new(sparse, 16 * 4096, 512),
            Err(Error::InvalidBlockSize(512))
        ));
    }
}
