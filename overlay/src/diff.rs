//! Export of the blocks a cache holds, for uploading a layer on top of Base.
//!
//! Present blocks are visited in ascending order. Blocks holding data are
//! written to the output back to back; all-zero blocks are only recorded in
//! the `empty` set so the layer can encode them without bytes.

use std::io::Write;

use crate::{
    block::block_offset,
    cache::MmapCache,
    device::{Device, ReadOnlyDevice},
    error::{map_io_err, Result},
    tracker::{BitsetTracker, Tracker},
};

#[derive(Debug)]
pub struct DiffMetadata {
    pub block_size: u64,
    /// blocks written to the output, in output order
    pub dirty: BitsetTracker,
    /// present blocks that only hold zeros and were left out of the output
    pub empty: BitsetTracker,
}

/// Flush `cache` and write every block `tracker` marks to `out`.
///
/// Concurrent writes to the cache while exporting may or may not be captured.
pub fn export<T, W>(cache: &MmapCache, tracker: &T, out: &mut W) -> Result<DiffMetadata>
where
    T: Tracker + ?Sized,
    W: Write + ?Sized,
{
    cache.sync()?;
    let bs = tracker.block_size();
    let size = cache.size();
    let meta = DiffMetadata {
        block_size: bs,
        dirty: BitsetTracker::new(size, bs),
        empty: BitsetTracker::new(size, bs),
    };
    let mut block = vec![0_u8; bs as usize];
    for idx in tracker.marked_blocks() {
        let start = block_offset(idx, bs);
        if start >= size {
            continue;
        }
        let chunk = &mut block[..bs.min(size - start) as usize];
        cache.read_at(chunk, start)?;
        if chunk.iter().all(|x| *x == 0) {
            meta.empty.mark(start);
        } else {
            out.write_all(chunk).map_err(map_io_err("write diff"))?;
            meta.dirty.mark(start);
        }
    }
    out.flush().map_err(map_io_err("flush diff"))?;
    log::debug!(
        "exported {} dirty and {} empty blocks from {}",
        meta.dirty.marked_count(),
        meta.empty.marked_count(),
        cache.path().display()
    );
    Ok(meta)
}
