use std::io::Write;

use crate::{
    block::{validate_block_size, BlockSpans},
    cache::MmapCache,
    device::{check_range, Device, ReadOnlyDevice},
    diff::{self, DiffMetadata},
    error::{Error, Result},
    tracker::Tracker,
};

/// A cache with nothing underneath.
///
/// Bytes only become readable once written; reading an absent block fails
/// with [`Error::BytesNotAvailable`] so the caller knows to supply it.
#[derive(Debug)]
pub struct LocalDevice<T> {
    cache: MmapCache,
    tracker: T,
}

impl<T: Tracker> LocalDevice<T> {
    pub fn new(cache: MmapCache, tracker: T) -> Result<Self> {
        validate_block_size(tracker.block_size())?;
        Ok(Self { cache, tracker })
    }
    pub fn cache(&self) -> &MmapCache {
        &self.cache
    }
    pub fn tracker(&self) -> &T {
        &self.tracker
    }
    pub fn export_diff<W: Write + ?Sized>(&self, out: &mut W) -> Result<DiffMetadata> {
        diff::export(&self.cache, &self.tracker, out)
    }
}

impl<T: Tracker> ReadOnlyDevice for LocalDevice<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_range(offset, buf.len(), self.size())?;
        let bs = self.tracker.block_size();
        let mut spans = BlockSpans::new(offset, buf.len(), bs, self.size());
        if let Some(missing) = spans.find(|x| !self.tracker.is_marked(x.block_start)) {
            return Err(Error::BytesNotAvailable {
                offset: missing.offset(),
                len: missing.len as u64,
            });
        }
        self.cache.read_at(buf, offset)
    }
    fn size(&self) -> u64 {
        self.cache.size()
    }
}

impl<T: Tracker> Device for LocalDevice<T> {
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let written = self.cache.write_at(buf, offset)?;
        self.tracker.mark_range(offset, buf.len() as u64);
        Ok(written)
    }
    fn sync(&self) -> Result<()> {
        self.cache.sync()
    }
    fn close(&self) -> Result<()> {
        self.cache.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tracker::HashSetTracker;

    #[test]
    fn unwritten_is_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MmapCache::create(dir.path().join("local.img"), 4 * 4096).unwrap();
        let local = LocalDevice::new(cache, HashSetTracker::new(4096)).unwrap();

        assert!(matches!(
            local.read_at(&mut [0_u8; 8], 4096),
            Err(Error::BytesNotAvailable {
                offset: 4096,
                len: 8
            })
        ));

        local.write_at(b"local!", 4096 + 4093).unwrap();
        let mut buf = [0_u8; 6];
        local.read_at(&mut buf, 4096 + 4093).unwrap();
        assert_eq!(buf, *b"local!");

        // third block was only touched by three bytes but counts as present
        assert!(local.read_at(&mut [0_u8; 100], 2 * 4096).is_ok());
        assert!(matches!(
            local.read_at(&mut [0_u8; 4096], 2 * 4096 + 10),
            Err(Error::BytesNotAvailable { offset, .. }) if offset == 3 * 4096
        ));

        let mut out = Vec::new();
        let meta = local.export_diff(&mut out).unwrap();
        assert_eq!(meta.dirty.marked_blocks(), vec![1, 2]);
        assert_eq!(out.len(), 2 * 4096);
        assert_eq!(&out[4093..4099], b"local!");
    }
}
