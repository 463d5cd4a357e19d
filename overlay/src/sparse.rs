//! Presence derived from a sparse file's hole/data layout.
//!
//! A block that was never written is a hole in the cache file, so the file
//! system already knows which blocks are present. Queries cost a syscall but
//! no memory, and survive restarts because they live in the file itself.

use std::{fs::File, io, mem::MaybeUninit, os::fd::AsRawFd, path::Path};

use crate::error::{map_io_err, Error, Result};

#[derive(Debug)]
pub struct SparseFile {
    file: File,
}

impl SparseFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path).map_err(map_io_err("open sparse file"))?;
        Ok(Self { file })
    }
    pub fn from_file(file: File) -> Self {
        Self { file }
    }
    /// Start of the next data region at or after `offset`.
    pub fn first_marked(&self, offset: u64) -> Result<u64> {
        self.seek(offset, libc::SEEK_DATA)
    }
    /// Start of the next hole at or after `offset`.
    ///
    /// End of file counts as a hole, so inside the file this only fails when
    /// `offset` is at or past the end.
    pub fn first_unmarked(&self, offset: u64) -> Result<u64> {
        self.seek(offset, libc::SEEK_HOLE)
    }
    /// Iterate `(start, end)` of every data region, in file order.
    pub fn data_ranges(&self) -> DataRanges<'_> {
        DataRanges {
            file: self,
            cursor: Some(0),
        }
    }
    /// Smallest extent the file system tracks holes in: the larger of the
    /// file system block size and the page size.
    pub fn granularity(&self) -> Result<u64> {
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        // SAFETY: the descriptor is open and `stat` is valid for writes.
        let ret = unsafe { libc::fstatvfs(self.file.as_raw_fd(), stat.as_mut_ptr()) };
        if ret < 0 {
            return Err(Error::Io {
                op: "statvfs sparse file",
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: fstatvfs succeeded and filled the struct.
        let stat = unsafe { stat.assume_init() };
        // SAFETY: sysconf has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Ok((stat.f_bsize as u64).max(page.max(0) as u64))
    }
    /// Rejects block sizes finer than [`granularity`](Self::granularity):
    /// data written to one block would make its neighbours look present.
    pub fn check_block_size(&self, block_size: u64) -> Result<()> {
        let unit = self.granularity()?;
        if block_size < unit {
            log::warn!(
                "block size {} is below the {} byte hole granularity of the cache file",
                block_size,
                unit
            );
            return Err(Error::InvalidBlockSize(block_size));
        }
        Ok(())
    }
    fn seek(&self, offset: u64, whence: libc::c_int) -> Result<u64> {
        let Ok(pos) = libc::off_t::try_from(offset) else {
            return Err(Error::EndOfData { offset });
        };
        // SAFETY: the descriptor is owned by `self.file` and stays open for the call.
        let ret = unsafe { libc::lseek(self.file.as_raw_fd(), pos, whence) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENXIO) {
                return Err(Error::EndOfData { offset });
            }
            return Err(Error::Io {
                op: "seek sparse file",
                source: err,
            });
        }
        Ok(ret as u64)
    }
}

pub struct DataRanges<'a> {
    file: &'a SparseFile,
    cursor: Option<u64>,
}

impl Iterator for DataRanges<'_> {
    type Item = Result<(u64, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor.take()?;
        let start = match self.file.first_marked(cursor) {
            Ok(x) => x,
            Err(err) if err.is_end_of_data() => return None,
            Err(err) => return Some(Err(err)),
        };
        match self.file.first_unmarked(start) {
            Ok(end) => {
                self.cursor = Some(end);
                Some(Ok((start, end)))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::FileExt;

    use super::*;

    fn hole_then_data() -> (tempfile::NamedTempFile, SparseFile) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();
        file.as_file().write_all_at(&[7_u8; 4096], 4096).unwrap();
        let sparse = SparseFile::open(file.path()).unwrap();
        (file, sparse)
    }

    #[test]
    fn data_after_hole() {
        let (_file, sparse) = hole_then_data();
        assert_eq!(sparse.first_marked(0).unwrap(), 4096);
        assert_eq!(sparse.first_marked(4096).unwrap(), 4096);
    }
    #[test]
    fn hole_after_data_is_end_of_file() {
        let (_file, sparse) = hole_then_data();
        assert_eq!(sparse.first_unmarked(0).unwrap(), 0);
        assert_eq!(sparse.first_unmarked(4096).unwrap(), 8192);
    }
    #[test]
    fn past_end_is_end_of_data() {
        let (_file, sparse) = hole_then_data();
        assert!(sparse.first_marked(8192).unwrap_err().is_end_of_data());
        assert!(sparse.first_unmarked(8192).unwrap_err().is_end_of_data());
    }
    #[test]
    fn fully_sparse_file_has_no_data() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(1 << 20).unwrap();
        let sparse = SparseFile::open(file.path()).unwrap();
        assert!(sparse.first_marked(0).unwrap_err().is_end_of_data());
        assert_eq!(sparse.data_ranges().count(), 0);
    }
    #[test]
    fn block_size_below_granularity() {
        let (_file, sparse) = hole_then_data();
        let unit = sparse.granularity().unwrap();
        assert!(unit >= 4096);
        assert!(sparse.check_block_size(unit).is_ok());
        assert!(sparse.check_block_size(2 * unit).is_ok());
        assert!(matches!(
            sparse.check_block_size(512),
            Err(Error::InvalidBlockSize(512))
        ));
    }
    #[test]
    fn ranges() {
        let (_file, sparse) = hole_then_data();
        let ranges: Vec<_> = sparse.data_ranges().map(|x| x.unwrap()).collect();
        assert_eq!(ranges, vec![(4096, 8192)]);
    }
}
