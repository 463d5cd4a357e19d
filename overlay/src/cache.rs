//! Fixed-size local cache backed by a memory-mapped sparse file.
//!
//! The mapping covers the whole device. Reads and writes are plain copies in
//! and out of it under a shared lock, so disjoint ranges never wait on each
//! other; [`MmapCache::close`] takes the lock exclusively and therefore waits
//! for in-flight copies before unmapping and closing the file.
//!
//! Overlapping concurrent writes race byte by byte, last writer wins. Callers
//! that need more must coordinate through a tracker.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    ptr,
    sync::{PoisonError, RwLock},
};

use memmap2::{MmapOptions, MmapRaw};

use crate::{
    device::{check_range, Device, ReadOnlyDevice},
    error::{map_io_err, Error, Result},
    sparse::SparseFile,
};

#[derive(Debug)]
enum State {
    /// `map` is `None` for zero-sized caches, which have nothing to map
    Open { file: File, map: Option<MmapRaw> },
    Closed,
}

#[derive(Debug)]
pub struct MmapCache {
    path: PathBuf,
    size: u64,
    warm: bool,
    state: RwLock<State>,
}

impl MmapCache {
    /// Create a fresh cache of `size` bytes, discarding whatever was at `path`.
    ///
    /// The file starts as one big hole.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(map_io_err("create cache file"))?;
        file.set_len(size).map_err(map_io_err("allocate cache file"))?;
        log::debug!("created cache {} ({} bytes)", path.display(), size);
        Self::map(path, file, size, false)
    }
    /// Reopen a previously populated cache; its length is the device size and
    /// its content is trusted.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(map_io_err("open cache file"))?;
        let size = file
            .metadata()
            .map_err(map_io_err("stat cache file"))?
            .len();
        log::debug!("reopened cache {} ({} bytes)", path.display(), size);
        Self::map(path, file, size, true)
    }
    /// Reopen the cache when it exists with exactly `size` bytes, otherwise
    /// start cold.
    pub fn open_or_create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() && meta.len() == size => Self::open(path),
            Ok(meta) => {
                log::info!(
                    "cache {} has {} bytes, expected {}, starting cold",
                    path.display(),
                    meta.len(),
                    size
                );
                Self::create(path, size)
            }
            Err(_) => Self::create(path, size),
        }
    }
    fn map(path: PathBuf, file: File, size: u64, warm: bool) -> Result<Self> {
        let map = if size == 0 {
            None
        } else {
            let len = usize::try_from(size).map_err(|_| Error::OutOfRange {
                offset: 0,
                len: size,
                size: usize::MAX as u64,
            })?;
            let raw = MmapOptions::new()
                .len(len)
                .map_raw(&file)
                .map_err(map_io_err("map cache file"))?;
            Some(raw)
        };
        Ok(Self {
            path,
            size,
            warm,
            state: RwLock::new(State::Open { file, map }),
        })
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// Whether the content came from a previous run.
    pub fn is_warm(&self) -> bool {
        self.warm
    }
    /// Bytes actually allocated on disk, which is less than the size while
    /// the file still has holes.
    pub fn file_size(&self) -> Result<u64> {
        self.with_open(|file, _| {
            let meta = file.metadata().map_err(map_io_err("stat cache file"))?;
            Ok(meta.blocks() * 512)
        })
    }
    /// Presence detector over the same file.
    pub fn sparse(&self) -> Result<SparseFile> {
        self.with_open(|file, _| {
            let file = file
                .try_clone()
                .map_err(map_io_err("duplicate cache descriptor"))?;
            Ok(SparseFile::from_file(file))
        })
    }
    /// Run `f` under the shared lock, failing once the cache is closed.
    fn with_open<R>(&self, f: impl FnOnce(&File, Option<&MmapRaw>) -> Result<R>) -> Result<R> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            State::Closed => Err(self.closed()),
            State::Open { file, map } => f(file, map.as_ref()),
        }
    }
    fn closed(&self) -> Error {
        Error::Closed {
            path: self.path.clone(),
        }
    }
}

impl ReadOnlyDevice for MmapCache {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_range(offset, buf.len(), self.size)?;
        self.with_open(|_, map| {
            let Some(raw) = map else {
                return Ok(0);
            };
            // SAFETY: the range is inside the mapping, which the shared lock
            // keeps alive for the duration of the copy.
            unsafe {
                ptr::copy_nonoverlapping(
                    raw.as_ptr().add(offset as usize),
                    buf.as_mut_ptr(),
                    buf.len(),
                );
            }
            Ok(buf.len())
        })
    }
    fn size(&self) -> u64 {
        self.size
    }
}

impl Device for MmapCache {
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        check_range(offset, buf.len(), self.size)?;
        self.with_open(|_, map| {
            let Some(raw) = map else {
                return Ok(0);
            };
            // SAFETY: as in `read_at`; the mapping is shared and writable,
            // concurrent writers to the same bytes race at byte level.
            unsafe {
                ptr::copy_nonoverlapping(
                    buf.as_ptr(),
                    raw.as_mut_ptr().add(offset as usize),
                    buf.len(),
                );
            }
            Ok(buf.len())
        })
    }
    fn sync(&self) -> Result<()> {
        self.with_open(|_, map| match map {
            Some(raw) => raw.flush().map_err(map_io_err("sync cache")),
            None => Ok(()),
        })
    }
    /// Flush, unmap and close the file.
    fn close(&self) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let State::Open { file, map } = std::mem::replace(&mut *state, State::Closed) else {
            return Err(self.closed());
        };
        let flushed = match map {
            Some(raw) => raw.flush().map_err(map_io_err("flush cache on close")),
            None => Ok(()),
        };
        drop(file);
        log::debug!("closed cache {}", self.path.display());
        flushed
    }
}
