//! Random-access byte devices of a fixed size.
//!
//! [`ReadOnlyDevice`] is what a Base has to provide, [`Device`] is what the
//! overlay exposes to transports. A successful call always transfers the whole
//! buffer; anything less is an error.

use std::{
    fs::File,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;

use crate::error::{map_io_err, Error, Result};

pub trait ReadOnlyDevice: Send + Sync {
    /// Fill `buf` with the bytes at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn size(&self) -> u64;
}

pub trait Device: ReadOnlyDevice {
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;
    /// Force written bytes to durable storage.
    fn sync(&self) -> Result<()>;
    /// Flush and release resources. Must be called at most once, after
    /// in-flight operations are drained.
    fn close(&self) -> Result<()>;
}

/// Rejects `offset..offset + len` unless it lies within `size`.
pub fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    let len = len as u64;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::OutOfRange { offset, len, size }),
    }
}

impl<T: ReadOnlyDevice + ?Sized> ReadOnlyDevice for Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).read_at(buf, offset)
    }
    fn size(&self) -> u64 {
        (**self).size()
    }
}

impl<T: Device + ?Sized> Device for Arc<T> {
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        (**self).write_at(buf, offset)
    }
    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

impl<T: ReadOnlyDevice + ?Sized> ReadOnlyDevice for &T {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).read_at(buf, offset)
    }
    fn size(&self) -> u64 {
        (**self).size()
    }
}

/// An in-memory image, mostly useful as a Base in tests and tools.
impl ReadOnlyDevice for Bytes {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_range(offset, buf.len(), self.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self[start..start + buf.len()]);
        Ok(buf.len())
    }
    fn size(&self) -> u64 {
        self.len() as u64
    }
}

/// Read-only Base backed by a local file.
///
/// The size is taken once at open; the file must not shrink afterwards.
#[derive(Debug)]
pub struct FileBase {
    path: PathBuf,
    file: File,
    size: u64,
}

impl FileBase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(map_io_err("open base file"))?;
        let size = file
            .metadata()
            .map_err(map_io_err("stat base file"))?
            .len();
        log::debug!("opened base file {} ({} bytes)", path.display(), size);
        Ok(Self { path, file, size })
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReadOnlyDevice for FileBase {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_range(offset, buf.len(), self.size)?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .file
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(map_io_err("read base file"))?;
            if n == 0 {
                return Err(Error::ShortRead {
                    offset,
                    expected: buf.len(),
                    got: filled,
                });
            }
            filled += n;
        }
        Ok(filled)
    }
    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn range_check() {
        assert!(check_range(0, 10, 10).is_ok());
        assert!(check_range(10, 0, 10).is_ok());
        assert!(matches!(
            check_range(5, 6, 10),
            Err(Error::OutOfRange {
                offset: 5,
                len: 6,
                size: 10
            })
        ));
        assert!(check_range(u64::MAX, 1, u64::MAX).is_err());
    }
    #[test]
    fn bytes_base() {
        let base = Bytes::from_static(b"111hello world111");
        let mut buf = [0_u8; 11];
        assert_eq!(base.read_at(&mut buf, 3).unwrap(), 11);
        assert_eq!(buf, *b"hello world");
        assert!(base.read_at(&mut buf, 7).is_err());
    }
    #[test]
    fn file_base() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"111hello world111").unwrap();
        file.flush().unwrap();

        let base = FileBase::open(file.path()).unwrap();
        assert_eq!(base.size(), 17);

        let mut buf = [0_u8; 11];
        base.read_at(&mut buf, 3).unwrap();
        assert_eq!(buf, *b"hello world");

        let err = base.read_at(&mut [0_u8; 4], 15).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
    }
}
