use std::{io, path::PathBuf};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("range {offset}+{len} is out of device bounds ({size} bytes)")]
    OutOfRange { offset: u64, len: u64, size: u64 },
    #[error("base read failed at {offset}+{len}")]
    Base {
        offset: u64,
        len: u64,
        #[source]
        source: Box<Error>,
    },
    #[error("block cache already closed for path {}", path.display())]
    Closed { path: PathBuf },
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("short read at {offset}: expected {expected} bytes, got {got}")]
    ShortRead {
        offset: u64,
        expected: usize,
        got: usize,
    },
    #[error("no more data or hole after offset {offset}")]
    EndOfData { offset: u64 },
    #[error("bytes {offset}+{len} are not available in cache")]
    BytesNotAvailable { offset: u64, len: u64 },
    #[error("unusable block size {0}: not a power of two, or finer than the cache file tracks holes")]
    InvalidBlockSize(u64),
    #[error("cache size {cache} does not match base size {base}")]
    SizeMismatch { cache: u64, base: u64 },
    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// `EndOfData` is the sparse detector's terminal signal, not a fault.
    pub fn is_end_of_data(&self) -> bool {
        matches!(self, Self::EndOfData { .. })
    }
}

pub(crate) fn map_io_err(op: &'static str) -> impl FnOnce(io::Error) -> Error {
    move |source| Error::Io { op, source }
}
