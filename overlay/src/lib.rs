//! Block-addressable copy-on-write device.
//!
//! A growable local cache (a memory-mapped sparse file) sits on top of a
//! read-only Base, typically a snapshot image in an object store. Blocks are
//! fetched from Base the first time they are read, writes only ever reach the
//! cache, and a tracker remembers which blocks the cache already holds.

pub mod block;
pub mod cache;
pub mod config;
pub mod device;
pub mod diff;
pub mod error;
pub mod fetch;
pub mod local;
pub mod logger;
pub mod nonblocking;
pub mod overlay;
pub mod sparse;
pub mod tracker;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::block::BLOCK_SIZE;
    pub use crate::cache::MmapCache;
    pub use crate::config::Config;
    pub use crate::device::{Device, FileBase, ReadOnlyDevice};
    pub use crate::diff::DiffMetadata;
    pub use crate::local::LocalDevice;
    pub use crate::nonblocking::AsyncDevice;
    pub use crate::overlay::{Overlay, OverlayOptions, PartialWrite, Stats};
    pub use crate::sparse::SparseFile;
    pub use crate::tracker::{
        AnyTracker, BitsetTracker, HashSetTracker, SparseTracker, Tracker, TrackerKind,
    };
}
