use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    block::BLOCK_SIZE,
    cache::MmapCache,
    device::ReadOnlyDevice,
    error::{map_io_err, Error, Result},
    local::LocalDevice,
    logger,
    overlay::{Overlay, OverlayOptions, PartialWrite},
    tracker::{self, AnyTracker, Tracker, TrackerKind},
};

fn default_block_size() -> u64 {
    BLOCK_SIZE
}
fn default_cache() -> PathBuf {
    PathBuf::from("cache.img")
}
fn default_dedupe() -> bool {
    true
}
fn default_log() -> usize {
    2
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    #[serde(default)]
    pub tracker: TrackerKind,
    /// cache file, reopened when it already has the device's size
    #[serde(default = "default_cache")]
    pub cache: PathBuf,
    #[serde(default = "default_dedupe")]
    pub dedupe_fetches: bool,
    #[serde(default)]
    pub partial_write: PartialWrite,
    #[serde(default = "default_log")]
    pub log_level: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            tracker: TrackerKind::default(),
            cache: default_cache(),
            dedupe_fetches: default_dedupe(),
            partial_write: PartialWrite::default(),
            log_level: default_log(),
        }
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(map_io_err("read config"))?;
        let config: Self = raw.parse()?;
        log::info!("load config from {:?}", path);
        Ok(config)
    }
    pub fn options(&self) -> OverlayOptions {
        OverlayOptions {
            dedupe_fetches: self.dedupe_fetches,
            partial_write: self.partial_write,
        }
    }
    pub fn init_logger(&self) {
        logger::init(self.log_level);
    }
    fn tracker(&self, cache: &MmapCache) -> Result<AnyTracker> {
        let tracker = AnyTracker::new(self.tracker, cache.size(), self.block_size, || {
            cache.sparse()
        })?;
        // explicit trackers start empty, recover what the last run left
        if cache.is_warm() && !tracker.implicit() {
            tracker::restore(&tracker, &cache.sparse()?)?;
        }
        Ok(tracker)
    }
    /// Build the overlay over `base`, warm when the cache file survived.
    pub fn open<B: ReadOnlyDevice>(&self, base: B) -> Result<Overlay<B, AnyTracker>> {
        let cache = MmapCache::open_or_create(&self.cache, base.size())?;
        let tracker = self.tracker(&cache)?;
        log::info!(
            "opening {} overlay over {} bytes ({} blocks already present)",
            if cache.is_warm() { "warm" } else { "cold" },
            base.size(),
            tracker.marked_count()
        );
        Overlay::with_options(base, cache, tracker, self.options())
    }
    /// Build a cache-only device of `size` bytes.
    pub fn open_local(&self, size: u64) -> Result<LocalDevice<AnyTracker>> {
        let cache = MmapCache::open_or_create(&self.cache, size)?;
        let tracker = self.tracker(&cache)?;
        LocalDevice::new(cache, tracker)
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::device::Device;

    #[test]
    fn empty_is_default() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.tracker, TrackerKind::Bitset);
    }
    #[test]
    fn parse() {
        let config: Config = r#"
            block_size = 8192
            tracker = "hashSet"
            cache = "/var/cache/snapshot.img"
            dedupe_fetches = false
            partial_write = "leave"
            log_level = 0
        "#
        .parse()
        .unwrap();
        assert_eq!(config.block_size, 8192);
        assert_eq!(config.tracker, TrackerKind::HashSet);
        assert_eq!(config.partial_write, PartialWrite::Leave);
        assert!(!config.options().dedupe_fetches);
    }
    #[test]
    fn unknown_field() {
        assert!(matches!(
            "block_sise = 1".parse::<Config>(),
            Err(Error::Config(_))
        ));
    }
    #[test]
    fn round_trip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config {
            tracker: TrackerKind::Sparse,
            ..Default::default()
        };
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }
    #[test]
    fn open_every_tracker() {
        for kind in [TrackerKind::Bitset, TrackerKind::HashSet, TrackerKind::Sparse] {
            let dir = tempfile::tempdir().unwrap();
            let config = Config {
                tracker: kind,
                cache: dir.path().join("cache.img"),
                ..Default::default()
            };
            let overlay = config.open(Bytes::from(vec![7_u8; 3 * 4096])).unwrap();
            assert_eq!(overlay.tracker().kind(), kind);
            let mut buf = [0_u8; 4];
            overlay.read_at(&mut buf, 4096).unwrap();
            assert_eq!(buf, [7_u8; 4]);
            assert!(overlay.is_marked(4096));
            overlay.close().unwrap();
        }
    }
    #[test]
    fn local_device() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            cache: dir.path().join("local.img"),
            ..Default::default()
        };
        let local = config.open_local(2 * 4096).unwrap();
        assert!(local.read_at(&mut [0_u8; 1], 0).is_err());
        local.write_at(b"ok", 0).unwrap();
        local.close().unwrap();
    }
}
