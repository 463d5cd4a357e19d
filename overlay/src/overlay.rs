//! Copy-on-write device over a read-only Base.
//!
//! Reads of present blocks come from the cache. Runs of absent blocks are
//! fetched from Base in one call, written into the cache and only then
//! marked, so a marked block is always completely filled. Writes land in the
//! cache and mark every block they touch; Base is never written.
//!
//! Copying a fetched block into the cache and writing an absent block both
//! happen under a per-block commit lock, and a fetched block is dropped when
//! the block got marked in the meantime. A fill therefore never overwrites a
//! write, with or without fetch de-duplication.

use std::{
    io::Write,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use serde::{Deserialize, Serialize};

use crate::{
    block::{validate_block_size, BlockSpans, Span},
    cache::MmapCache,
    device::{check_range, Device, ReadOnlyDevice},
    diff::{self, DiffMetadata},
    error::{Error, Result},
    fetch::{FetchMap, Leader},
    tracker::Tracker,
};

const COMMIT_STRIPES: u64 = 64;

/// What happens to the untouched part of an absent block that a write only
/// partially covers.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PartialWrite {
    /// fetch the block from Base first, the remainder keeps Base content
    #[default]
    Prefill,
    /// leave the remainder as whatever the cache holds (zero for a fresh cache)
    Leave,
}

#[derive(Debug, Clone, Copy)]
pub struct OverlayOptions {
    /// Let one caller fetch an absent block while the others wait for it.
    /// Always on for implicit trackers.
    pub dedupe_fetches: bool,
    pub partial_write: PartialWrite,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            dedupe_fetches: true,
            partial_write: PartialWrite::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// blocks served from the cache
    pub hits: u64,
    /// blocks fetched from Base into the cache
    pub misses: u64,
    pub fetched_bytes: u64,
    pub written_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetched_bytes: AtomicU64,
    written_bytes: AtomicU64,
}

#[derive(Debug)]
pub struct Overlay<B, T> {
    base: B,
    cache: MmapCache,
    tracker: T,
    block_size: u64,
    fetches: Option<FetchMap>,
    commits: Box<[Mutex<()>]>,
    partial_write: PartialWrite,
    counters: Counters,
}

impl<B, T> Overlay<B, T>
where
    B: ReadOnlyDevice,
    T: Tracker,
{
    pub fn new(base: B, cache: MmapCache, tracker: T) -> Result<Self> {
        Self::with_options(base, cache, tracker, OverlayOptions::default())
    }
    pub fn with_options(
        base: B,
        cache: MmapCache,
        tracker: T,
        options: OverlayOptions,
    ) -> Result<Self> {
        let block_size = tracker.block_size();
        validate_block_size(block_size)?;
        if cache.size() != base.size() {
            return Err(Error::SizeMismatch {
                cache: cache.size(),
                base: base.size(),
            });
        }
        // presence of an implicit tracker shows up while a fill is still copying
        let dedupe = options.dedupe_fetches || tracker.implicit();
        log::debug!(
            "overlay over {} bytes, block size {}, cache {}, dedupe {}, partial write {:?}",
            base.size(),
            block_size,
            cache.path().display(),
            dedupe,
            options.partial_write
        );
        Ok(Self {
            base,
            cache,
            tracker,
            block_size,
            fetches: dedupe.then(FetchMap::new),
            commits: (0..COMMIT_STRIPES).map(|_| Mutex::new(())).collect(),
            partial_write: options.partial_write,
            counters: Counters::default(),
        })
    }
    pub fn block_size(&self) -> u64 {
        self.block_size
    }
    pub fn base(&self) -> &B {
        &self.base
    }
    pub fn cache(&self) -> &MmapCache {
        &self.cache
    }
    pub fn tracker(&self) -> &T {
        &self.tracker
    }
    pub fn is_marked(&self, offset: u64) -> bool {
        self.tracker.is_marked(offset)
    }
    pub fn stats(&self) -> Stats {
        Stats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fetched_bytes: self.counters.fetched_bytes.load(Ordering::Relaxed),
            written_bytes: self.counters.written_bytes.load(Ordering::Relaxed),
        }
    }
    /// Write every present block to `out`; see [`diff::export`].
    pub fn export_diff<W: Write + ?Sized>(&self, out: &mut W) -> Result<DiffMetadata> {
        diff::export(&self.cache, &self.tracker, out)
    }
    fn spans(&self, offset: u64, len: usize) -> BlockSpans {
        BlockSpans::new(offset, len, self.block_size, self.base.size())
    }
    fn present(&self, span: &Span) -> bool {
        if !self.tracker.is_marked(span.block_start) {
            return false;
        }
        if self.tracker.implicit() {
            if let Some(fetches) = &self.fetches {
                fetches.wait(span.index);
            }
        }
        true
    }
    fn commit_lock(&self, idx: u64) -> MutexGuard<'_, ()> {
        self.commits[(idx % COMMIT_STRIPES) as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
    /// Take the fill/write slot of an absent block. `None` means another
    /// caller held it and has finished; look at the tracker again.
    fn claim(&self, span: &Span) -> Option<Option<Leader<'_>>> {
        match &self.fetches {
            None => Some(None),
            Some(fetches) => match fetches.try_lead(span.index) {
                Ok(leader) => Some(Some(leader)),
                Err(waiter) => {
                    waiter.wait();
                    None
                }
            },
        }
    }
    /// Claim the absent blocks at the head of `spans` that can be fetched
    /// together. Stops at the first present block or at one somebody else is
    /// filling; waits only when that is the head block, and then returns
    /// nothing.
    fn claim_run(&self, spans: &[Span]) -> Vec<Option<Leader<'_>>> {
        let mut run = Vec::new();
        for span in spans {
            let claim = match (&self.fetches, run.is_empty()) {
                (None, _) => None,
                (Some(_), true) => match self.claim(span) {
                    Some(claim) => claim,
                    None => break,
                },
                (Some(fetches), false) => match fetches.try_lead(span.index) {
                    Ok(leader) => Some(leader),
                    Err(_) => break,
                },
            };
            if self.tracker.is_marked(span.block_start) {
                break;
            }
            run.push(claim);
        }
        run
    }
    fn fetch_base(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        let read = self.base.read_at(&mut buf, offset).map_err(|source| {
            log::warn!("base fetch of {}+{} failed: {}", offset, len, source);
            Error::Base {
                offset,
                len: len as u64,
                source: Box::new(source),
            }
        })?;
        if read != len {
            return Err(Error::ShortRead {
                offset,
                expected: len,
                got: read,
            });
        }
        self.counters
            .fetched_bytes
            .fetch_add(len as u64, Ordering::Relaxed);
        Ok(buf)
    }
    /// Copy a fetched block into the cache and mark it, unless a write marked
    /// it first. Returns whether the block was copied.
    fn commit(&self, span: &Span, block: &[u8]) -> Result<bool> {
        let _guard = self.commit_lock(span.index);
        if self.tracker.is_marked(span.block_start) {
            return Ok(false);
        }
        self.cache.write_at(block, span.block_start)?;
        self.tracker.mark(span.block_start);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }
    /// Fetch consecutive absent blocks with one Base read and serve their
    /// requested bytes into `buf`.
    fn fill_run(&self, spans: &[Span], buf: &mut [u8]) -> Result<()> {
        let (Some(first), Some(last)) = (spans.first(), spans.last()) else {
            return Ok(());
        };
        let len = spans.iter().map(|x| x.block_len).sum();
        let fetched = self.fetch_base(first.block_start, len)?;
        for span in spans {
            let at = (span.block_start - first.block_start) as usize;
            let block = &fetched[at..at + span.block_len];
            let out = &mut buf[span.buf_range()];
            if self.commit(span, block)? {
                out.copy_from_slice(&block[span.inner_range()]);
            } else {
                self.cache.read_at(out, span.offset())?;
            }
        }
        log::trace!(
            "filled blocks {}..={} ({} bytes)",
            first.index,
            last.index,
            len
        );
        Ok(())
    }
    fn write_span(&self, span: &Span, data: &[u8]) -> Result<()> {
        loop {
            if self.present(span) {
                self.cache.write_at(data, span.offset())?;
                return Ok(());
            }
            let Some(_claim) = self.claim(span) else {
                continue;
            };
            let prefill = match self.partial_write {
                PartialWrite::Prefill => {
                    !span.is_full() && !self.tracker.is_marked(span.block_start)
                }
                PartialWrite::Leave => false,
            };
            let block = if prefill {
                Some(self.fetch_base(span.block_start, span.block_len)?)
            } else {
                None
            };
            let _guard = self.commit_lock(span.index);
            if let Some(block) = block {
                // a block marked meanwhile already holds its own content
                if !self.tracker.is_marked(span.block_start) {
                    self.cache.write_at(&block, span.block_start)?;
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.cache.write_at(data, span.offset())?;
            self.tracker.mark(span.block_start);
            return Ok(());
        }
    }
}

impl<B, T> ReadOnlyDevice for Overlay<B, T>
where
    B: ReadOnlyDevice,
    T: Tracker,
{
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        check_range(offset, buf.len(), self.size())?;
        let spans: Vec<Span> = self.spans(offset, buf.len()).collect();
        let mut next = 0;
        while let Some(span) = spans.get(next) {
            if self.present(span) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.cache.read_at(&mut buf[span.buf_range()], span.offset())?;
                next += 1;
                continue;
            }
            let run = self.claim_run(&spans[next..]);
            let claimed = &spans[next..next + run.len()];
            self.fill_run(claimed, buf)?;
            next += claimed.len();
        }
        Ok(buf.len())
    }
    fn size(&self) -> u64 {
        self.base.size()
    }
}

impl<B, T> Device for Overlay<B, T>
where
    B: ReadOnlyDevice,
    T: Tracker,
{
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        check_range(offset, buf.len(), self.size())?;
        for span in self.spans(offset, buf.len()) {
            self.write_span(&span, &buf[span.buf_range()])?;
        }
        self.counters
            .written_bytes
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }
    fn sync(&self) -> Result<()> {
        self.cache.sync()
    }
    fn close(&self) -> Result<()> {
        let stats = self.stats();
        log::debug!(
            "closing overlay: {} hits, {} misses, {} marked blocks",
            stats.hits,
            stats.misses,
            self.tracker.marked_count()
        );
        self.cache.close()
    }
}
