use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{lock_api::ArcRwLockWriteGuard, RawRwLock, RwLock};

use super::frame::Frame;
use super::limiter::IoLimiter;
use crate::primitives::bytes::be;
use crate::primitives::io::FileIo;
use crate::types::{GbpTreeError, PageId, Result};

/// Pages kept resident when no capacity is given.
pub const DEFAULT_CACHE_PAGES: usize = 4096;

/// Counters describing page store activity.
#[derive(Default, Debug, Clone, Copy, serde::Serialize)]
pub struct PagerStats {
    /// Pages currently resident in memory.
    pub resident_pages: u64,
    /// Pages read from the file.
    pub page_reads: u64,
    /// Pages written back by flushes.
    pub page_writes: u64,
    /// Completed flush calls.
    pub flushes: u64,
    /// Frames dropped by the clock sweep.
    pub evictions: u64,
    /// Dirty frames written back so they could be evicted.
    pub eviction_writes: u64,
}

#[derive(Default)]
struct Counters {
    page_reads: AtomicU64,
    page_writes: AtomicU64,
    flushes: AtomicU64,
    evictions: AtomicU64,
    eviction_writes: AtomicU64,
}

/// Resident frames plus the clock ring used to pick eviction victims.
#[derive(Default)]
struct FrameTable {
    map: HashMap<PageId, Arc<Frame>>,
    clock: Vec<PageId>,
    hand: usize,
}

/// Fixed-size page access over a [`FileIo`].
///
/// Pages are loaded on first use and kept in a bounded set of frames. Every
/// page is guarded by its own reader/writer latch; writers hold the latch
/// for one whole logical page modification, so a copy taken under the read
/// latch is never torn. A version counter tells readers that a page changed
/// after they copied it.
///
/// When the table is full a clock sweep evicts a frame that nobody holds and
/// that was not referenced since the hand last passed it. Dirty victims are
/// written back first. If every frame is held the table grows past its
/// capacity until frames are released.
pub struct PagedFile {
    io: Arc<dyn FileIo>,
    page_size: usize,
    capacity: usize,
    frames: RwLock<FrameTable>,
    versions: Arc<AtomicU64>,
    counters: Counters,
}

impl PagedFile {
    /// Wraps `io` using pages of `page_size` bytes and the default capacity.
    pub fn new(io: Arc<dyn FileIo>, page_size: usize) -> Self {
        Self::with_capacity(io, page_size, DEFAULT_CACHE_PAGES)
    }

    /// Wraps `io`, keeping at most `capacity` unheld pages resident.
    pub fn with_capacity(io: Arc<dyn FileIo>, page_size: usize, capacity: usize) -> Self {
        Self {
            io,
            page_size,
            capacity: capacity.max(1),
            frames: RwLock::new(FrameTable::default()),
            versions: Arc::new(AtomicU64::new(0)),
            counters: Counters::default(),
        }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Frames kept resident before the clock starts evicting.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The underlying file.
    pub fn io(&self) -> &Arc<dyn FileIo> {
        &self.io
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn frame(&self, id: PageId) -> Result<Arc<Frame>> {
        if let Some(frame) = self.frames.read().map.get(&id) {
            frame.touch();
            return Ok(Arc::clone(frame));
        }
        // Misses load under the table lock so an evicted image can never be
        // read back while its write-back is still pending.
        let mut table = self.frames.write();
        if let Some(frame) = table.map.get(&id) {
            frame.touch();
            return Ok(Arc::clone(frame));
        }
        let slot = if table.map.len() >= self.capacity {
            self.run_clock(&mut table)?
        } else {
            None
        };
        let image = self.load(id)?;
        let frame = Arc::new(Frame::new(image, self.next_version()));
        table.map.insert(id, Arc::clone(&frame));
        match slot {
            Some(idx) => table.clock[idx] = id,
            None => table.clock.push(id),
        }
        Ok(frame)
    }

    /// Sweeps the clock for a victim and returns its ring slot, or `None`
    /// when every frame is held.
    fn run_clock(&self, table: &mut FrameTable) -> Result<Option<usize>> {
        let len = table.clock.len();
        for _ in 0..len * 2 {
            let idx = table.hand % len;
            table.hand = (idx + 1) % len;
            let id = table.clock[idx];
            let Some(frame) = table.map.get(&id) else {
                continue;
            };
            // the table's own reference is the only one for unheld frames
            if Arc::strong_count(frame) > 1 || frame.take_reference() {
                continue;
            }
            let frame = Arc::clone(frame);
            self.evict_frame(table, id, &frame)?;
            return Ok(Some(idx));
        }
        tracing::debug!(
            target: "gbptree::pager",
            resident = table.map.len(),
            capacity = self.capacity,
            "pager.clock.no_victim"
        );
        Ok(None)
    }

    fn evict_frame(&self, table: &mut FrameTable, id: PageId, frame: &Frame) -> Result<()> {
        if frame.take_dirty() {
            let image = frame.buf.read();
            if let Err(err) = self.io.write_at(self.offset(id)?, &image) {
                frame.restore_dirty();
                return Err(err);
            }
            self.counters.eviction_writes.fetch_add(1, Ordering::Relaxed);
        }
        table.map.remove(&id);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn offset(&self, id: PageId) -> Result<u64> {
        id.0
            .checked_mul(self.page_size as u64)
            .ok_or(GbpTreeError::Invalid("page offset overflow"))
    }

    fn load(&self, id: PageId) -> Result<Box<[u8]>> {
        let mut image = vec![0u8; self.page_size].into_boxed_slice();
        let off = self.offset(id)?;
        let len = self.io.len()?;
        if off < len {
            let available = ((len - off) as usize).min(self.page_size);
            self.io.read_at(off, &mut image[..available])?;
            self.counters.page_reads.fetch_add(1, Ordering::Relaxed);
        }
        Ok(image)
    }

    /// Copies page `id` into `dst` and returns the version the copy reflects.
    pub fn read_into(&self, id: PageId, dst: &mut [u8]) -> Result<u64> {
        if dst.len() != self.page_size {
            return Err(GbpTreeError::Invalid("destination is not page sized"));
        }
        let frame = self.frame(id)?;
        let guard = frame.buf.read();
        dst.copy_from_slice(&guard);
        Ok(frame.version())
    }

    /// Current version of page `id`.
    pub fn version(&self, id: PageId) -> Result<u64> {
        Ok(self.frame(id)?.version())
    }

    /// Opens a read cursor with its own page-sized buffer.
    pub fn cursor(&self) -> PageCursor<'_> {
        PageCursor {
            file: self,
            id: PageId::NULL,
            buf: vec![0u8; self.page_size].into_boxed_slice(),
            version: 0,
        }
    }

    /// Latches page `id` for writing. The change becomes visible to version
    /// checks when the guard drops.
    pub fn write(&self, id: PageId) -> Result<PageWrite> {
        let frame = self.frame(id)?;
        let guard = frame.buf.write_arc();
        Ok(PageWrite {
            id,
            frame,
            versions: Arc::clone(&self.versions),
            guard: Some(guard),
        })
    }

    /// Writes every dirty page back to the file and syncs it.
    pub fn flush(&self, limiter: &dyn IoLimiter) -> Result<usize> {
        let mut dirty: Vec<(PageId, Arc<Frame>)> = self
            .frames
            .read()
            .map
            .iter()
            .filter(|(_, frame)| frame.is_dirty())
            .map(|(id, frame)| (*id, Arc::clone(frame)))
            .collect();
        dirty.sort_by_key(|(id, _)| *id);
        let mut written = 0usize;
        let mut image = vec![0u8; self.page_size];
        for (id, frame) in dirty {
            if !frame.take_dirty() {
                continue;
            }
            image.copy_from_slice(&frame.buf.read());
            if let Err(err) = self.io.write_at(self.offset(id)?, &image) {
                frame.restore_dirty();
                return Err(err);
            }
            written += 1;
            limiter.on_pages_written(1);
        }
        self.io.sync_all()?;
        self.counters
            .page_writes
            .fetch_add(written as u64, Ordering::Relaxed);
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(written)
    }

    /// Writes `image` straight to the file without syncing, then replaces
    /// page `id` with it.
    pub fn write_through(&self, id: PageId, image: &[u8]) -> Result<()> {
        if image.len() != self.page_size {
            return Err(GbpTreeError::Invalid("image is not page sized"));
        }
        // The file goes first so a failed write leaves no dirty image behind.
        self.io.write_at(self.offset(id)?, image)?;
        let mut page = self.write(id)?;
        page.copy_from_slice(image);
        page.written_back();
        Ok(())
    }

    /// Snapshot of activity counters.
    pub fn stats(&self) -> PagerStats {
        PagerStats {
            resident_pages: self.frames.read().map.len() as u64,
            page_reads: self.counters.page_reads.load(Ordering::Relaxed),
            page_writes: self.counters.page_writes.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            eviction_writes: self.counters.eviction_writes.load(Ordering::Relaxed),
        }
    }
}

/// Read cursor over page copies.
///
/// `next` copies a page under its read latch; `should_retry` reports whether
/// the page has been written since that copy.
pub struct PageCursor<'a> {
    file: &'a PagedFile,
    id: PageId,
    buf: Box<[u8]>,
    version: u64,
}

impl PageCursor<'_> {
    /// Moves the cursor to page `id`, copying its current image.
    pub fn next(&mut self, id: PageId) -> Result<()> {
        self.version = self.file.read_into(id, &mut self.buf)?;
        self.id = id;
        Ok(())
    }

    /// Page the cursor is positioned on.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Version the copy reflects.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The copied page bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Reads a `u16` at `off` from the copy.
    pub fn get_u16(&self, off: usize) -> u16 {
        be::get_u16(&self.buf, off)
    }

    /// Reads a `u32` at `off` from the copy.
    pub fn get_u32(&self, off: usize) -> u32 {
        be::get_u32(&self.buf, off)
    }

    /// Returns true when the page changed after the copy was taken.
    pub fn should_retry(&self) -> Result<bool> {
        Ok(self.file.version(self.id)? != self.version)
    }
}

/// Exclusive write latch on one page.
pub struct PageWrite {
    id: PageId,
    frame: Arc<Frame>,
    versions: Arc<AtomicU64>,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>>,
}

impl PageWrite {
    /// The latched page.
    pub fn id(&self) -> PageId {
        self.id
    }

    fn publish(&self) {
        let version = self.versions.fetch_add(1, Ordering::AcqRel) + 1;
        self.frame.mark_written(version);
    }

    fn written_back(&mut self) {
        self.publish();
        self.frame.take_dirty();
        self.guard = None;
    }
}

impl Deref for PageWrite {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.guard {
            Some(guard) => &guard[..],
            None => &[],
        }
    }
}

impl DerefMut for PageWrite {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.guard {
            Some(guard) => &mut guard[..],
            None => &mut [],
        }
    }
}

impl Drop for PageWrite {
    fn drop(&mut self) {
        if self.guard.is_some() {
            self.publish();
        }
    }
}
