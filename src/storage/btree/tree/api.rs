use std::cmp::Ordering;
use std::marker::PhantomData;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::pager::meta::{new_meta, read_meta, write_meta};
use crate::primitives::pager::{IoLimiter, Meta, NodeFormat, PagedFile, PagerStats, Unlimited};
use crate::types::{GbpTreeError, PageId, Result};

use super::super::codecs::{encode_key, layout_id, KeyCodec, ValCodec};
use super::super::consistency::{self, CheckSummary, ConsistencyVisitor};
use super::super::cursor::SeekCursor;
use super::super::freelist::{FreeList, FreelistCursors};
use super::super::gspp::{Generations, Pointer, MIN_GENERATION};
use super::super::node::{codec_for, format_for, NodeCodec};
use super::super::partition;
use super::super::state::{max_header_len, other_page, read_current, TreeState, STATE_PAGES};
use super::super::stats::TreeStats;
use super::maintenance::CleanupReport;
use super::types::{GbpTreeOptions, Mutable, TreeCore, DEFAULT_PAGE_SIZE};
use super::writer::Writer;

/// Root leaf of a freshly created tree.
const INITIAL_ROOT: PageId = PageId(3);
/// First page of the freelist chain.
const INITIAL_FREELIST: PageId = PageId(4);

/// A generation-stamped copy-on-write B+tree stored in one file.
///
/// Readers scan through [`GbpTree::seek`] without blocking the writer; one
/// [`Writer`] at a time mutates the tree; [`GbpTree::checkpoint`] makes the
/// current content durable. After a crash the tree reopens at the last
/// checkpoint.
pub struct GbpTree<K: KeyCodec, V: ValCodec> {
    pub(crate) core: Arc<TreeCore>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: KeyCodec, V: ValCodec> GbpTree<K, V> {
    /// Opens the tree at `path`, creating it when missing and allowed.
    pub fn open(path: impl AsRef<Path>, options: GbpTreeOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let layout = options.layout_id.unwrap_or_else(layout_id::<K, V>);
        let format = format_for(K::ENCODED_LEN, V::ENCODED_LEN);
        let populated = std::fs::metadata(&path)
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if !populated {
            if options.read_only || !options.create_if_missing {
                return Err(GbpTreeError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no tree file at {}", path.display()),
                )));
            }
            return Self::create(path, &options, layout, format);
        }

        let io: Arc<dyn FileIo> = if options.read_only {
            Arc::new(StdFileIo::open_read_only(&path)?)
        } else {
            Arc::new(StdFileIo::open_rw(&path, false)?)
        };
        Self::open_existing(path, io, &options, layout, format)
    }

    /// Opens an existing tree over `io`, which stands for the file at `path`.
    pub(crate) fn open_with_io(
        path: impl AsRef<Path>,
        io: Arc<dyn FileIo>,
        options: GbpTreeOptions,
    ) -> Result<Self> {
        options.validate()?;
        let layout = options.layout_id.unwrap_or_else(layout_id::<K, V>);
        let format = format_for(K::ENCODED_LEN, V::ENCODED_LEN);
        Self::open_existing(path.as_ref().to_path_buf(), io, &options, layout, format)
    }

    fn open_existing(
        path: PathBuf,
        io: Arc<dyn FileIo>,
        options: &GbpTreeOptions,
        layout: u64,
        format: NodeFormat,
    ) -> Result<Self> {
        let meta = read_meta(io.as_ref())?;
        meta.ensure_compatible(options.page_size, layout, format)?;
        let page_size = meta.page_size as usize;
        let codec = Self::codec(&meta)?;
        let (state, state_page) = read_current(io.as_ref(), page_size, meta.salt)?;
        let gens = Generations::new(state.gens.stable, state.gens.unstable + 1)?;
        let free = FreeList::restore(state.last_id, state.freelist, page_size)?;
        let was_dirty = !state.clean;
        let mutable = Mutable {
            free,
            header: state.header,
            state_page,
            state_version: state.version,
            changed: false,
        };
        let core = Arc::new(TreeCore::new(
            path,
            PagedFile::with_capacity(io, page_size, options.cache_pages),
            codec,
            meta,
            mutable,
            gens,
            state.root,
            options.read_only,
            options.split_ratio,
            was_dirty,
        ));
        if !options.read_only {
            let mut m = core.mutable.lock();
            core.write_state(&mut m, gens, false, None)?;
        }
        info!(
            target: "gbptree::open",
            path = %core.path.display(),
            stable = gens.stable,
            unstable = gens.unstable,
            root = state.root.id.0,
            was_dirty,
            read_only = options.read_only,
            "gbptree.open.completed"
        );
        if was_dirty && !options.read_only {
            if options.cleanup_in_background {
                Self::spawn_cleanup(&core)?;
            } else {
                core.clean_crashed_pointers()?;
            }
        }
        Ok(Self {
            core,
            _marker: PhantomData,
        })
    }

    fn create(
        path: PathBuf,
        options: &GbpTreeOptions,
        layout: u64,
        format: NodeFormat,
    ) -> Result<Self> {
        let page_size = options.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        let meta = new_meta(page_size, layout, format)?;
        let codec = Self::codec(&meta)?;
        if options.initial_header.len() > max_header_len(page_size as usize) {
            return Err(GbpTreeError::Invalid("header does not fit in a state page"));
        }
        let io = Arc::new(StdFileIo::open_rw(&path, true)?);
        write_meta(io.as_ref(), &meta)?;
        let pager = PagedFile::with_capacity(io, page_size as usize, options.cache_pages);
        let initial = Generations::new(MIN_GENERATION, MIN_GENERATION + 1)?;
        {
            let mut root = pager.write(INITIAL_ROOT)?;
            codec.initialize_leaf(&mut root, initial);
        }
        let free = FreeList::initialize(&pager, INITIAL_FREELIST)?;
        pager.flush(&Unlimited)?;

        let gens = initial.after_checkpoint();
        let mutable = Mutable {
            free,
            header: options.initial_header.clone(),
            // the first state lands on the other page, page 1
            state_page: STATE_PAGES[1],
            state_version: 0,
            changed: false,
        };
        let root = Pointer {
            id: INITIAL_ROOT,
            generation: initial.unstable,
        };
        let core = Arc::new(TreeCore::new(
            path,
            pager,
            codec,
            meta,
            mutable,
            gens,
            root,
            false,
            options.split_ratio,
            false,
        ));
        {
            let mut m = core.mutable.lock();
            core.write_state(&mut m, gens, false, None)?;
        }
        info!(
            target: "gbptree::open",
            path = %core.path.display(),
            page_size,
            layout = layout,
            format = ?format,
            "gbptree.create.completed"
        );
        Ok(Self {
            core,
            _marker: PhantomData,
        })
    }

    fn codec(meta: &Meta) -> Result<Box<dyn NodeCodec>> {
        codec_for(
            meta.node_format,
            meta.page_size as usize,
            K::ENCODED_LEN,
            V::ENCODED_LEN,
            K::compare_encoded,
        )
    }

    fn spawn_cleanup(core: &Arc<TreeCore>) -> Result<()> {
        core.sessions.begin_cleanup();
        let worker = Arc::clone(core);
        let spawned = std::thread::Builder::new()
            .name("gbptree-cleanup".into())
            .spawn(move || {
                let outcome = worker.clean_crashed_pointers().map(|_| ()).map_err(|err| {
                    warn!(target: "gbptree::cleanup", error = %err, "gbptree.cleanup.failed");
                    err.to_string()
                });
                worker.sessions.finish_cleanup(outcome);
            });
        if let Err(err) = spawned {
            core.sessions.finish_cleanup(Err(err.to_string()));
            return Err(GbpTreeError::Io(err));
        }
        Ok(())
    }

    /// Opens the writer session. Fails with
    /// [`GbpTreeError::WriterAlreadyOpen`] while another writer exists.
    pub fn writer(&self) -> Result<Writer<'_, K, V>> {
        self.writer_with_split_ratio(self.core.split_ratio)
    }

    /// Opens the writer session with its own split ratio, overriding the one
    /// the tree was opened with. Handy for bulk loads of ascending keys.
    pub fn writer_with_split_ratio(&self, split_ratio: f64) -> Result<Writer<'_, K, V>> {
        if !(0.0..=1.0).contains(&split_ratio) {
            return Err(GbpTreeError::Invalid("split ratio must be within 0..=1"));
        }
        self.core.ensure_writable()?;
        let session = self.core.sessions.acquire_writer()?;
        Ok(Writer::new(&self.core, session, split_ratio))
    }

    /// Entries in `[from, to)`; descending when `from > to`.
    pub fn seek(&self, from: &K, to: &K) -> Result<SeekCursor<'_, K, V>> {
        SeekCursor::new(&self.core, from, to)
    }

    /// Entries between explicit bounds. The scan is descending only when
    /// both bounds are present and `from` orders after `to`.
    pub fn seek_range(&self, from: Bound<&K>, to: Bound<&K>) -> Result<SeekCursor<'_, K, V>> {
        SeekCursor::with_bounds(&self.core, from, to)
    }

    /// Splits `[from, to)` into at most `desired` adjacent ranges holding
    /// roughly the same number of entries and returns one ascending cursor
    /// per range, in key order. Fewer cursors come back when the tree is too
    /// small to split that finely.
    pub fn partitioned_seek(
        &self,
        from: &K,
        to: &K,
        desired: usize,
    ) -> Result<Vec<SeekCursor<'_, K, V>>> {
        self.core.ensure_open()?;
        if desired == 0 {
            return Err(GbpTreeError::Invalid("at least one partition is required"));
        }
        let lo = encode_key(from);
        let hi = encode_key(to);
        let splitters = match K::compare_encoded(&lo, &hi) {
            Ordering::Greater => {
                return Err(GbpTreeError::Invalid("partitioned seek only runs forward"))
            }
            Ordering::Equal => Vec::new(),
            Ordering::Less => partition::splitter_keys(&self.core, Some(&lo), Some(&hi), desired)?,
        };
        let mut bounds = Vec::with_capacity(splitters.len() + 2);
        bounds.push(lo);
        bounds.extend(splitters);
        bounds.push(hi);
        bounds
            .windows(2)
            .map(|pair| SeekCursor::between(&self.core, pair[0].clone(), pair[1].clone()))
            .collect()
    }

    /// Rough number of entries, extrapolated from sampled root-to-leaf
    /// paths instead of a full scan.
    pub fn estimate_entries(&self) -> Result<u64> {
        self.core.ensure_open()?;
        partition::estimate_entries(&self.core)
    }

    /// Largest combined encoded key and value length the node layout accepts.
    pub fn key_value_size_cap(&self) -> usize {
        self.core.codec.key_value_size_cap()
    }

    /// Flushes all changes and advances the generations. `header`, when
    /// given, replaces the stored header blob.
    pub fn checkpoint(&self, limiter: &dyn IoLimiter, header: Option<&[u8]>) -> Result<()> {
        self.core.checkpoint(limiter, header)
    }

    /// Closes the tree. Further calls do nothing.
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }

    /// Walks the whole tree and reports every finding to `visitor`.
    pub fn consistency_check(&self, visitor: &mut dyn ConsistencyVisitor) -> Result<CheckSummary> {
        consistency::check(&self.core, visitor, false)
    }

    /// Like [`GbpTree::consistency_check`]; with `report_dirty` set, a tree
    /// that was not closed cleanly before this session is reported as
    /// [`Finding::DirtyOnStartup`](crate::Finding::DirtyOnStartup).
    pub fn consistency_check_with(
        &self,
        visitor: &mut dyn ConsistencyVisitor,
        report_dirty: bool,
    ) -> Result<CheckSummary> {
        consistency::check(&self.core, visitor, report_dirty)
    }

    /// Live structural counters.
    pub fn stats(&self) -> &TreeStats {
        &self.core.stats
    }

    /// Page store counters.
    pub fn pager_stats(&self) -> PagerStats {
        self.core.pager.stats()
    }

    /// Whether the last session ended without a clean close.
    pub fn was_dirty_on_startup(&self) -> bool {
        self.core.was_dirty
    }

    /// Result of the recovery cleanup, once it finished.
    pub fn cleanup_report(&self) -> Option<CleanupReport> {
        *self.core.cleanup.lock()
    }

    /// Blocks until a background cleanup has finished.
    pub fn wait_for_cleanup(&self) {
        self.core.sessions.wait_for_cleanup();
    }

    /// Current stable/unstable generation pair.
    pub fn generations(&self) -> Generations {
        self.core.generations()
    }

    /// Header blob as of the last checkpoint or creation.
    pub fn header(&self) -> Vec<u8> {
        self.core.mutable.lock().header.clone()
    }

    /// Format metadata of the open file.
    pub fn meta(&self) -> &Meta {
        &self.core.meta
    }

    /// Leaves the file as a crash would: pages are flushed but no state is
    /// recorded.
    #[doc(hidden)]
    pub fn simulate_crash(&self) -> Result<()> {
        self.core.simulate_crash()
    }
}

impl<K: KeyCodec, V: ValCodec> Drop for GbpTree<K, V> {
    fn drop(&mut self) {
        if let Err(err) = self.core.close() {
            warn!(
                target: "gbptree::open",
                path = %self.core.path.display(),
                error = %err,
                "gbptree.close.failed"
            );
        }
    }
}

/// Reads the header blob of a tree file without opening the tree.
pub fn read_header(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let io = StdFileIo::open_read_only(path)?;
    let meta = read_meta(&io)?;
    let (state, _) = read_current(&io, meta.page_size as usize, meta.salt)?;
    Ok(state.header)
}

/// Replaces the header blob of a tree file that is not open. The new state
/// copy goes to the older state page, so a crash part way through leaves the
/// previous header in place.
pub fn overwrite_header(path: impl AsRef<Path>, header: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let io = StdFileIo::open_rw(path, false)?;
    let meta = read_meta(&io)?;
    let page_size = meta.page_size as usize;
    if header.len() > max_header_len(page_size) {
        return Err(GbpTreeError::Invalid("header does not fit in a state page"));
    }
    let (current, state_page) = read_current(&io, page_size, meta.salt)?;
    let state = TreeState {
        version: current.version + 1,
        header: header.to_vec(),
        ..current
    };
    let target = other_page(state_page);
    let image = state.encode(target, page_size, meta.salt)?;
    io.write_at(target.0 * page_size as u64, &image)?;
    io.sync_all()?;
    info!(
        target: "gbptree::open",
        path = %path.display(),
        header_len = header.len(),
        "gbptree.header.overwritten"
    );
    Ok(())
}

/// Summary of a tree file as found on disk.
#[derive(Clone, Debug, serde::Serialize)]
pub struct FileInfo {
    /// Format metadata from page 0.
    pub meta: Meta,
    /// Page holding the winning state copy.
    pub state_page: PageId,
    /// Version of the winning state copy.
    pub state_version: u64,
    /// Generations recorded by the last state write.
    pub generations: Generations,
    /// Root page.
    pub root: PageId,
    /// Generation the root was written in.
    pub root_generation: u32,
    /// Highest allocated page id.
    pub last_id: PageId,
    /// Freelist positions.
    pub freelist: FreelistCursors,
    /// Whether the last session closed cleanly.
    pub clean: bool,
    /// Length of the header blob.
    pub header_len: usize,
}

/// Describes the tree file at `path` without opening the tree.
pub fn describe_file(path: impl AsRef<Path>) -> Result<FileInfo> {
    let io = StdFileIo::open_read_only(path)?;
    let meta = read_meta(&io)?;
    let (state, state_page) = read_current(&io, meta.page_size as usize, meta.salt)?;
    Ok(FileInfo {
        meta,
        state_page,
        state_version: state.version,
        generations: state.gens,
        root: state.root.id,
        root_generation: state.root.generation,
        last_id: state.last_id,
        freelist: state.freelist,
        clean: state.clean,
        header_len: state.header.len(),
    })
}
