use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;

use crate::primitives::concurrency::{SeqPair, SessionLock};
use crate::primitives::pager::{Meta, PagedFile, DEFAULT_CACHE_PAGES};
use crate::types::{GbpTreeError, PageId, Result};

use super::super::freelist::FreeList;
use super::super::gspp::{Generations, Pointer};
use super::super::node::NodeCodec;
use super::super::stats::TreeStats;
use super::maintenance::CleanupReport;

/// Page size used when creating a tree without an explicit size.
pub const DEFAULT_PAGE_SIZE: u32 = 8192;

/// Smallest page cache a tree accepts; one descent plus a split must fit.
pub const MIN_CACHE_PAGES: usize = 16;

/// Configuration knobs for opening or creating a tree.
#[derive(Clone, Debug)]
pub struct GbpTreeOptions {
    /// Page size for new files. When set, opening an existing file with a
    /// different page size fails.
    pub page_size: Option<u32>,
    /// Where leaves and internal nodes split: 0 keeps the left half minimal,
    /// 1 keeps the right half minimal.
    pub split_ratio: f64,
    /// Open without writing anything to the file.
    pub read_only: bool,
    /// Run recovery cleanup on a background thread instead of inside `open`.
    pub cleanup_in_background: bool,
    /// Layout id to persist and verify instead of the one derived from the codecs.
    pub layout_id: Option<u64>,
    /// Create the file when it does not exist.
    pub create_if_missing: bool,
    /// Header blob written when the tree is created.
    pub initial_header: Vec<u8>,
    /// Pages kept resident before the page cache starts evicting.
    pub cache_pages: usize,
}

impl Default for GbpTreeOptions {
    fn default() -> Self {
        Self {
            page_size: None,
            split_ratio: 0.5,
            read_only: false,
            cleanup_in_background: false,
            layout_id: None,
            create_if_missing: true,
            initial_header: Vec::new(),
            cache_pages: DEFAULT_CACHE_PAGES,
        }
    }
}

impl GbpTreeOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.split_ratio) {
            return Err(GbpTreeError::Invalid("split ratio must be within 0..=1"));
        }
        if self.cache_pages < MIN_CACHE_PAGES {
            return Err(GbpTreeError::Invalid("cache must hold at least 16 pages"));
        }
        Ok(())
    }
}

/// State only the writer, checkpoints, and close touch.
pub(crate) struct Mutable {
    pub(crate) free: FreeList,
    pub(crate) header: Vec<u8>,
    /// State page holding the newest persisted copy.
    pub(crate) state_page: PageId,
    pub(crate) state_version: u64,
    /// Set by any tree change, cleared by a checkpoint.
    pub(crate) changed: bool,
}

/// Everything shared between the facade, writers, cursors, and the cleanup job.
pub(crate) struct TreeCore {
    pub(crate) path: PathBuf,
    pub(crate) pager: PagedFile,
    pub(crate) codec: Box<dyn NodeCodec>,
    pub(crate) meta: Meta,
    pub(crate) sessions: SessionLock,
    pub(crate) stats: TreeStats,
    pub(crate) mutable: Mutex<Mutable>,
    pub(crate) read_only: bool,
    pub(crate) split_ratio: f64,
    pub(crate) was_dirty: bool,
    pub(crate) cleanup: Mutex<Option<CleanupReport>>,
    gens: AtomicU64,
    root: SeqPair,
}

impl TreeCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        path: PathBuf,
        pager: PagedFile,
        codec: Box<dyn NodeCodec>,
        meta: Meta,
        mutable: Mutable,
        gens: Generations,
        root: Pointer,
        read_only: bool,
        split_ratio: f64,
        was_dirty: bool,
    ) -> Self {
        Self {
            path,
            pager,
            codec,
            meta,
            sessions: SessionLock::new(),
            stats: TreeStats::default(),
            mutable: Mutex::new(mutable),
            read_only,
            split_ratio,
            was_dirty,
            cleanup: Mutex::new(None),
            gens: AtomicU64::new(gens.pack()),
            root: SeqPair::new(root.id.0, root.generation as u64),
        }
    }

    pub(crate) fn generations(&self) -> Generations {
        Generations::unpack(self.gens.load(AtomicOrdering::SeqCst))
    }

    pub(crate) fn set_generations(&self, gens: Generations) {
        self.gens.store(gens.pack(), AtomicOrdering::SeqCst);
    }

    pub(crate) fn root(&self) -> Pointer {
        let (id, generation) = self.root.load();
        Pointer {
            id: PageId(id),
            generation: generation as u32,
        }
    }

    pub(crate) fn set_root(&self, root: Pointer) {
        self.root.store(root.id.0, root.generation as u64);
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.sessions.is_closed() {
            return Err(GbpTreeError::Closed);
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(GbpTreeError::ReadOnly);
        }
        Ok(())
    }

    /// Copies page `id`.
    pub(crate) fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.pager.page_size()];
        self.pager.read_into(id, &mut buf)?;
        Ok(buf)
    }
}
