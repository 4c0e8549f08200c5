use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// One resident page image plus its modification and clock bookkeeping.
///
/// `version` is drawn from a counter shared by the whole page store, so a
/// page that was evicted and loaded again never reports a version a reader
/// saw before.
pub(crate) struct Frame {
    pub(crate) buf: Arc<RwLock<Box<[u8]>>>,
    version: AtomicU64,
    dirty: AtomicBool,
    referenced: AtomicBool,
}

impl Frame {
    pub(crate) fn new(image: Box<[u8]>, version: u64) -> Self {
        Self {
            buf: Arc::new(RwLock::new(image)),
            version: AtomicU64::new(version),
            dirty: AtomicBool::new(false),
            referenced: AtomicBool::new(true),
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Called while the write lock is still held so the version published
    /// with a copy always matches its bytes.
    pub(crate) fn mark_written(&self, version: u64) {
        self.version.store(version, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn restore_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        self.referenced.store(true, Ordering::Relaxed);
    }

    /// Clears the reference bit, returning whether it was set.
    pub(crate) fn take_reference(&self) -> bool {
        self.referenced.swap(false, Ordering::Relaxed)
    }
}
