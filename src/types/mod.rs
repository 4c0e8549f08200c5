#![forbid(unsafe_code)]
//! Shared identifiers, error taxonomy, and checksum helpers.

use std::fmt;

/// Checksum helpers used by metadata, tree state, and pointer slots.
pub mod checksum;

pub use checksum::{page_crc32, Checksum, Crc32Fast};

/// Identifier of a fixed-size page inside the tree file.
///
/// Page ids are stored as 6-byte big-endian values inside pointer slots, so
/// valid ids never exceed [`PageId::MAX`]. Id `0` holds format metadata and
/// doubles as the null pointer for node references.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, serde::Serialize,
)]
#[serde(transparent)]
pub struct PageId(pub u64);

impl PageId {
    /// The null reference.
    pub const NULL: PageId = PageId(0);
    /// Largest id a pointer slot can address.
    pub const MAX: PageId = PageId((1 << 48) - 1);

    /// Returns true when this id is the null reference.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

impl From<PageId> for u64 {
    fn from(value: PageId) -> Self {
        value.0
    }
}

/// Errors surfaced by the tree and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum GbpTreeError {
    /// Failure reported by the underlying file.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The file was written with an incompatible format, layout, or page size.
    #[error("metadata mismatch: {0}")]
    MetadataMismatch(String),
    /// A structural problem found while traversing the tree.
    #[error("tree inconsistency: {0}")]
    TreeInconsistency(String),
    /// On-disk bytes that fail validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A second writer was requested while one is open.
    #[error("writer lock already held")]
    WriterAlreadyOpen,
    /// The tree has been closed.
    #[error("tree is closed")]
    Closed,
    /// A mutation was attempted on a tree opened read-only.
    #[error("tree is opened read-only")]
    ReadOnly,
    /// The recovery cleanup job failed, so checkpoints are refused.
    #[error("cleanup failed: {0}")]
    CleanupFailed(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, GbpTreeError>;

impl GbpTreeError {
    /// Builds a [`GbpTreeError::TreeInconsistency`] naming the page involved.
    pub(crate) fn inconsistent(page: PageId, what: &str) -> Self {
        GbpTreeError::TreeInconsistency(format!("{what} (page {page})"))
    }
}
