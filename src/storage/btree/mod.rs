#![forbid(unsafe_code)]

//! Generation-stamped copy-on-write B+tree.
//!
//! Pages written before the last checkpoint are never modified in place;
//! every change goes to a copy stamped with the unstable generation, and
//! node references are stored as generation-checked pointer pairs. A crash
//! therefore always leaves the tree of the last checkpoint intact.

/// Key and value encodings.
pub mod codecs;
/// Whole-tree validation.
pub mod consistency;
mod cursor;
/// Page id allocation and reuse.
pub mod freelist;
/// Generation-safe pointer pairs.
pub mod gspp;
mod merger;
/// Leaf and internal node layouts.
pub mod node;
/// Node header layout.
pub mod page;
mod partition;
/// Persisted tree state.
pub mod state;
mod stats;
mod tree;

pub use codecs::{layout_id, KeyCodec, ValCodec};
pub use consistency::{CheckSummary, CollectingVisitor, ConsistencyVisitor, Finding, LoggingVisitor};
pub use cursor::{Entries, SeekCursor};
pub use gspp::Generations;
pub use merger::{KeepExisting, MergeResult, Overwrite, ValueMerger};
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use tree::{
    describe_file, overwrite_header, read_header, CleanupReport, FileInfo, GbpTree, GbpTreeOptions, Writer,
    DEFAULT_PAGE_SIZE,
};
