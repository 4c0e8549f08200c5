//! Generation-stamped copy-on-write B+tree index stored in a single file.
//!
//! A [`GbpTree`] keeps ordered key/value pairs on fixed-size pages. One
//! writer mutates the tree while any number of readers seek concurrently,
//! and [`GbpTree::checkpoint`] makes the current content durable. After a
//! crash the tree reopens at its last checkpoint.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::btree::{
    CheckSummary, CollectingVisitor, ConsistencyVisitor, Finding, GbpTree, GbpTreeOptions,
    KeepExisting, KeyCodec, MergeResult, Overwrite, SeekCursor, ValCodec, ValueMerger, Writer,
};
pub use types::{GbpTreeError, PageId, Result};
