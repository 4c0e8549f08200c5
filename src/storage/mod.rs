//! Persistent index structures.

/// Generation-stamped copy-on-write B+tree.
pub mod btree;
