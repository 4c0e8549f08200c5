//! Low-level primitives the tree is built on: byte encoding, positioned IO,
//! session coordination, and the page store.

/// Big-endian accessors and order-preserving encoders.
pub mod bytes;

/// Writer, checkpoint, cleanup, and close coordination.
pub mod concurrency;

/// Positioned file IO.
pub mod io;

/// Page store with per-page latches and version counters.
pub mod pager;
