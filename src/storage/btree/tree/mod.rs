//! The tree facade and the single-writer structural engine behind it.

mod api;
mod internal;
mod leaf;
mod maintenance;
mod mutation;
mod types;
mod writer;

pub use api::{describe_file, overwrite_header, read_header, FileInfo, GbpTree};
pub use maintenance::CleanupReport;
pub(crate) use types::TreeCore;
pub use types::{GbpTreeOptions, DEFAULT_PAGE_SIZE};
pub use writer::Writer;
