#![forbid(unsafe_code)]
//! Page store the tree runs on: resident page frames over positioned file
//! IO, format metadata in page 0, and flush throttling.

mod frame;
mod limiter;
/// Format metadata kept in page 0.
pub mod meta;
mod pager;

pub use limiter::{IoLimiter, PagesPerSecond, Unlimited};
pub use meta::{Meta, NodeFormat};
pub use pager::{PageCursor, PageWrite, PagedFile, PagerStats, DEFAULT_CACHE_PAGES};
