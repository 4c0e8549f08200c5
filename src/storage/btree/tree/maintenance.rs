use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::primitives::pager::{IoLimiter, Unlimited};
use crate::types::{GbpTreeError, Result};

use super::super::gspp::{self, Generations};
use super::super::page::{self, Link};
use super::super::state::{other_page, TreeState};
use super::types::{Mutable, TreeCore};

/// Flush attempts close makes before giving the IO error back to the caller.
const CLOSE_ATTEMPTS: u32 = 3;

/// Outcome of the recovery cleanup that runs after an unclean shutdown.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct CleanupReport {
    /// Tree nodes visited.
    pub pages_visited: u64,
    /// Crashed or torn pointer slots zeroed.
    pub pointers_cleaned: u64,
}

impl TreeCore {
    /// Walks every reachable node and zeroes pointer slots written by the
    /// session that crashed. Writers and checkpoints are held off by the
    /// session lock while this runs; readers are not.
    pub(crate) fn clean_crashed_pointers(&self) -> Result<CleanupReport> {
        let started = Instant::now();
        let gens = self.generations();
        let mut report = CleanupReport::default();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([self.root().id]);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let mut copy = self.read_page(id)?;
            if !page::is_node(&copy) {
                return Err(GbpTreeError::inconsistent(id, "cleanup reached a non-node page"));
            }
            report.pages_visited += 1;
            let offsets = self.pointer_offsets(&copy)?;
            let cleaned: usize = offsets
                .iter()
                .map(|off| gspp::clean_crashed(&mut copy, *off, gens))
                .sum();
            if cleaned > 0 {
                let mut live = self.pager.write(id)?;
                for off in &offsets {
                    gspp::clean_crashed(&mut live, *off, gens);
                }
                report.pointers_cleaned += cleaned as u64;
            }
            if !page::is_leaf(&copy) {
                queue.extend(self.codec.internal_children(&copy, id, gens)?);
            }
        }
        self.stats
            .record_cleanup(report.pages_visited, report.pointers_cleaned);
        *self.cleanup.lock() = Some(report);
        info!(
            target: "gbptree::cleanup",
            pages_visited = report.pages_visited,
            pointers_cleaned = report.pointers_cleaned,
            duration_ms = started.elapsed().as_millis() as u64,
            "gbptree.cleanup.completed"
        );
        Ok(report)
    }

    fn pointer_offsets(&self, page: &[u8]) -> Result<SmallVec<[usize; 16]>> {
        let mut offsets: SmallVec<[usize; 16]> = Link::ALL.iter().map(|link| link.offset()).collect();
        if !page::is_leaf(page) {
            let count = self.codec.key_count(page)?;
            offsets.extend((0..=count).map(|pos| self.codec.child_offset(pos)));
        }
        Ok(offsets)
    }

    /// Persists a new state copy over the older one and syncs the file.
    pub(crate) fn write_state(
        &self,
        m: &mut Mutable,
        gens: Generations,
        clean: bool,
        header: Option<&[u8]>,
    ) -> Result<()> {
        let state = TreeState {
            version: m.state_version + 1,
            gens,
            root: self.root(),
            last_id: m.free.last_id(),
            freelist: m.free.cursors(),
            clean,
            header: header.map_or_else(|| m.header.clone(), <[u8]>::to_vec),
        };
        let target = other_page(m.state_page);
        let image = state.encode(target, self.pager.page_size(), self.meta.salt)?;
        self.pager.write_through(target, &image)?;
        self.pager.io().sync_all()?;
        m.state_page = target;
        m.state_version = state.version;
        m.header = state.header;
        Ok(())
    }

    /// Makes everything written so far durable and advances the generations.
    pub(crate) fn checkpoint(&self, limiter: &dyn IoLimiter, header: Option<&[u8]>) -> Result<()> {
        self.ensure_writable()?;
        let started = Instant::now();
        // Most dirty pages go out before the writer is held off.
        self.pager.flush(limiter)?;
        let _permit = self.sessions.begin_checkpoint()?;
        let mut m = self.mutable.lock();
        let written = self.pager.flush(limiter)?;
        let next = self.generations().after_checkpoint();
        self.write_state(&mut m, next, false, header)?;
        self.set_generations(next);
        m.changed = false;
        self.stats.inc_checkpoints();
        info!(
            target: "gbptree::checkpoint",
            stable = next.stable,
            unstable = next.unstable,
            root = self.root().id.0,
            pages_written = written,
            duration_ms = started.elapsed().as_millis() as u64,
            "gbptree.checkpoint.completed"
        );
        Ok(())
    }

    /// Waits for the writer and cleanup, then flushes. A clean state is only
    /// recorded when nothing changed since the last checkpoint and recovery
    /// cleanup did not fail. IO errors are retried a few times; when they
    /// persist the session stays open so a later close can try again.
    /// Returns without doing anything when the tree is already closed.
    pub(crate) fn close(&self) -> Result<()> {
        let Some(permit) = self.sessions.begin_close() else {
            return Ok(());
        };
        if self.read_only {
            debug!(target: "gbptree::open", path = %self.path.display(), "gbptree.close.read_only");
            permit.complete();
            return Ok(());
        }
        let mut m = self.mutable.lock();
        let cleanup_failed = permit.cleanup_failed();
        let clean = !m.changed && !cleanup_failed;
        let mut attempt = 1;
        loop {
            match self.flush_for_close(&mut m, clean) {
                Ok(()) => break,
                Err(GbpTreeError::Io(err)) if attempt < CLOSE_ATTEMPTS => {
                    warn!(
                        target: "gbptree::open",
                        path = %self.path.display(),
                        attempt,
                        error = %err,
                        "gbptree.close.retry"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
        permit.complete();
        info!(
            target: "gbptree::open",
            path = %self.path.display(),
            clean,
            cleanup_failed,
            "gbptree.close.completed"
        );
        self.stats.emit_tracing();
        Ok(())
    }

    fn flush_for_close(&self, m: &mut Mutable, clean: bool) -> Result<()> {
        self.pager.flush(&Unlimited)?;
        if clean {
            self.write_state(m, self.generations(), true, None)?;
        }
        Ok(())
    }

    /// Flushes pages and closes the session without recording any state,
    /// leaving the file as a crash would.
    pub(crate) fn simulate_crash(&self) -> Result<()> {
        self.pager.flush(&Unlimited)?;
        self.sessions.close();
        Ok(())
    }

    /// Highest page id the allocator has handed out.
    #[cfg(test)]
    pub(crate) fn last_id(&self) -> crate::types::PageId {
        self.mutable.lock().free.last_id()
    }
}
