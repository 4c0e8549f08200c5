use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, serde::Serialize)]
pub struct TreeStatsSnapshot {
    /// Leaf splits performed.
    pub leaf_splits: u64,
    /// Internal node splits performed.
    pub internal_splits: u64,
    /// Leaf merges performed.
    pub leaf_merges: u64,
    /// Internal node merges performed.
    pub internal_merges: u64,
    /// Entries moved between siblings to fix an underflow.
    pub rebalances: u64,
    /// Copy-on-write successors created for stable nodes.
    pub successors_created: u64,
    /// Times the tree grew a level.
    pub root_splits: u64,
    /// Times an empty internal root was replaced by its child.
    pub root_collapses: u64,
    /// Seek steps that re-read a page after a concurrent change.
    pub seek_retries: u64,
    /// Seeks that restarted from the root.
    pub seek_reseeks: u64,
    /// Completed checkpoints.
    pub checkpoints: u64,
    /// Pages visited by the last recovery cleanup.
    pub cleanup_pages_visited: u64,
    /// Pointer slots zeroed by the last recovery cleanup.
    pub cleanup_pointers_cleaned: u64,
}

/// Thread-safe statistics for one open tree.
#[derive(Default)]
pub struct TreeStats {
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    leaf_merges: AtomicU64,
    internal_merges: AtomicU64,
    rebalances: AtomicU64,
    successors_created: AtomicU64,
    root_splits: AtomicU64,
    root_collapses: AtomicU64,
    seek_retries: AtomicU64,
    seek_reseeks: AtomicU64,
    checkpoints: AtomicU64,
    cleanup_pages_visited: AtomicU64,
    cleanup_pointers_cleaned: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, AtomicOrdering::Relaxed);
}

impl TreeStats {
    pub(crate) fn inc_leaf_splits(&self) {
        bump(&self.leaf_splits);
    }

    pub(crate) fn inc_internal_splits(&self) {
        bump(&self.internal_splits);
    }

    pub(crate) fn inc_leaf_merges(&self) {
        bump(&self.leaf_merges);
    }

    pub(crate) fn inc_internal_merges(&self) {
        bump(&self.internal_merges);
    }

    pub(crate) fn inc_rebalances(&self) {
        bump(&self.rebalances);
    }

    pub(crate) fn inc_successors_created(&self) {
        bump(&self.successors_created);
    }

    pub(crate) fn inc_root_splits(&self) {
        bump(&self.root_splits);
    }

    pub(crate) fn inc_root_collapses(&self) {
        bump(&self.root_collapses);
    }

    pub(crate) fn inc_seek_retries(&self) {
        bump(&self.seek_retries);
    }

    pub(crate) fn inc_seek_reseeks(&self) {
        bump(&self.seek_reseeks);
    }

    pub(crate) fn inc_checkpoints(&self) {
        bump(&self.checkpoints);
    }

    pub(crate) fn record_cleanup(&self, pages_visited: u64, pointers_cleaned: u64) {
        self.cleanup_pages_visited
            .store(pages_visited, AtomicOrdering::Relaxed);
        self.cleanup_pointers_cleaned
            .store(pointers_cleaned, AtomicOrdering::Relaxed);
    }

    /// Returns the number of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of copy-on-write successors created.
    pub fn successors_created(&self) -> u64 {
        self.successors_created.load(AtomicOrdering::Relaxed)
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        let load = |c: &AtomicU64| c.load(AtomicOrdering::Relaxed);
        TreeStatsSnapshot {
            leaf_splits: load(&self.leaf_splits),
            internal_splits: load(&self.internal_splits),
            leaf_merges: load(&self.leaf_merges),
            internal_merges: load(&self.internal_merges),
            rebalances: load(&self.rebalances),
            successors_created: load(&self.successors_created),
            root_splits: load(&self.root_splits),
            root_collapses: load(&self.root_collapses),
            seek_retries: load(&self.seek_retries),
            seek_reseeks: load(&self.seek_reseeks),
            checkpoints: load(&self.checkpoints),
            cleanup_pages_visited: load(&self.cleanup_pages_visited),
            cleanup_pointers_cleaned: load(&self.cleanup_pointers_cleaned),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "gbptree::stats",
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            leaf_merges = snapshot.leaf_merges,
            internal_merges = snapshot.internal_merges,
            rebalances = snapshot.rebalances,
            successors_created = snapshot.successors_created,
            root_splits = snapshot.root_splits,
            root_collapses = snapshot.root_collapses,
            seek_retries = snapshot.seek_retries,
            seek_reseeks = snapshot.seek_reseeks,
            checkpoints = snapshot.checkpoints,
            "gbptree.stats.snapshot"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = TreeStats::default();
        stats.inc_leaf_splits();
        stats.inc_leaf_splits();
        stats.inc_successors_created();
        stats.record_cleanup(12, 3);
        let snap = stats.snapshot();
        assert_eq!(snap.leaf_splits, 2);
        assert_eq!(stats.successors_created(), 1);
        assert_eq!(snap.cleanup_pointers_cleaned, 3);
        stats.emit_tracing();
    }
}
