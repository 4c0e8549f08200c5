//! Whole-tree structural validation.
//!
//! The checker walks the tree level by level while holding the writer slot,
//! then cross-checks the freelist against the pages it saw. Every problem
//! goes to a [`ConsistencyVisitor`]; the walk itself only fails on IO errors
//! or when the tree is closed.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::ops::ControlFlow;

use tracing::{info, warn};

use crate::types::{PageId, Result};

use super::freelist::FreeList;
use super::gspp::{BrokenReason, Generations, Pointer, PointerFault};
use super::node::NodeCodec;
use super::page::{self, Link};
use super::tree::TreeCore;

/// First page that can hold tree content; lower pages are meta and state.
const FIRST_CONTENT_PAGE: u64 = 3;

/// One problem found by the checker.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub enum Finding {
    /// A child pointer leads to a page that is not a tree node.
    NotATreeNode {
        /// Offending page.
        page: PageId,
        /// Raw page type byte.
        page_type: u8,
    },
    /// Leaves and internal nodes share a level, or the bottom level is not leaves.
    WrongLevel {
        /// Offending page.
        page: PageId,
        /// Depth of the level, the root being 1.
        depth: usize,
    },
    /// A node's sibling pointer does not match its neighbour on the level.
    SiblingMismatch {
        /// Node holding the pointer.
        page: PageId,
        /// Which pointer.
        link: Link,
        /// Neighbour on the level, or null at the level edge.
        expected: PageId,
        /// Page the pointer resolves to.
        actual: PageId,
    },
    /// A node points at a target written in a later generation than the pointer.
    PointerGenerationLowerThanTarget {
        /// Target node.
        page: PageId,
        /// Generation of the pointer.
        pointer_generation: u32,
        /// Generation of the node.
        node_generation: u32,
    },
    /// Keys within a node are not strictly increasing.
    KeysOutOfOrder {
        /// Offending page.
        page: PageId,
        /// Position of the first key out of order.
        pos: usize,
    },
    /// A key lies outside the range its ancestors' separators allow.
    KeyOutOfRange {
        /// Offending page.
        page: PageId,
        /// Position of the key.
        pos: usize,
    },
    /// Layout bookkeeping of a node is inconsistent.
    NodeMeta {
        /// Offending page.
        page: PageId,
        /// What is wrong.
        problem: &'static str,
    },
    /// A page is reachable twice: a cycle, or a child pointer into another subtree.
    VisitedTwice {
        /// Offending page.
        page: PageId,
    },
    /// A node reachable from the root has a successor.
    LiveNodeWithSuccessor {
        /// Offending page.
        page: PageId,
        /// Successor it points to.
        successor: PageId,
    },
    /// An internal node holds a null child pointer.
    NullChild {
        /// Offending page.
        page: PageId,
        /// Child position.
        pos: usize,
    },
    /// A pointer pair resolves only through a crashed or torn slot.
    CrashedPointer {
        /// Node holding the pointer.
        page: PageId,
        /// Byte offset of the pair.
        offset: usize,
    },
    /// A pointer pair matches no legal write sequence.
    BrokenPointer {
        /// Node holding the pointer.
        page: PageId,
        /// Byte offset of the pair.
        offset: usize,
        /// Why it cannot be resolved.
        reason: BrokenReason,
    },
    /// The freelist chain itself cannot be read.
    FreelistUnreadable {
        /// Error raised while reading it.
        problem: String,
    },
    /// An id appears twice in the freelist.
    DuplicateFreelistEntry {
        /// Repeated id.
        page: PageId,
    },
    /// A freelist entry is a live tree node.
    FreelistEntryInUse {
        /// Offending id.
        page: PageId,
    },
    /// A freelist entry lies beyond the highest allocated id.
    FreelistEntryBeyondLastId {
        /// Offending id.
        page: PageId,
        /// Highest allocated id.
        last_id: PageId,
    },
    /// A page below the highest allocated id is neither live nor free.
    UnusedPage {
        /// Lost page.
        page: PageId,
    },
    /// The session before this one ended without a clean close.
    DirtyOnStartup,
}

/// Receives findings; returning `Break` ends the walk early.
pub trait ConsistencyVisitor {
    /// Called once per finding.
    fn finding(&mut self, finding: &Finding) -> ControlFlow<()>;
}

impl<F> ConsistencyVisitor for F
where
    F: FnMut(&Finding) -> ControlFlow<()>,
{
    fn finding(&mut self, finding: &Finding) -> ControlFlow<()> {
        self(finding)
    }
}

/// Keeps every finding.
#[derive(Debug, Default)]
pub struct CollectingVisitor {
    /// Findings in the order they were reported.
    pub findings: Vec<Finding>,
}

impl ConsistencyVisitor for CollectingVisitor {
    fn finding(&mut self, finding: &Finding) -> ControlFlow<()> {
        self.findings.push(finding.clone());
        ControlFlow::Continue(())
    }
}

/// Logs every finding at warn level.
#[derive(Debug, Default)]
pub struct LoggingVisitor;

impl ConsistencyVisitor for LoggingVisitor {
    fn finding(&mut self, finding: &Finding) -> ControlFlow<()> {
        warn!(target: "gbptree::consistency", finding = ?finding, "gbptree.consistency.finding");
        ControlFlow::Continue(())
    }
}

/// Shape of the tree as seen by the checker.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct CheckSummary {
    /// Levels from the root down to the leaves.
    pub depth: usize,
    /// Keys in the root node.
    pub root_keys: usize,
    /// Nodes visited.
    pub nodes: u64,
    /// Leaves visited.
    pub leaves: u64,
    /// Entries held by the leaves.
    pub entries: u64,
    /// Findings reported.
    pub findings: u64,
}

/// The node before the current one on a level.
#[derive(Clone, Copy)]
struct Neighbour {
    id: PageId,
    generation: u32,
    right: Pointer,
}

struct Pending {
    id: PageId,
    pointer_generation: u32,
    low: Option<Vec<u8>>,
    high: Option<Vec<u8>>,
}

struct Walk<'a> {
    core: &'a TreeCore,
    gens: Generations,
    visitor: &'a mut dyn ConsistencyVisitor,
    visited: HashSet<PageId>,
    summary: CheckSummary,
    stopped: bool,
}

/// Runs the full check. With `report_dirty`, a tree recovered from an
/// unclean shutdown gets a [`Finding::DirtyOnStartup`] first.
pub(crate) fn check(
    core: &TreeCore,
    visitor: &mut dyn ConsistencyVisitor,
    report_dirty: bool,
) -> Result<CheckSummary> {
    core.ensure_open()?;
    let _writer = core.sessions.acquire_writer()?;
    let free = core.mutable.lock().free.clone();
    let mut walk = Walk {
        core,
        gens: core.generations(),
        visitor,
        visited: HashSet::new(),
        summary: CheckSummary::default(),
        stopped: false,
    };
    if report_dirty && core.was_dirty {
        walk.report(Finding::DirtyOnStartup);
    }
    walk.levels()?;
    if !walk.stopped {
        walk.freelist(&free)?;
    }
    let summary = walk.summary;
    info!(
        target: "gbptree::consistency",
        depth = summary.depth,
        nodes = summary.nodes,
        entries = summary.entries,
        findings = summary.findings,
        "gbptree.consistency.completed"
    );
    Ok(summary)
}

impl Walk<'_> {
    fn report(&mut self, finding: Finding) {
        if self.stopped {
            return;
        }
        self.summary.findings += 1;
        if self.visitor.finding(&finding).is_break() {
            self.stopped = true;
        }
    }

    fn codec(&self) -> &dyn NodeCodec {
        self.core.codec.as_ref()
    }

    /// Resolves the pair at `offset`; damaged pairs are reported and read as null.
    fn pointer(&mut self, page_id: PageId, page: &[u8], offset: usize) -> Pointer {
        match super::gspp::read(page, offset, self.gens) {
            Ok(pointer) => pointer,
            Err(PointerFault::Crashed) => {
                self.report(Finding::CrashedPointer {
                    page: page_id,
                    offset,
                });
                Pointer::NULL
            }
            Err(PointerFault::Broken(reason)) => {
                self.report(Finding::BrokenPointer {
                    page: page_id,
                    offset,
                    reason,
                });
                Pointer::NULL
            }
        }
    }

    fn levels(&mut self) -> Result<()> {
        let root = self.core.root();
        let mut level = vec![Pending {
            id: root.id,
            pointer_generation: root.generation,
            low: None,
            high: None,
        }];
        let mut depth = 0;
        while !level.is_empty() && !self.stopped {
            depth += 1;
            self.summary.depth = depth;
            let mut below = Vec::new();
            let mut leaf_level = None;
            let mut previous: Option<Neighbour> = None;
            for item in &level {
                if self.stopped {
                    return Ok(());
                }
                if !self.visited.insert(item.id) {
                    self.report(Finding::VisitedTwice { page: item.id });
                    continue;
                }
                let page = self.core.read_page(item.id)?;
                if !page::is_node(&page) {
                    self.report(Finding::NotATreeNode {
                        page: item.id,
                        page_type: page::page_type_byte(&page),
                    });
                    continue;
                }
                let leaf = page::is_leaf(&page);
                if *leaf_level.get_or_insert(leaf) != leaf {
                    self.report(Finding::WrongLevel {
                        page: item.id,
                        depth,
                    });
                }
                let generation = page::generation(&page);
                if generation > item.pointer_generation {
                    self.report(Finding::PointerGenerationLowerThanTarget {
                        page: item.id,
                        pointer_generation: item.pointer_generation,
                        node_generation: generation,
                    });
                }
                self.summary.nodes += 1;
                self.siblings(item.id, generation, &page, &mut previous);

                let problems = self.codec().check_meta(&page);
                let clean = problems.is_empty();
                for problem in problems {
                    self.report(Finding::NodeMeta {
                        page: item.id,
                        problem,
                    });
                }
                if !clean {
                    continue;
                }
                let count = self.codec().key_count(&page)?;
                if depth == 1 {
                    self.summary.root_keys = count;
                }
                let keys = self.keys(item, &page, count)?;
                if leaf {
                    self.summary.leaves += 1;
                    self.summary.entries += count as u64;
                    continue;
                }
                for pos in 0..=count {
                    let child = self.pointer(item.id, &page, self.codec().child_offset(pos));
                    if child.is_null() {
                        self.report(Finding::NullChild { page: item.id, pos });
                        continue;
                    }
                    below.push(Pending {
                        id: child.id,
                        pointer_generation: child.generation,
                        low: if pos == 0 {
                            item.low.clone()
                        } else {
                            Some(keys[pos - 1].clone())
                        },
                        high: if pos == count {
                            item.high.clone()
                        } else {
                            Some(keys[pos].clone())
                        },
                    });
                }
            }
            if let Some(last) = previous {
                if !last.right.is_null() {
                    self.report(Finding::SiblingMismatch {
                        page: last.id,
                        link: Link::Right,
                        expected: PageId::NULL,
                        actual: last.right.id,
                    });
                }
            }
            if below.is_empty() && leaf_level == Some(false) {
                self.report(Finding::WrongLevel {
                    page: level[0].id,
                    depth,
                });
            }
            level = below;
        }
        Ok(())
    }

    /// Checks the header links of one node against its neighbours on the
    /// level. Sibling pointers must not be older than the node they target.
    fn siblings(
        &mut self,
        id: PageId,
        generation: u32,
        page: &[u8],
        previous: &mut Option<Neighbour>,
    ) {
        let left = self.pointer(id, page, Link::Left.offset());
        let right = self.pointer(id, page, Link::Right.offset());
        let successor = self.pointer(id, page, Link::Successor.offset()).id;
        if !successor.is_null() {
            self.report(Finding::LiveNodeWithSuccessor { page: id, successor });
        }
        let expected_left = previous.map_or(PageId::NULL, |prev| prev.id);
        if left.id != expected_left {
            self.report(Finding::SiblingMismatch {
                page: id,
                link: Link::Left,
                expected: expected_left,
                actual: left.id,
            });
        }
        if let Some(prev) = *previous {
            if prev.right.id != id {
                self.report(Finding::SiblingMismatch {
                    page: prev.id,
                    link: Link::Right,
                    expected: id,
                    actual: prev.right.id,
                });
            } else if prev.right.generation < generation {
                self.report(Finding::PointerGenerationLowerThanTarget {
                    page: id,
                    pointer_generation: prev.right.generation,
                    node_generation: generation,
                });
            }
            if left.id == prev.id && left.generation < prev.generation {
                self.report(Finding::PointerGenerationLowerThanTarget {
                    page: prev.id,
                    pointer_generation: left.generation,
                    node_generation: prev.generation,
                });
            }
        }
        *previous = Some(Neighbour {
            id,
            generation,
            right,
        });
    }

    /// Reads the keys of a node, reporting order and range violations.
    fn keys(&mut self, item: &Pending, page: &[u8], count: usize) -> Result<Vec<Vec<u8>>> {
        let cmp = self.codec().comparator();
        let mut keys: Vec<Vec<u8>> = Vec::with_capacity(count);
        for pos in 0..count {
            let key = self.codec().key_at(page, pos)?.to_vec();
            if let Some(prev) = keys.last() {
                if cmp(prev, &key) != Ordering::Less {
                    self.report(Finding::KeysOutOfOrder { page: item.id, pos });
                }
            }
            let below_low = item
                .low
                .as_ref()
                .is_some_and(|low| cmp(&key, low) == Ordering::Less);
            let above_high = item
                .high
                .as_ref()
                .is_some_and(|high| cmp(&key, high) != Ordering::Less);
            if below_low || above_high {
                self.report(Finding::KeyOutOfRange { page: item.id, pos });
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn freelist(&mut self, free: &FreeList) -> Result<()> {
        let pager = &self.core.pager;
        let (pages, entries) = match (free.pages(pager), free.entries(pager)) {
            (Ok(pages), Ok(entries)) => (pages, entries),
            (Err(err), _) | (_, Err(err)) => {
                self.report(Finding::FreelistUnreadable {
                    problem: err.to_string(),
                });
                return Ok(());
            }
        };
        let last_id = free.last_id();
        let mut queued = HashSet::new();
        for entry in entries {
            if !queued.insert(entry.id) {
                self.report(Finding::DuplicateFreelistEntry { page: entry.id });
            }
            if entry.id > last_id {
                self.report(Finding::FreelistEntryBeyondLastId {
                    page: entry.id,
                    last_id,
                });
            }
            if self.visited.contains(&entry.id) {
                self.report(Finding::FreelistEntryInUse { page: entry.id });
            }
        }
        let chain: HashSet<PageId> = pages.into_iter().collect();
        for raw in FIRST_CONTENT_PAGE..=last_id.0 {
            let id = PageId(raw);
            if !self.visited.contains(&id) && !chain.contains(&id) && !queued.contains(&id) {
                self.report(Finding::UnusedPage { page: id });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::pager::Unlimited;
    use crate::storage::btree::gspp::{GSPP_LEN, SLOT_LEN};
    use crate::storage::btree::{GbpTree, GbpTreeOptions};
    use tempfile::tempdir;

    fn tree_with(dir: &std::path::Path, keys: u64) -> Result<GbpTree<u64, u64>> {
        let tree = GbpTree::open(
            dir.join("check.gbpt"),
            GbpTreeOptions {
                page_size: Some(256),
                ..GbpTreeOptions::default()
            },
        )?;
        {
            let mut writer = tree.writer()?;
            for key in 0..keys {
                writer.put(&key, &(key * 10))?;
            }
        }
        tree.checkpoint(&Unlimited, None)?;
        Ok(tree)
    }

    fn small_tree(dir: &std::path::Path) -> Result<GbpTree<u64, u64>> {
        tree_with(dir, 40)
    }

    /// Node ids per level, root level first.
    fn levels(tree: &GbpTree<u64, u64>) -> Result<Vec<Vec<PageId>>> {
        let core = &tree.core;
        let gens = core.generations();
        let mut current = vec![core.root().id];
        let mut levels = Vec::new();
        while !current.is_empty() {
            let mut below = Vec::new();
            for id in &current {
                let page = core.read_page(*id)?;
                if !page::is_leaf(&page) {
                    below.extend(core.codec.internal_children(&page, *id, gens)?);
                }
            }
            levels.push(std::mem::replace(&mut current, below));
        }
        Ok(levels)
    }

    fn leaves(tree: &GbpTree<u64, u64>) -> Result<Vec<PageId>> {
        Ok(levels(tree)?.pop().unwrap_or_default())
    }

    fn findings(tree: &GbpTree<u64, u64>) -> Result<Vec<Finding>> {
        let mut visitor = CollectingVisitor::default();
        tree.consistency_check(&mut visitor)?;
        Ok(visitor.findings)
    }

    #[test]
    fn healthy_tree_has_no_findings() -> Result<()> {
        let dir = tempdir()?;
        let tree = small_tree(dir.path())?;
        let mut visitor = CollectingVisitor::default();
        let summary = tree.consistency_check(&mut visitor)?;
        assert!(visitor.findings.is_empty(), "{:?}", visitor.findings);
        assert_eq!(summary.entries, 40);
        assert!(summary.depth >= 2);
        assert_eq!(summary.findings, 0);
        assert_eq!(tree.consistency_check(&mut LoggingVisitor)?, summary);
        Ok(())
    }

    #[test]
    fn corrupted_sibling_is_reported_and_break_stops() -> Result<()> {
        let dir = tempdir()?;
        let tree = small_tree(dir.path())?;
        let core = &tree.core;
        let gens = core.generations();
        let root = core.read_page(core.root().id)?;
        let first_leaf = core.codec.child_at(&root, 0, gens).unwrap().id;
        {
            let mut page = core.pager.write(first_leaf)?;
            page::set_link(&mut page, Link::Left, PageId(2), gens)?;
        }

        let mut visitor = CollectingVisitor::default();
        tree.consistency_check(&mut visitor)?;
        assert!(visitor.findings.contains(&Finding::SiblingMismatch {
            page: first_leaf,
            link: Link::Left,
            expected: PageId::NULL,
            actual: PageId(2),
        }));

        let mut seen = 0;
        let mut stop_early = |_: &Finding| {
            seen += 1;
            ControlFlow::Break(())
        };
        let summary = tree.consistency_check(&mut stop_early)?;
        assert_eq!(summary.findings, 1);
        assert_eq!(seen, 1);
        Ok(())
    }

    #[test]
    fn keys_out_of_order_are_reported() -> Result<()> {
        let dir = tempdir()?;
        let tree = tree_with(dir.path(), 200)?;
        let leaf = leaves(&tree)?[0];
        {
            let mut page = tree.core.pager.write(leaf)?;
            let mut entries = tree.core.codec.leaf_entries(&page)?;
            entries.swap(0, 1);
            tree.core.codec.write_leaf(&mut page, &entries)?;
        }
        let found = findings(&tree)?;
        assert!(
            found.contains(&Finding::KeysOutOfOrder { page: leaf, pos: 1 }),
            "{found:?}"
        );
        Ok(())
    }

    #[test]
    fn key_beyond_separator_is_out_of_range() -> Result<()> {
        let dir = tempdir()?;
        let tree = tree_with(dir.path(), 200)?;
        let leaf = leaves(&tree)?[0];
        let last = {
            let mut page = tree.core.pager.write(leaf)?;
            let mut entries = tree.core.codec.leaf_entries(&page)?;
            let last = entries.len() - 1;
            entries[last].0 = u64::MAX.to_be_bytes().to_vec();
            tree.core.codec.write_leaf(&mut page, &entries)?;
            last
        };
        let found = findings(&tree)?;
        assert!(
            found.contains(&Finding::KeyOutOfRange { page: leaf, pos: last }),
            "{found:?}"
        );
        Ok(())
    }

    #[test]
    fn leaf_among_internal_nodes_is_a_wrong_level() -> Result<()> {
        let dir = tempdir()?;
        let tree = tree_with(dir.path(), 200)?;
        let levels = levels(&tree)?;
        assert!(levels.len() >= 3, "tree too shallow: {}", levels.len());
        let leaf = levels[levels.len() - 1][0];
        let core = &tree.core;
        let gens = core.generations();
        let root = core.root().id;
        {
            let mut page = core.pager.write(root)?;
            let last = core.codec.key_count(&page)?;
            core.codec.set_child_at(&mut page, last, leaf, gens)?;
        }
        let found = findings(&tree)?;
        assert!(
            found.contains(&Finding::WrongLevel { page: leaf, depth: 2 }),
            "{found:?}"
        );
        assert!(found.contains(&Finding::VisitedTwice { page: leaf }), "{found:?}");
        Ok(())
    }

    #[test]
    fn shared_child_is_visited_twice() -> Result<()> {
        let dir = tempdir()?;
        let tree = tree_with(dir.path(), 200)?;
        let core = &tree.core;
        let gens = core.generations();
        let root = core.root().id;
        let first = {
            let mut page = core.pager.write(root)?;
            let first = core.codec.child_at(&page, 0, gens).unwrap().id;
            core.codec.set_child_at(&mut page, 1, first, gens)?;
            first
        };
        let found = findings(&tree)?;
        assert!(found.contains(&Finding::VisitedTwice { page: first }), "{found:?}");
        Ok(())
    }

    #[test]
    fn node_newer_than_its_parent_pointer_is_reported() -> Result<()> {
        let dir = tempdir()?;
        let tree = tree_with(dir.path(), 200)?;
        let core = &tree.core;
        let gens = core.generations();
        let leaf = leaves(&tree)?[0];
        let old = {
            let mut page = core.pager.write(leaf)?;
            let old = page::generation(&page);
            page::set_generation(&mut page, gens.unstable);
            old
        };
        let found = findings(&tree)?;
        assert!(
            found.iter().any(|f| matches!(
                f,
                Finding::PointerGenerationLowerThanTarget {
                    page,
                    pointer_generation,
                    node_generation,
                } if *page == leaf && *pointer_generation >= old && *node_generation == gens.unstable
            )),
            "{found:?}"
        );
        Ok(())
    }

    #[test]
    fn stale_sibling_pointers_are_reported() -> Result<()> {
        let dir = tempdir()?;
        let tree = tree_with(dir.path(), 200)?;
        let core = &tree.core;
        let gens = core.generations();
        let levels = levels(&tree)?;
        let leaves = &levels[levels.len() - 1];
        let parent = levels[levels.len() - 2][0];
        let target = leaves[1];
        {
            let mut page = core.pager.write(parent)?;
            assert_eq!(core.codec.child_at(&page, 1, gens).unwrap().id, target);
            core.codec.set_child_at(&mut page, 1, target, gens)?;
        }
        core_write(&tree, target, |page| page::set_generation(page, gens.unstable))?;

        let found = findings(&tree)?;
        assert_eq!(found.len(), 2, "{found:?}");
        assert!(found.iter().all(|f| matches!(
            f,
            Finding::PointerGenerationLowerThanTarget { page, node_generation, .. }
                if *page == target && *node_generation == gens.unstable
        )));
        Ok(())
    }

    #[test]
    fn impossible_key_count_is_node_meta() -> Result<()> {
        let dir = tempdir()?;
        let tree = tree_with(dir.path(), 200)?;
        let leaf = leaves(&tree)?[2];
        core_write(&tree, leaf, |page| page::set_key_count(page, 200))?;
        let found = findings(&tree)?;
        assert!(
            found.contains(&Finding::NodeMeta {
                page: leaf,
                problem: "key count exceeds node capacity",
            }),
            "{found:?}"
        );
        Ok(())
    }

    #[test]
    fn crashed_pointers_are_reported_until_cleanup() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("check.gbpt");
        {
            let tree = tree_with(dir.path(), 100)?;
            {
                let mut writer = tree.writer()?;
                for key in 100..300u64 {
                    writer.put(&key, &key)?;
                }
                for key in (0..50u64).step_by(2) {
                    writer.remove(&key)?;
                }
            }
            tree.simulate_crash()?;
        }
        let read_only = GbpTreeOptions {
            page_size: Some(256),
            read_only: true,
            ..GbpTreeOptions::default()
        };
        {
            let tree: GbpTree<u64, u64> = GbpTree::open(&path, read_only.clone())?;
            let found = findings(&tree)?;
            assert!(
                found.iter().any(|f| matches!(f, Finding::CrashedPointer { .. })),
                "{found:?}"
            );
        }
        drop(GbpTree::<u64, u64>::open(
            &path,
            GbpTreeOptions {
                page_size: Some(256),
                ..GbpTreeOptions::default()
            },
        )?);
        let tree: GbpTree<u64, u64> = GbpTree::open(&path, read_only)?;
        assert!(findings(&tree)?.is_empty());
        Ok(())
    }

    #[test]
    fn equal_generation_slots_are_a_broken_pointer() -> Result<()> {
        let dir = tempdir()?;
        let tree = tree_with(dir.path(), 200)?;
        let core = &tree.core;
        let root = core.root().id;
        let off = core.codec.child_offset(0);
        {
            let mut page = core.pager.write(root)?;
            let first_empty = page[off..off + SLOT_LEN].iter().all(|b| *b == 0);
            let valid = if first_empty { off + SLOT_LEN } else { off };
            let slot = page[valid..valid + SLOT_LEN].to_vec();
            page[off..off + SLOT_LEN].copy_from_slice(&slot);
            page[off + SLOT_LEN..off + GSPP_LEN].copy_from_slice(&slot);
        }
        let found = findings(&tree)?;
        assert!(
            found.contains(&Finding::BrokenPointer {
                page: root,
                offset: off,
                reason: BrokenReason::SameGeneration,
            }),
            "{found:?}"
        );
        assert!(found.contains(&Finding::NullChild { page: root, pos: 0 }), "{found:?}");
        Ok(())
    }

    #[test]
    fn live_node_on_the_freelist_is_reported() -> Result<()> {
        let dir = tempdir()?;
        let tree = tree_with(dir.path(), 200)?;
        let core = &tree.core;
        let gens = core.generations();
        let leaf = leaves(&tree)?[3];
        core.mutable.lock().free.release(&core.pager, leaf, gens)?;
        let found = findings(&tree)?;
        assert!(found.contains(&Finding::FreelistEntryInUse { page: leaf }), "{found:?}");
        Ok(())
    }

    #[test]
    fn id_released_twice_is_a_duplicate_entry() -> Result<()> {
        let dir = tempdir()?;
        let tree = small_tree(dir.path())?;
        let core = &tree.core;
        let gens = core.generations();
        let id = {
            let mut m = core.mutable.lock();
            let id = m.free.acquire(&core.pager, gens)?;
            m.free.release(&core.pager, id, gens)?;
            m.free.release(&core.pager, id, gens)?;
            id
        };
        let found = findings(&tree)?;
        assert_eq!(found, vec![Finding::DuplicateFreelistEntry { page: id }]);
        Ok(())
    }

    #[test]
    fn leaked_page_is_unused() -> Result<()> {
        let dir = tempdir()?;
        let tree = small_tree(dir.path())?;
        let core = &tree.core;
        let gens = core.generations();
        let id = core.mutable.lock().free.acquire(&core.pager, gens)?;
        let found = findings(&tree)?;
        assert_eq!(found, vec![Finding::UnusedPage { page: id }]);
        Ok(())
    }

    #[test]
    fn dirty_startup_is_reported_on_request() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("check.gbpt");
        {
            let tree = small_tree(dir.path())?;
            tree.writer()?.put(&1_000, &1)?;
            tree.simulate_crash()?;
        }
        let tree: GbpTree<u64, u64> = GbpTree::open(
            &path,
            GbpTreeOptions {
                page_size: Some(256),
                ..GbpTreeOptions::default()
            },
        )?;
        assert!(findings(&tree)?.is_empty());
        let mut visitor = CollectingVisitor::default();
        let summary = tree.consistency_check_with(&mut visitor, true)?;
        assert_eq!(visitor.findings, vec![Finding::DirtyOnStartup]);
        assert_eq!(summary.findings, 1);
        drop(tree);

        let tree: GbpTree<u64, u64> = GbpTree::open(
            &path,
            GbpTreeOptions {
                page_size: Some(256),
                ..GbpTreeOptions::default()
            },
        )?;
        let mut visitor = CollectingVisitor::default();
        tree.consistency_check_with(&mut visitor, true)?;
        assert!(visitor.findings.is_empty(), "{:?}", visitor.findings);
        Ok(())
    }

    fn core_write(tree: &GbpTree<u64, u64>, id: PageId, edit: impl FnOnce(&mut [u8])) -> Result<()> {
        let mut page = tree.core.pager.write(id)?;
        edit(&mut page);
        Ok(())
    }
}
