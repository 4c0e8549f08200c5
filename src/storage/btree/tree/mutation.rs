use crate::primitives::pager::PageWrite;
use crate::types::{GbpTreeError, PageId, Result};

use super::super::freelist::FreeList;
use super::super::gspp::{self, Generations, Pointer, PointerFault};
use super::super::node::NodeCodec;
use super::super::page::{self, Link};
use super::types::TreeCore;

/// What to do with an entry whose key is already present.
pub(crate) enum HitAction {
    Keep,
    Replace(Vec<u8>),
    Remove,
}

/// Callback resolving an insert onto an existing key, given the stored key and value.
pub(crate) type OnHit<'m> = dyn FnMut(&[u8], &[u8]) -> Result<HitAction> + 'm;

/// The change applied at the leaf level.
pub(crate) enum LeafOp<'m> {
    Put {
        value: &'m [u8],
        on_hit: &'m mut OnHit<'m>,
    },
    Remove,
}

/// Structural changes a child reports to its parent.
#[derive(Default, Debug)]
pub(crate) struct Propagation {
    /// The child was copied; the parent must point at the copy.
    pub(crate) successor: Option<PageId>,
    /// The child split; the separator and new right node go into the parent.
    pub(crate) split: Option<(Vec<u8>, PageId)>,
    /// The child dropped below its fill threshold.
    pub(crate) underflow: bool,
}

impl Propagation {
    fn is_empty(&self) -> bool {
        self.successor.is_none() && self.split.is_none() && !self.underflow
    }
}

/// One structural modification, run by the single writer.
///
/// Nodes written in an older generation are never changed in place: they
/// get a successor copy first, so everything reachable from the last
/// checkpoint stays intact until the next one.
pub(crate) struct Mutation<'a> {
    pub(super) core: &'a TreeCore,
    pub(super) free: &'a mut FreeList,
    pub(super) gens: Generations,
    pub(super) split_ratio: f64,
    pub(super) touched: bool,
}

impl<'a> Mutation<'a> {
    pub(crate) fn new(
        core: &'a TreeCore,
        free: &'a mut FreeList,
        gens: Generations,
        split_ratio: f64,
    ) -> Self {
        Self {
            core,
            free,
            gens,
            split_ratio,
            touched: false,
        }
    }

    /// True once any page was written.
    pub(crate) fn touched(&self) -> bool {
        self.touched
    }

    /// Applies `op` for `key` and returns the value removed from the tree, if any.
    pub(crate) fn apply(&mut self, key: &[u8], op: &mut LeafOp<'_>) -> Result<Option<Vec<u8>>> {
        let root = self.core.root();
        let mut removed = None;
        let prop = self.descend(root.id, key, op, &mut removed)?;
        let mut root_id = prop.successor.unwrap_or(root.id);
        if let Some((separator, right)) = prop.split {
            let new_root = self.acquire()?;
            let mut page = self.page_mut(new_root)?;
            self.codec().initialize_internal(&mut page, self.gens);
            self.codec()
                .write_internal(&mut page, &[separator], &[root_id, right], self.gens)?;
            drop(page);
            self.core.stats.inc_root_splits();
            root_id = new_root;
        } else if prop.underflow {
            root_id = self.collapse_root(root_id)?;
        }
        if root_id != root.id {
            let generation = page::generation(&self.core.read_page(root_id)?);
            self.core.set_root(Pointer {
                id: root_id,
                generation,
            });
        }
        Ok(removed)
    }

    fn descend(
        &mut self,
        id: PageId,
        key: &[u8],
        op: &mut LeafOp<'_>,
        removed: &mut Option<Vec<u8>>,
    ) -> Result<Propagation> {
        let page = self.core.read_page(id)?;
        self.check_live(id, &page)?;
        if page::is_leaf(&page) {
            return self.leaf(id, &page, key, op, removed);
        }
        let pos = self.codec().child_index(&page, key)?;
        let child = self.child(&page, id, pos)?;
        let child_prop = self.descend(child, key, op, removed)?;
        if child_prop.is_empty() {
            return Ok(Propagation::default());
        }
        self.internal(id, pos, child_prop)
    }

    /// An internal root without keys hands the root role to its only child.
    fn collapse_root(&mut self, mut root: PageId) -> Result<PageId> {
        loop {
            let page = self.core.read_page(root)?;
            if page::is_leaf(&page) || self.codec().key_count(&page)? > 0 {
                return Ok(root);
            }
            let child = self.child(&page, root, 0)?;
            let (old, _) = self.ensure_unstable(root)?;
            let mut obsolete = self.page_mut(old)?;
            page::set_link(&mut obsolete, Link::Successor, child, self.gens)?;
            drop(obsolete);
            self.release(old)?;
            self.core.stats.inc_root_collapses();
            root = child;
        }
    }

    pub(super) fn codec(&self) -> &'a dyn NodeCodec {
        self.core.codec.as_ref()
    }

    pub(super) fn page_mut(&mut self, id: PageId) -> Result<PageWrite> {
        self.touched = true;
        self.core.pager.write(id)
    }

    pub(super) fn acquire(&mut self) -> Result<PageId> {
        self.touched = true;
        self.free.acquire(&self.core.pager, self.gens)
    }

    pub(super) fn release(&mut self, id: PageId) -> Result<()> {
        self.free.release(&self.core.pager, id, self.gens)
    }

    /// Fails when the writer reached a node that is not a live tree node.
    pub(super) fn check_live(&self, id: PageId, page: &[u8]) -> Result<()> {
        if !page::is_node(page) {
            return Err(GbpTreeError::inconsistent(id, "writer reached a non-node page"));
        }
        match page::link(page, Link::Successor, self.gens) {
            Ok(successor) if !successor.is_null() => Err(GbpTreeError::inconsistent(
                id,
                &format!("writer reached a node with successor {}", successor.id),
            )),
            Ok(_) | Err(PointerFault::Crashed) => Ok(()),
            Err(fault) => Err(GbpTreeError::inconsistent(
                id,
                &format!("unreadable successor pointer: {fault:?}"),
            )),
        }
    }

    pub(super) fn child(&self, page: &[u8], id: PageId, pos: usize) -> Result<PageId> {
        match self.codec().child_at(page, pos, self.gens) {
            Ok(child) if !child.is_null() => Ok(child.id),
            Ok(_) => Err(GbpTreeError::inconsistent(id, "null child pointer")),
            Err(fault) => Err(GbpTreeError::inconsistent(
                id,
                &format!("unreadable child pointer {pos}: {fault:?}"),
            )),
        }
    }

    /// Resolves a sibling or successor link; crashed pairs read as null.
    pub(super) fn link(&self, page: &[u8], id: PageId, link: Link) -> Result<PageId> {
        match page::link(page, link, self.gens) {
            Ok(target) => Ok(target.id),
            Err(PointerFault::Crashed) => Ok(PageId::NULL),
            Err(fault) => Err(GbpTreeError::inconsistent(
                id,
                &format!("unreadable {link:?} pointer: {fault:?}"),
            )),
        }
    }

    pub(super) fn set_link(&mut self, id: PageId, link: Link, target: PageId) -> Result<()> {
        let mut page = self.page_mut(id)?;
        page::set_link(&mut page, link, target, self.gens)
    }

    /// Makes sure `id` may be changed in place.
    ///
    /// A node from an older generation is copied to a fresh page stamped with
    /// the unstable generation. The original gets a successor pointer to the
    /// copy, its siblings are pointed at the copy, and the original id is
    /// released. Returns the id to write to and, when a copy was made, the
    /// id the parent must now reference.
    pub(super) fn ensure_unstable(&mut self, id: PageId) -> Result<(PageId, Option<PageId>)> {
        let page = self.core.read_page(id)?;
        let generation = page::generation(&page);
        if generation == self.gens.unstable {
            return Ok((id, None));
        }
        if generation > self.gens.unstable {
            return Err(GbpTreeError::inconsistent(
                id,
                &format!("node generation {generation} is ahead of the tree"),
            ));
        }
        let left = self.link(&page, id, Link::Left)?;
        let right = self.link(&page, id, Link::Right)?;
        let copy = self.acquire()?;
        {
            let mut fresh = self.page_mut(copy)?;
            fresh.copy_from_slice(&page);
            page::set_generation(&mut fresh, self.gens.unstable);
            gspp::clear(&mut fresh, Link::Successor.offset());
        }
        self.set_link(id, Link::Successor, copy)?;
        if !left.is_null() {
            self.set_link(left, Link::Right, copy)?;
        }
        if !right.is_null() {
            self.set_link(right, Link::Left, copy)?;
        }
        self.release(id)?;
        self.core.stats.inc_successors_created();
        Ok((copy, Some(copy)))
    }

    /// Index among `0..count` whose prefix size lands closest to `ratio` of
    /// the total, restricted to indexes accepted by `valid`. Ties go to the
    /// smaller index.
    pub(super) fn pick_split(
        sizes: &[usize],
        range: std::ops::Range<usize>,
        ratio: f64,
        valid: impl Fn(usize) -> bool,
    ) -> Option<usize> {
        let total: usize = sizes.iter().sum();
        let target = ratio * total as f64;
        let mut best: Option<(usize, f64)> = None;
        for at in range {
            if !valid(at) {
                continue;
            }
            let prefix: usize = sizes[..at].iter().sum();
            let distance = (prefix as f64 - target).abs();
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((at, distance));
            }
        }
        best.map(|(at, _)| at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_point_follows_ratio() {
        let sizes = vec![16; 11];
        assert_eq!(Mutation::pick_split(&sizes, 1..11, 0.5, |_| true), Some(5));
        assert_eq!(Mutation::pick_split(&sizes, 1..11, 0.0, |_| true), Some(1));
        assert_eq!(Mutation::pick_split(&sizes, 1..11, 1.0, |_| true), Some(10));
        assert_eq!(Mutation::pick_split(&sizes, 1..11, 0.5, |at| at > 7), Some(8));
        assert_eq!(Mutation::pick_split(&sizes, 1..11, 0.5, |_| false), None);
    }
}
