use crate::types::{GbpTreeError, PageId, Result};

use super::super::node::{LeafEntry, Overflow};
use super::super::page::{self, Link};
use super::mutation::{Mutation, Propagation};

/// Keys and children of one internal node.
struct Branch {
    keys: Vec<Vec<u8>>,
    children: Vec<PageId>,
}

impl Mutation<'_> {
    /// Applies a child's propagation to internal node `id`, where the child
    /// sits at `pos`.
    pub(super) fn internal(
        &mut self,
        id: PageId,
        pos: usize,
        child: Propagation,
    ) -> Result<Propagation> {
        let codec = self.codec();
        let (id, successor) = self.ensure_unstable(id)?;
        let mut prop = Propagation {
            successor,
            ..Propagation::default()
        };
        if let Some(copy) = child.successor {
            let mut page = self.page_mut(id)?;
            codec.set_child_at(&mut page, pos, copy, self.gens)?;
        }
        if let Some((separator, right)) = child.split {
            let mut page = self.page_mut(id)?;
            match codec.internal_overflow(&page, &separator)? {
                Overflow::No => {
                    codec.insert_key_and_right_child_at(&mut page, pos, &separator, right, self.gens)?
                }
                Overflow::NoNeedDefrag => {
                    codec.defragment(&mut page)?;
                    codec.insert_key_and_right_child_at(&mut page, pos, &separator, right, self.gens)?;
                }
                Overflow::Yes => {
                    let mut branch = self.branch_of(&page, id)?;
                    drop(page);
                    branch.keys.insert(pos, separator);
                    branch.children.insert(pos + 1, right);
                    prop.split = Some(self.split_internal(id, branch)?);
                }
            }
        }
        if child.underflow {
            self.rebalance_or_merge(id, pos)?;
            let page = self.core.read_page(id)?;
            prop.underflow = codec.internal_underflows(&codec.internal_keys(&page)?);
        }
        Ok(prop)
    }

    fn branch_of(&self, page: &[u8], id: PageId) -> Result<Branch> {
        Ok(Branch {
            keys: self.codec().internal_keys(page)?,
            children: self.codec().internal_children(page, id, self.gens)?,
        })
    }

    fn load_branch(&self, id: PageId) -> Result<Branch> {
        let page = self.core.read_page(id)?;
        self.branch_of(&page, id)
    }

    fn write_branch(&mut self, id: PageId, branch: &Branch) -> Result<()> {
        let codec = self.codec();
        let mut page = self.page_mut(id)?;
        codec.write_internal(&mut page, &branch.keys, &branch.children, self.gens)
    }

    fn write_entries(&mut self, id: PageId, entries: &[LeafEntry]) -> Result<()> {
        let codec = self.codec();
        let mut page = self.page_mut(id)?;
        codec.write_leaf(&mut page, entries)
    }

    /// Splits an overfull internal node, pushing one key up to the parent.
    fn split_internal(&mut self, id: PageId, mut branch: Branch) -> Result<(Vec<u8>, PageId)> {
        let codec = self.codec();
        let sizes: Vec<usize> = branch.keys.iter().map(|k| codec.internal_key_size(k)).collect();
        let count = branch.keys.len();
        let keys = &branch.keys;
        let at = Self::pick_split(&sizes, 1..count.saturating_sub(1), self.split_ratio, |at| {
            codec.internal_fits(&keys[..at]) && codec.internal_fits(&keys[at + 1..])
        })
        .ok_or_else(|| GbpTreeError::inconsistent(id, "no valid internal split point"))?;
        let right = Branch {
            keys: branch.keys.split_off(at + 1),
            children: branch.children.split_off(at + 1),
        };
        let separator = branch
            .keys
            .pop()
            .ok_or_else(|| GbpTreeError::inconsistent(id, "empty internal split"))?;
        let old_right = self.link(&self.core.read_page(id)?, id, Link::Right)?;

        let right_id = self.acquire()?;
        {
            let mut page = self.page_mut(right_id)?;
            codec.initialize_internal(&mut page, self.gens);
            codec.write_internal(&mut page, &right.keys, &right.children, self.gens)?;
            page::set_link(&mut page, Link::Left, id, self.gens)?;
            if !old_right.is_null() {
                page::set_link(&mut page, Link::Right, old_right, self.gens)?;
            }
        }
        self.write_branch(id, &branch)?;
        self.set_link(id, Link::Right, right_id)?;
        if !old_right.is_null() {
            self.set_link(old_right, Link::Left, right_id)?;
        }
        self.core.stats.inc_internal_splits();
        Ok((separator, right_id))
    }

    /// Whether `parent` still fits after separator `pos` becomes `key`.
    fn separator_fits(&self, parent: &Branch, pos: usize, key: &[u8]) -> bool {
        let mut keys = parent.keys.clone();
        keys[pos] = key.to_vec();
        self.codec().internal_fits(&keys)
    }

    fn replace_separator(&mut self, parent: PageId, pos: usize, key: &[u8]) -> Result<()> {
        let codec = self.codec();
        let mut page = self.page_mut(parent)?;
        if !codec.set_key_at(&mut page, pos, key, parent, self.gens)? {
            return Err(GbpTreeError::inconsistent(parent, "separator no longer fits"));
        }
        Ok(())
    }

    fn point_parent_at(&mut self, parent: PageId, pos: usize, copy: Option<PageId>) -> Result<()> {
        if let Some(copy) = copy {
            let codec = self.codec();
            let mut page = self.page_mut(parent)?;
            codec.set_child_at(&mut page, pos, copy, self.gens)?;
        }
        Ok(())
    }

    /// Repairs an under-full child at `pos` of `parent`. Tried in order:
    /// borrow from the left sibling, merge into the right sibling, merge the
    /// left sibling in, borrow from the right sibling. When nothing fits the
    /// child is left as it is.
    fn rebalance_or_merge(&mut self, parent: PageId, pos: usize) -> Result<()> {
        let branch = self.load_branch(parent)?;
        let child = branch.children[pos];
        let left = pos.checked_sub(1).map(|at| branch.children[at]);
        let right = branch.children.get(pos + 1).copied();
        if page::is_leaf(&self.core.read_page(child)?) {
            if let Some(left) = left {
                if self.borrow_leaf_from_left(parent, &branch, pos, left, child)? {
                    return Ok(());
                }
            }
            if let Some(right) = right {
                if self.merge_leaf_into_right(parent, pos, child, right)? {
                    return Ok(());
                }
            }
            if let Some(left) = left {
                if self.merge_left_leaf_into(parent, pos, left, child)? {
                    return Ok(());
                }
            }
            if let Some(right) = right {
                self.borrow_leaf_from_right(parent, &branch, pos, child, right)?;
            }
        } else {
            if let Some(left) = left {
                if self.borrow_branch_from_left(parent, &branch, pos, left, child)? {
                    return Ok(());
                }
            }
            if let Some(right) = right {
                if self.merge_branch_into_right(parent, &branch, pos, child, right)? {
                    return Ok(());
                }
            }
            if let Some(left) = left {
                if self.merge_left_branch_into(parent, &branch, pos, left, child)? {
                    return Ok(());
                }
            }
            if let Some(right) = right {
                self.borrow_branch_from_right(parent, &branch, pos, child, right)?;
            }
        }
        Ok(())
    }

    fn leaf_entries_of(&self, id: PageId) -> Result<Vec<LeafEntry>> {
        self.codec().leaf_entries(&self.core.read_page(id)?)
    }

    /// Split point for moving entries between two adjacent leaves so that
    /// neither ends up under-full. `moves` restricts which points count.
    fn balanced_leaf_point(
        &self,
        combined: &[LeafEntry],
        moves: std::ops::Range<usize>,
    ) -> Option<usize> {
        let codec = self.codec();
        let sizes: Vec<usize> = combined
            .iter()
            .map(|(k, v)| codec.leaf_entry_size(k, v))
            .collect();
        Self::pick_split(&sizes, moves, 0.5, |at| {
            let (l, r) = combined.split_at(at);
            codec.leaf_fits(l)
                && codec.leaf_fits(r)
                && !codec.leaf_underflows(l)
                && !codec.leaf_underflows(r)
        })
    }

    fn borrow_leaf_from_left(
        &mut self,
        parent: PageId,
        branch: &Branch,
        pos: usize,
        left: PageId,
        child: PageId,
    ) -> Result<bool> {
        let left_entries = self.leaf_entries_of(left)?;
        let child_entries = self.leaf_entries_of(child)?;
        let donor = left_entries.len();
        let mut combined = left_entries;
        combined.extend(child_entries);
        let Some(at) = self.balanced_leaf_point(&combined, 1..donor) else {
            return Ok(false);
        };
        let separator = combined[at].0.clone();
        if !self.separator_fits(branch, pos - 1, &separator) {
            return Ok(false);
        }
        let (left, left_copy) = self.ensure_unstable(left)?;
        self.point_parent_at(parent, pos - 1, left_copy)?;
        self.write_entries(child, &combined[at..])?;
        self.write_entries(left, &combined[..at])?;
        self.replace_separator(parent, pos - 1, &separator)?;
        self.core.stats.inc_rebalances();
        Ok(true)
    }

    fn borrow_leaf_from_right(
        &mut self,
        parent: PageId,
        branch: &Branch,
        pos: usize,
        child: PageId,
        right: PageId,
    ) -> Result<bool> {
        let child_entries = self.leaf_entries_of(child)?;
        let right_entries = self.leaf_entries_of(right)?;
        let keep = child_entries.len();
        let mut combined = child_entries;
        combined.extend(right_entries);
        let Some(at) = self.balanced_leaf_point(&combined, keep + 1..combined.len()) else {
            return Ok(false);
        };
        let separator = combined[at].0.clone();
        if !self.separator_fits(branch, pos, &separator) {
            return Ok(false);
        }
        let (right, right_copy) = self.ensure_unstable(right)?;
        self.point_parent_at(parent, pos + 1, right_copy)?;
        self.write_entries(child, &combined[..at])?;
        self.write_entries(right, &combined[at..])?;
        self.replace_separator(parent, pos, &separator)?;
        self.core.stats.inc_rebalances();
        Ok(true)
    }

    /// Moves every entry of `child` to the front of its right sibling and
    /// retires `child` behind a successor pointer.
    fn merge_leaf_into_right(
        &mut self,
        parent: PageId,
        pos: usize,
        child: PageId,
        right: PageId,
    ) -> Result<bool> {
        let mut combined = self.leaf_entries_of(child)?;
        combined.extend(self.leaf_entries_of(right)?);
        if !self.codec().leaf_fits(&combined) {
            return Ok(false);
        }
        let (right, right_copy) = self.ensure_unstable(right)?;
        self.point_parent_at(parent, pos + 1, right_copy)?;
        self.write_entries(right, &combined)?;
        self.absorb_right(parent, pos, child, right)?;
        self.core.stats.inc_leaf_merges();
        Ok(true)
    }

    /// Moves every entry of the left sibling to the front of `child` and
    /// retires the sibling behind a successor pointer.
    fn merge_left_leaf_into(
        &mut self,
        parent: PageId,
        pos: usize,
        left: PageId,
        child: PageId,
    ) -> Result<bool> {
        let mut combined = self.leaf_entries_of(left)?;
        combined.extend(self.leaf_entries_of(child)?);
        if !self.codec().leaf_fits(&combined) {
            return Ok(false);
        }
        self.write_entries(child, &combined)?;
        self.absorb_right(parent, pos - 1, left, child)?;
        self.core.stats.inc_leaf_merges();
        Ok(true)
    }

    /// Finishes a merge where `survivor` already holds the content of
    /// `retired`, its left neighbour at `retired_pos` in `parent`.
    fn absorb_right(
        &mut self,
        parent: PageId,
        retired_pos: usize,
        retired: PageId,
        survivor: PageId,
    ) -> Result<()> {
        let retired_page = self.core.read_page(retired)?;
        let outer_left = self.link(&retired_page, retired, Link::Left)?;
        self.set_link(survivor, Link::Left, outer_left)?;
        if !outer_left.is_null() {
            self.set_link(outer_left, Link::Right, survivor)?;
        }
        self.set_link(retired, Link::Successor, survivor)?;
        {
            let codec = self.codec();
            let mut page = self.page_mut(parent)?;
            codec.remove_key_and_left_child_at(&mut page, retired_pos)?;
        }
        self.release(retired)
    }

    fn borrow_branch_from_left(
        &mut self,
        parent: PageId,
        branch: &Branch,
        pos: usize,
        left: PageId,
        child: PageId,
    ) -> Result<bool> {
        let left_branch = self.load_branch(left)?;
        let child_branch = self.load_branch(child)?;
        let donor = left_branch.keys.len();
        let combined = Self::join(left_branch, &branch.keys[pos - 1], child_branch);
        let Some(at) = self.balanced_branch_point(&combined, 0..donor) else {
            return Ok(false);
        };
        let separator = combined.keys[at].clone();
        if !self.separator_fits(branch, pos - 1, &separator) {
            return Ok(false);
        }
        let (low, high) = Self::divide(&combined, at);
        let (left, left_copy) = self.ensure_unstable(left)?;
        self.point_parent_at(parent, pos - 1, left_copy)?;
        self.write_branch(child, &high)?;
        self.write_branch(left, &low)?;
        self.replace_separator(parent, pos - 1, &separator)?;
        self.core.stats.inc_rebalances();
        Ok(true)
    }

    fn borrow_branch_from_right(
        &mut self,
        parent: PageId,
        branch: &Branch,
        pos: usize,
        child: PageId,
        right: PageId,
    ) -> Result<bool> {
        let child_branch = self.load_branch(child)?;
        let right_branch = self.load_branch(right)?;
        let keep = child_branch.keys.len();
        let combined = Self::join(child_branch, &branch.keys[pos], right_branch);
        let Some(at) = self.balanced_branch_point(&combined, keep + 1..combined.keys.len()) else {
            return Ok(false);
        };
        let separator = combined.keys[at].clone();
        if !self.separator_fits(branch, pos, &separator) {
            return Ok(false);
        }
        let (low, high) = Self::divide(&combined, at);
        let (right, right_copy) = self.ensure_unstable(right)?;
        self.point_parent_at(parent, pos + 1, right_copy)?;
        self.write_branch(child, &low)?;
        self.write_branch(right, &high)?;
        self.replace_separator(parent, pos, &separator)?;
        self.core.stats.inc_rebalances();
        Ok(true)
    }

    fn merge_branch_into_right(
        &mut self,
        parent: PageId,
        branch: &Branch,
        pos: usize,
        child: PageId,
        right: PageId,
    ) -> Result<bool> {
        let combined = Self::join(
            self.load_branch(child)?,
            &branch.keys[pos],
            self.load_branch(right)?,
        );
        if !self.codec().internal_fits(&combined.keys) {
            return Ok(false);
        }
        let (right, right_copy) = self.ensure_unstable(right)?;
        self.point_parent_at(parent, pos + 1, right_copy)?;
        self.write_branch(right, &combined)?;
        self.absorb_right(parent, pos, child, right)?;
        self.core.stats.inc_internal_merges();
        Ok(true)
    }

    fn merge_left_branch_into(
        &mut self,
        parent: PageId,
        branch: &Branch,
        pos: usize,
        left: PageId,
        child: PageId,
    ) -> Result<bool> {
        let combined = Self::join(
            self.load_branch(left)?,
            &branch.keys[pos - 1],
            self.load_branch(child)?,
        );
        if !self.codec().internal_fits(&combined.keys) {
            return Ok(false);
        }
        self.write_branch(child, &combined)?;
        self.absorb_right(parent, pos - 1, left, child)?;
        self.core.stats.inc_internal_merges();
        Ok(true)
    }

    /// Concatenates two adjacent branches, pulling their parent separator down.
    fn join(low: Branch, separator: &[u8], high: Branch) -> Branch {
        let mut keys = low.keys;
        keys.push(separator.to_vec());
        keys.extend(high.keys);
        let mut children = low.children;
        children.extend(high.children);
        Branch { keys, children }
    }

    /// Splits a joined branch around key `at`, which moves up as the separator.
    fn divide(combined: &Branch, at: usize) -> (Branch, Branch) {
        (
            Branch {
                keys: combined.keys[..at].to_vec(),
                children: combined.children[..=at].to_vec(),
            },
            Branch {
                keys: combined.keys[at + 1..].to_vec(),
                children: combined.children[at + 1..].to_vec(),
            },
        )
    }

    fn balanced_branch_point(
        &self,
        combined: &Branch,
        moves: std::ops::Range<usize>,
    ) -> Option<usize> {
        let codec = self.codec();
        let keys = &combined.keys;
        let sizes: Vec<usize> = keys.iter().map(|k| codec.internal_key_size(k)).collect();
        Self::pick_split(&sizes, moves, 0.5, |at| {
            let (low, high) = (&keys[..at], &keys[at + 1..]);
            codec.internal_fits(low)
                && codec.internal_fits(high)
                && !codec.internal_underflows(low)
                && !codec.internal_underflows(high)
        })
    }
}
