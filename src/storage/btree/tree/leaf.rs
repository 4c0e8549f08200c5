use crate::types::{GbpTreeError, PageId, Result};

use super::super::node::{LeafEntry, Overflow};
use super::super::page::{self, Link};
use super::mutation::{HitAction, LeafOp, Mutation, Propagation};

impl Mutation<'_> {
    pub(super) fn leaf(
        &mut self,
        id: PageId,
        page: &[u8],
        key: &[u8],
        op: &mut LeafOp<'_>,
        removed: &mut Option<Vec<u8>>,
    ) -> Result<Propagation> {
        let codec = self.codec();
        let (pos, hit) = codec.search(page, key)?;
        match op {
            LeafOp::Remove => {
                if !hit {
                    return Ok(Propagation::default());
                }
                *removed = Some(codec.value_at(page, pos)?.to_vec());
                self.leaf_remove(id, pos)
            }
            LeafOp::Put { value, on_hit } => {
                if !hit {
                    return self.leaf_insert(id, pos, key, *value);
                }
                let existing = codec.value_at(page, pos)?;
                match (*on_hit)(codec.key_at(page, pos)?, existing)? {
                    HitAction::Keep => Ok(Propagation::default()),
                    HitAction::Remove => {
                        *removed = Some(existing.to_vec());
                        self.leaf_remove(id, pos)
                    }
                    HitAction::Replace(value) => self.leaf_replace(id, pos, &value),
                }
            }
        }
    }

    fn leaf_insert(
        &mut self,
        id: PageId,
        pos: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<Propagation> {
        let codec = self.codec();
        let (id, successor) = self.ensure_unstable(id)?;
        let mut page = self.page_mut(id)?;
        match codec.leaf_overflow(&page, key, value)? {
            Overflow::No => codec.insert_key_value_at(&mut page, pos, key, value)?,
            Overflow::NoNeedDefrag => {
                codec.defragment(&mut page)?;
                codec.insert_key_value_at(&mut page, pos, key, value)?;
            }
            Overflow::Yes => {
                let mut entries = codec.leaf_entries(&page)?;
                drop(page);
                entries.insert(pos, (key.to_vec(), value.to_vec()));
                let split = self.split_leaf(id, entries)?;
                return Ok(Propagation {
                    successor,
                    split: Some(split),
                    underflow: false,
                });
            }
        }
        Ok(Propagation {
            successor,
            ..Propagation::default()
        })
    }

    fn leaf_replace(&mut self, id: PageId, pos: usize, value: &[u8]) -> Result<Propagation> {
        let codec = self.codec();
        let (id, successor) = self.ensure_unstable(id)?;
        let mut page = self.page_mut(id)?;
        if codec.set_value_at(&mut page, pos, value)? {
            return Ok(Propagation {
                successor,
                ..Propagation::default()
            });
        }
        // The grown value no longer fits next to its neighbours.
        let mut entries = codec.leaf_entries(&page)?;
        drop(page);
        entries[pos].1 = value.to_vec();
        let split = self.split_leaf(id, entries)?;
        Ok(Propagation {
            successor,
            split: Some(split),
            underflow: false,
        })
    }

    fn leaf_remove(&mut self, id: PageId, pos: usize) -> Result<Propagation> {
        let codec = self.codec();
        let (id, successor) = self.ensure_unstable(id)?;
        let mut page = self.page_mut(id)?;
        codec.remove_key_value_at(&mut page, pos)?;
        let underflow = codec.leaf_underflows(&codec.leaf_entries(&page)?);
        Ok(Propagation {
            successor,
            split: None,
            underflow,
        })
    }

    /// Splits an overfull leaf. `entries` is the full content including the
    /// entry that did not fit. The right half moves to a new page, which is
    /// written before the left half is truncated so a concurrent reader
    /// always finds every key on one of the two pages.
    fn split_leaf(&mut self, id: PageId, mut entries: Vec<LeafEntry>) -> Result<(Vec<u8>, PageId)> {
        let codec = self.codec();
        let sizes: Vec<usize> = entries
            .iter()
            .map(|(k, v)| codec.leaf_entry_size(k, v))
            .collect();
        let at = Self::pick_split(&sizes, 1..entries.len(), self.split_ratio, |at| {
            codec.leaf_fits(&entries[..at]) && codec.leaf_fits(&entries[at..])
        })
        .ok_or_else(|| GbpTreeError::inconsistent(id, "no valid leaf split point"))?;
        let right_entries = entries.split_off(at);
        let separator = right_entries[0].0.clone();
        let old_right = self.link(&self.core.read_page(id)?, id, Link::Right)?;

        let right = self.acquire()?;
        {
            let mut page = self.page_mut(right)?;
            codec.initialize_leaf(&mut page, self.gens);
            codec.write_leaf(&mut page, &right_entries)?;
            page::set_link(&mut page, Link::Left, id, self.gens)?;
            if !old_right.is_null() {
                page::set_link(&mut page, Link::Right, old_right, self.gens)?;
            }
        }
        {
            let mut page = self.page_mut(id)?;
            codec.write_leaf(&mut page, &entries)?;
            page::set_link(&mut page, Link::Right, right, self.gens)?;
        }
        if !old_right.is_null() {
            self.set_link(old_right, Link::Left, right)?;
        }
        self.core.stats.inc_leaf_splits();
        Ok((separator, right))
    }
}
