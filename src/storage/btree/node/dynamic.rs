use crate::primitives::bytes::be;
use crate::primitives::pager::NodeFormat;
use crate::types::{GbpTreeError, PageId, Result};

use super::super::gspp::{self, Generations, GSPP_LEN};
use super::super::page::{self, NodeKind, ALLOC_OFFSET, DEAD_SPACE, HEADER_LEN};
use super::{KeyCmp, LeafEntry, NodeCodec, Overflow};

const OFFSET_LEN: usize = 2;
const LEAF_ENTRY_HEAD: usize = 4;
const KEY_ENTRY_HEAD: usize = 2;
const TOMBSTONE: u16 = 0x8000;
const LEN_MASK: u16 = !TOMBSTONE;
const FIRST_CHILD: usize = HEADER_LEN;
const RECORDS: usize = FIRST_CHILD + GSPP_LEN;
const RECORD_LEN: usize = OFFSET_LEN + GSPP_LEN;

/// Layout for variable-length keys and values.
///
/// ```text
/// leaf:     header | offsets (u16 each) ->   free   <- heap entries
///           entry = klen u16 | vlen u16 | key | value
/// internal: header | child 0 | (offset u16, child i+1)* -> free <- key entries
///           entry = klen u16 | key
/// ```
///
/// Removed entries stay in the heap with the tombstone bit set on their key
/// length and are counted as dead space until the node is compacted.
pub struct DynamicNode {
    page_size: usize,
    cmp: KeyCmp,
}

impl DynamicNode {
    /// Builds the layout for `page_size`.
    pub fn new(page_size: usize, cmp: KeyCmp) -> Result<Self> {
        if page_size < 256 || page_size > u16::MAX as usize + 1 {
            return Err(GbpTreeError::Invalid("page size unsupported by dynamic layout"));
        }
        Ok(Self { page_size, cmp })
    }

    fn leaf_capacity(&self) -> usize {
        self.page_size - HEADER_LEN
    }

    fn internal_capacity(&self) -> usize {
        self.page_size - RECORDS
    }

    /// Largest leaf entry, offset slot included.
    pub fn max_leaf_entry(&self) -> usize {
        self.leaf_capacity() / 2
    }

    /// Largest internal key cost, record included.
    pub fn max_internal_entry(&self) -> usize {
        self.internal_capacity() / 2
    }

    fn alloc(&self, page: &[u8]) -> usize {
        be::get_u16(page, ALLOC_OFFSET) as usize
    }

    fn set_alloc(&self, page: &mut [u8], value: usize) {
        be::put_u16(page, ALLOC_OFFSET, value as u16);
    }

    fn dead(&self, page: &[u8]) -> usize {
        be::get_u16(page, DEAD_SPACE) as usize
    }

    fn set_dead(&self, page: &mut [u8], value: usize) {
        be::put_u16(page, DEAD_SPACE, value as u16);
    }

    fn array_end(page: &[u8], count: usize) -> usize {
        if page::is_leaf(page) {
            HEADER_LEN + count * OFFSET_LEN
        } else {
            RECORDS + count * RECORD_LEN
        }
    }

    fn offset_slot(page: &[u8], pos: usize) -> usize {
        if page::is_leaf(page) {
            HEADER_LEN + pos * OFFSET_LEN
        } else {
            RECORDS + pos * RECORD_LEN
        }
    }

    fn free_space(&self, page: &[u8]) -> Result<usize> {
        let count = self.key_count(page)?;
        self.alloc(page)
            .checked_sub(Self::array_end(page, count))
            .ok_or(GbpTreeError::Corruption("heap overlaps offset array"))
    }

    fn entry_offset(&self, page: &[u8], pos: usize) -> Result<usize> {
        let count = self.key_count(page)?;
        if pos >= count {
            return Err(GbpTreeError::Invalid("node position out of range"));
        }
        let off = be::get_u16(page, Self::offset_slot(page, pos)) as usize;
        if off < self.alloc(page) || off + KEY_ENTRY_HEAD > self.page_size {
            return Err(GbpTreeError::Corruption("entry offset outside heap"));
        }
        Ok(off)
    }

    /// Heap bytes of the entry at `off`, bounds checked.
    fn heap_entry_len(&self, page: &[u8], off: usize) -> Option<usize> {
        let klen = (be::get_u16(page, off) & LEN_MASK) as usize;
        let len = if page::is_leaf(page) {
            if off + LEAF_ENTRY_HEAD > self.page_size {
                return None;
            }
            LEAF_ENTRY_HEAD + klen + be::get_u16(page, off + 2) as usize
        } else {
            KEY_ENTRY_HEAD + klen
        };
        (off + len <= self.page_size).then_some(len)
    }

    fn push_heap(&self, page: &mut [u8], head: &[u16], body: &[&[u8]]) -> usize {
        let len = head.len() * 2 + body.iter().map(|b| b.len()).sum::<usize>();
        let start = self.alloc(page) - len;
        let mut cursor = start;
        for value in head {
            be::put_u16(page, cursor, *value);
            cursor += 2;
        }
        for bytes in body {
            page[cursor..cursor + bytes.len()].copy_from_slice(bytes);
            cursor += bytes.len();
        }
        self.set_alloc(page, start);
        start
    }

    fn bury(&self, page: &mut [u8], off: usize) -> Result<()> {
        let len = self
            .heap_entry_len(page, off)
            .ok_or(GbpTreeError::Corruption("entry extends past page end"))?;
        let klen = be::get_u16(page, off);
        be::put_u16(page, off, klen | TOMBSTONE);
        let dead = self.dead(page) + len;
        self.set_dead(page, dead);
        Ok(())
    }

    fn make_room(&self, page: &mut [u8], needed: usize) -> Result<()> {
        let free = self.free_space(page)?;
        if needed <= free {
            return Ok(());
        }
        if needed <= free + self.dead(page) {
            return self.defragment(page);
        }
        Err(GbpTreeError::Invalid("entry does not fit in node"))
    }

    fn records(&self, page: &[u8]) -> Result<(Vec<usize>, Vec<[u8; GSPP_LEN]>)> {
        let count = self.key_count(page)?;
        let mut offsets = Vec::with_capacity(count);
        let mut pairs = Vec::with_capacity(count + 1);
        let mut first = [0u8; GSPP_LEN];
        first.copy_from_slice(&page[FIRST_CHILD..FIRST_CHILD + GSPP_LEN]);
        pairs.push(first);
        for pos in 0..count {
            let slot = RECORDS + pos * RECORD_LEN;
            offsets.push(be::get_u16(page, slot) as usize);
            let mut pair = [0u8; GSPP_LEN];
            pair.copy_from_slice(&page[slot + OFFSET_LEN..slot + RECORD_LEN]);
            pairs.push(pair);
        }
        Ok((offsets, pairs))
    }

    fn store_records(&self, page: &mut [u8], offsets: &[usize], pairs: &[[u8; GSPP_LEN]]) {
        page[FIRST_CHILD..FIRST_CHILD + GSPP_LEN].copy_from_slice(&pairs[0]);
        for (pos, off) in offsets.iter().enumerate() {
            let slot = RECORDS + pos * RECORD_LEN;
            be::put_u16(page, slot, *off as u16);
            page[slot + OFFSET_LEN..slot + RECORD_LEN].copy_from_slice(&pairs[pos + 1]);
        }
        page::set_key_count(page, offsets.len());
    }

    fn remove_internal(&self, page: &mut [u8], pos: usize, child: usize) -> Result<()> {
        let (mut offsets, mut pairs) = self.records(page)?;
        if pos >= offsets.len() {
            return Err(GbpTreeError::Invalid("node position out of range"));
        }
        let off = self.entry_offset(page, pos)?;
        self.bury(page, off)?;
        offsets.remove(pos);
        pairs.remove(child);
        self.store_records(page, &offsets, &pairs);
        let stale = RECORDS + offsets.len() * RECORD_LEN;
        page[stale..stale + RECORD_LEN].fill(0);
        Ok(())
    }
}

impl NodeCodec for DynamicNode {
    fn format(&self) -> NodeFormat {
        NodeFormat::Dynamic
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn comparator(&self) -> KeyCmp {
        self.cmp
    }

    fn max_key_count(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => self.leaf_capacity() / (OFFSET_LEN + LEAF_ENTRY_HEAD),
            NodeKind::Internal => self.internal_capacity() / (RECORD_LEN + KEY_ENTRY_HEAD),
        }
    }

    fn check_entry_size(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.leaf_entry_size(key, value) > self.max_leaf_entry()
            || self.internal_key_size(key) > self.max_internal_entry()
        {
            return Err(GbpTreeError::Invalid("entry too large for page size"));
        }
        Ok(())
    }

    fn key_value_size_cap(&self) -> usize {
        let leaf = self.max_leaf_entry() - OFFSET_LEN - LEAF_ENTRY_HEAD;
        let internal = self.max_internal_entry() - RECORD_LEN - KEY_ENTRY_HEAD;
        leaf.min(internal)
    }

    fn reset_content(&self, page: &mut [u8]) {
        self.set_alloc(page, self.page_size);
        self.set_dead(page, 0);
    }

    fn key_at<'p>(&self, page: &'p [u8], pos: usize) -> Result<&'p [u8]> {
        let off = self.entry_offset(page, pos)?;
        let klen = be::get_u16(page, off);
        if klen & TOMBSTONE != 0 {
            return Err(GbpTreeError::Corruption("live offset points at a removed entry"));
        }
        let head = if page::is_leaf(page) {
            LEAF_ENTRY_HEAD
        } else {
            KEY_ENTRY_HEAD
        };
        self.heap_entry_len(page, off)
            .ok_or(GbpTreeError::Corruption("entry extends past page end"))?;
        let start = off + head;
        Ok(&page[start..start + klen as usize])
    }

    fn value_at<'p>(&self, page: &'p [u8], pos: usize) -> Result<&'p [u8]> {
        let off = self.entry_offset(page, pos)?;
        let len = self
            .heap_entry_len(page, off)
            .ok_or(GbpTreeError::Corruption("entry extends past page end"))?;
        let klen = (be::get_u16(page, off) & LEN_MASK) as usize;
        Ok(&page[off + LEAF_ENTRY_HEAD + klen..off + len])
    }

    fn child_offset(&self, pos: usize) -> usize {
        if pos == 0 {
            FIRST_CHILD
        } else {
            RECORDS + (pos - 1) * RECORD_LEN + OFFSET_LEN
        }
    }

    fn insert_key_value_at(
        &self,
        page: &mut [u8],
        pos: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.check_entry_size(key, value)?;
        let count = self.key_count(page)?;
        if pos > count {
            return Err(GbpTreeError::Invalid("node position out of range"));
        }
        self.make_room(page, self.leaf_entry_size(key, value))?;
        let off = self.push_heap(page, &[key.len() as u16, value.len() as u16], &[key, value]);
        let slot = HEADER_LEN + pos * OFFSET_LEN;
        page.copy_within(slot..HEADER_LEN + count * OFFSET_LEN, slot + OFFSET_LEN);
        be::put_u16(page, slot, off as u16);
        page::set_key_count(page, count + 1);
        Ok(())
    }

    fn remove_key_value_at(&self, page: &mut [u8], pos: usize) -> Result<()> {
        let off = self.entry_offset(page, pos)?;
        let count = self.key_count(page)?;
        self.bury(page, off)?;
        let slot = HEADER_LEN + pos * OFFSET_LEN;
        page.copy_within(slot + OFFSET_LEN..HEADER_LEN + count * OFFSET_LEN, slot);
        page::set_key_count(page, count - 1);
        Ok(())
    }

    fn insert_key_and_right_child_at(
        &self,
        page: &mut [u8],
        pos: usize,
        key: &[u8],
        child: PageId,
        gens: Generations,
    ) -> Result<()> {
        if self.internal_key_size(key) > self.max_internal_entry() {
            return Err(GbpTreeError::Invalid("key too large for page size"));
        }
        let count = self.key_count(page)?;
        if pos > count {
            return Err(GbpTreeError::Invalid("node position out of range"));
        }
        self.make_room(page, self.internal_key_size(key))?;
        let off = self.push_heap(page, &[key.len() as u16], &[key]);
        let slot = RECORDS + pos * RECORD_LEN;
        page.copy_within(slot..RECORDS + count * RECORD_LEN, slot + RECORD_LEN);
        be::put_u16(page, slot, off as u16);
        gspp::clear(page, slot + OFFSET_LEN);
        gspp::write(page, slot + OFFSET_LEN, child, gens)?;
        page::set_key_count(page, count + 1);
        Ok(())
    }

    fn remove_key_and_right_child_at(&self, page: &mut [u8], pos: usize) -> Result<()> {
        self.remove_internal(page, pos, pos + 1)
    }

    fn remove_key_and_left_child_at(&self, page: &mut [u8], pos: usize) -> Result<()> {
        self.remove_internal(page, pos, pos)
    }

    fn leaf_overflow(&self, page: &[u8], key: &[u8], value: &[u8]) -> Result<Overflow> {
        let needed = self.leaf_entry_size(key, value);
        let free = self.free_space(page)?;
        Ok(if needed <= free {
            Overflow::No
        } else if needed <= free + self.dead(page) {
            Overflow::NoNeedDefrag
        } else {
            Overflow::Yes
        })
    }

    fn internal_overflow(&self, page: &[u8], key: &[u8]) -> Result<Overflow> {
        let needed = self.internal_key_size(key);
        let free = self.free_space(page)?;
        Ok(if needed <= free {
            Overflow::No
        } else if needed <= free + self.dead(page) {
            Overflow::NoNeedDefrag
        } else {
            Overflow::Yes
        })
    }

    fn leaf_entry_size(&self, key: &[u8], value: &[u8]) -> usize {
        OFFSET_LEN + LEAF_ENTRY_HEAD + key.len() + value.len()
    }

    fn internal_key_size(&self, key: &[u8]) -> usize {
        RECORD_LEN + KEY_ENTRY_HEAD + key.len()
    }

    fn leaf_fits(&self, entries: &[LeafEntry]) -> bool {
        let used: usize = entries.iter().map(|(k, v)| self.leaf_entry_size(k, v)).sum();
        used <= self.leaf_capacity()
    }

    fn leaf_underflows(&self, entries: &[LeafEntry]) -> bool {
        let used: usize = entries.iter().map(|(k, v)| self.leaf_entry_size(k, v)).sum();
        used < self.leaf_capacity() / 2
    }

    fn internal_fits(&self, keys: &[Vec<u8>]) -> bool {
        let used: usize = keys.iter().map(|k| self.internal_key_size(k)).sum();
        used <= self.internal_capacity()
    }

    fn internal_underflows(&self, keys: &[Vec<u8>]) -> bool {
        let used: usize = keys.iter().map(|k| self.internal_key_size(k)).sum();
        used * 4 < self.internal_capacity()
    }

    fn write_leaf(&self, page: &mut [u8], entries: &[LeafEntry]) -> Result<()> {
        if !self.leaf_fits(entries) {
            return Err(GbpTreeError::Invalid("entries exceed leaf capacity"));
        }
        page[HEADER_LEN..].fill(0);
        self.reset_content(page);
        for (pos, (key, value)) in entries.iter().enumerate() {
            let off =
                self.push_heap(page, &[key.len() as u16, value.len() as u16], &[key, value]);
            be::put_u16(page, HEADER_LEN + pos * OFFSET_LEN, off as u16);
        }
        page::set_key_count(page, entries.len());
        Ok(())
    }

    fn write_internal(
        &self,
        page: &mut [u8],
        keys: &[Vec<u8>],
        children: &[PageId],
        gens: Generations,
    ) -> Result<()> {
        if !self.internal_fits(keys) || children.len() != keys.len() + 1 {
            return Err(GbpTreeError::Invalid("internal content does not fit"));
        }
        page[HEADER_LEN..].fill(0);
        self.reset_content(page);
        gspp::write(page, FIRST_CHILD, children[0], gens)?;
        for (pos, key) in keys.iter().enumerate() {
            let off = self.push_heap(page, &[key.len() as u16], &[key]);
            let slot = RECORDS + pos * RECORD_LEN;
            be::put_u16(page, slot, off as u16);
            gspp::write(page, slot + OFFSET_LEN, children[pos + 1], gens)?;
        }
        page::set_key_count(page, keys.len());
        Ok(())
    }

    fn defragment(&self, page: &mut [u8]) -> Result<()> {
        let count = self.key_count(page)?;
        let mut live = Vec::with_capacity(count);
        for pos in 0..count {
            let off = self.entry_offset(page, pos)?;
            let len = self
                .heap_entry_len(page, off)
                .ok_or(GbpTreeError::Corruption("entry extends past page end"))?;
            live.push(page[off..off + len].to_vec());
        }
        let array_end = Self::array_end(page, count);
        page[array_end..].fill(0);
        self.reset_content(page);
        for (pos, entry) in live.iter().enumerate() {
            let start = self.alloc(page) - entry.len();
            page[start..start + entry.len()].copy_from_slice(entry);
            self.set_alloc(page, start);
            be::put_u16(page, Self::offset_slot(page, pos), start as u16);
        }
        Ok(())
    }

    fn check_meta(&self, page: &[u8]) -> Vec<&'static str> {
        let mut problems = Vec::new();
        let count = match self.key_count(page) {
            Ok(count) => count,
            Err(_) => return vec!["key count exceeds node capacity"],
        };
        let alloc = self.alloc(page);
        if alloc > self.page_size {
            problems.push("allocation offset beyond page end");
            return problems;
        }
        if alloc < Self::array_end(page, count) {
            problems.push("allocation offset inside offset array");
        }
        let mut live = 0usize;
        for pos in 0..count {
            let off = be::get_u16(page, Self::offset_slot(page, pos)) as usize;
            if off < alloc || off + KEY_ENTRY_HEAD > self.page_size {
                problems.push("entry offset outside heap");
                return problems;
            }
            if be::get_u16(page, off) & TOMBSTONE != 0 {
                problems.push("live offset points at a removed entry");
            }
            match self.heap_entry_len(page, off) {
                Some(len) => live += len,
                None => {
                    problems.push("entry extends past page end");
                    return problems;
                }
            }
        }
        if self.page_size - alloc != self.dead(page) + live {
            problems.push("dead space does not match heap usage");
        }
        problems
    }

    fn set_value_at(&self, page: &mut [u8], pos: usize, value: &[u8]) -> Result<bool> {
        if self.value_at(page, pos)?.len() == value.len() {
            let off = self.entry_offset(page, pos)?;
            let start = off + LEAF_ENTRY_HEAD + (be::get_u16(page, off) & LEN_MASK) as usize;
            page[start..start + value.len()].copy_from_slice(value);
            return Ok(true);
        }
        let mut entries = self.leaf_entries(page)?;
        if let Some(slot) = entries.get_mut(pos) {
            slot.1 = value.to_vec();
        }
        if entries.iter().any(|(k, v)| self.check_entry_size(k, v).is_err())
            || !self.leaf_fits(&entries)
        {
            return Ok(false);
        }
        self.write_leaf(page, &entries)?;
        Ok(true)
    }

    fn set_key_at(
        &self,
        page: &mut [u8],
        pos: usize,
        key: &[u8],
        _id: PageId,
        _gens: Generations,
    ) -> Result<bool> {
        if self.key_at(page, pos)?.len() == key.len() {
            let off = self.entry_offset(page, pos)? + KEY_ENTRY_HEAD;
            page[off..off + key.len()].copy_from_slice(key);
            return Ok(true);
        }
        if self.internal_key_size(key) > self.max_internal_entry() {
            return Ok(false);
        }
        // Pointer pairs are carried over byte for byte so older slots survive.
        let (mut offsets, pairs) = self.records(page)?;
        let mut keys = self.internal_keys(page)?;
        keys[pos] = key.to_vec();
        if !self.internal_fits(&keys) {
            return Ok(false);
        }
        page[HEADER_LEN..].fill(0);
        self.reset_content(page);
        for (slot, key) in offsets.iter_mut().zip(&keys) {
            *slot = self.push_heap(page, &[key.len() as u16], &[key]);
        }
        self.store_records(page, &offsets, &pairs);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        a.cmp(b)
    }

    fn gens() -> Generations {
        Generations::new(1, 2).unwrap()
    }

    fn leaf(node: &DynamicNode) -> Vec<u8> {
        let mut page = vec![0u8; node.page_size()];
        node.initialize_leaf(&mut page, gens());
        page
    }

    #[test]
    fn size_cap_bounds_accepted_entries() -> Result<()> {
        let node = DynamicNode::new(512, cmp)?;
        let cap = node.key_value_size_cap();
        assert!(cap > 0);
        node.check_entry_size(&vec![1u8; cap], &[])?;
        node.check_entry_size(&[1], &vec![0u8; cap - 1])?;
        assert!(node.check_entry_size(&vec![1u8; cap + 1], &[]).is_err());
        Ok(())
    }

    #[test]
    fn variable_entries_round_trip() -> Result<()> {
        let node = DynamicNode::new(512, cmp)?;
        let mut page = leaf(&node);
        for key in ["pear", "apple", "fig", "banana"] {
            let (pos, _) = node.search(&page, key.as_bytes())?;
            node.insert_key_value_at(&mut page, pos, key.as_bytes(), &key.as_bytes()[..2])?;
        }
        let keys: Vec<_> = node
            .leaf_entries(&page)?
            .into_iter()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect();
        assert_eq!(keys, ["apple", "banana", "fig", "pear"]);
        assert_eq!(node.value_at(&page, 2)?, b"fi");
        assert!(node.check_meta(&page).is_empty());
        Ok(())
    }

    #[test]
    fn removal_leaves_dead_space_until_compaction() -> Result<()> {
        let node = DynamicNode::new(256, cmp)?;
        let mut page = leaf(&node);
        let value = vec![7u8; 30];
        let mut n = 0u8;
        while node.leaf_overflow(&page, &[n], &value)? == Overflow::No {
            node.insert_key_value_at(&mut page, n as usize, &[n], &value)?;
            n += 1;
        }
        node.remove_key_value_at(&mut page, 0)?;
        assert!(node.check_meta(&page).is_empty());
        assert_eq!(node.leaf_overflow(&page, &[200], &value)?, Overflow::NoNeedDefrag);
        node.insert_key_value_at(&mut page, n as usize - 1, &[200], &value)?;
        assert!(node.check_meta(&page).is_empty());
        assert_eq!(node.key_at(&page, n as usize - 1)?, &[200]);
        assert_eq!(node.key_at(&page, 0)?, &[1]);
        Ok(())
    }

    #[test]
    fn oversized_entries_are_rejected() -> Result<()> {
        let node = DynamicNode::new(256, cmp)?;
        let mut page = leaf(&node);
        let big = vec![1u8; 200];
        assert!(node.check_entry_size(b"k", &big).is_err());
        assert!(node.insert_key_value_at(&mut page, 0, b"k", &big).is_err());
        Ok(())
    }

    #[test]
    fn internal_records_shift_with_children() -> Result<()> {
        let node = DynamicNode::new(512, cmp)?;
        let g = gens();
        let mut page = vec![0u8; 512];
        node.initialize_internal(&mut page, g);
        node.write_internal(&mut page, &[b"m".to_vec()], &[PageId(10), PageId(11)], g)?;
        node.insert_key_and_right_child_at(&mut page, 0, b"c", PageId(12), g)?;
        node.insert_key_and_right_child_at(&mut page, 2, b"x", PageId(13), g)?;
        assert_eq!(
            node.internal_keys(&page)?,
            vec![b"c".to_vec(), b"m".to_vec(), b"x".to_vec()]
        );
        assert_eq!(
            node.internal_children(&page, PageId(1), g)?,
            vec![PageId(10), PageId(12), PageId(11), PageId(13)]
        );
        node.remove_key_and_left_child_at(&mut page, 0)?;
        assert_eq!(
            node.internal_children(&page, PageId(1), g)?,
            vec![PageId(12), PageId(11), PageId(13)]
        );
        assert!(node.set_key_at(&mut page, 0, b"longer", PageId(1), g)?);
        assert_eq!(node.key_at(&page, 0)?, b"longer");
        assert_eq!(
            node.internal_children(&page, PageId(1), g)?,
            vec![PageId(12), PageId(11), PageId(13)]
        );
        assert!(node.check_meta(&page).is_empty());
        Ok(())
    }

    #[test]
    fn corrupted_offsets_are_reported() -> Result<()> {
        let node = DynamicNode::new(256, cmp)?;
        let mut page = leaf(&node);
        node.insert_key_value_at(&mut page, 0, b"a", b"1")?;
        be::put_u16(&mut page, HEADER_LEN, 20);
        assert!(!node.check_meta(&page).is_empty());
        assert!(node.key_at(&page, 0).is_err());
        Ok(())
    }

    #[test]
    fn same_length_value_updates_in_place() -> Result<()> {
        let node = DynamicNode::new(256, cmp)?;
        let mut page = leaf(&node);
        node.insert_key_value_at(&mut page, 0, b"a", b"one")?;
        let alloc = node.alloc(&page);
        assert!(node.set_value_at(&mut page, 0, b"two")?);
        assert_eq!(node.alloc(&page), alloc);
        assert!(node.set_value_at(&mut page, 0, b"three")?);
        assert_eq!(node.value_at(&page, 0)?, b"three");
        Ok(())
    }
}
