use crate::primitives::pager::NodeFormat;
use crate::types::{GbpTreeError, PageId, Result};

use super::super::gspp::{self, Generations, GSPP_LEN};
use super::super::page::{self, NodeKind, HEADER_LEN};
use super::{KeyCmp, LeafEntry, NodeCodec, Overflow};

/// Layout for fixed-length keys and values.
///
/// Leaves store `(key, value)` pairs back to back after the header. Internal
/// nodes store a key array sized for the node's capacity followed by the
/// child pointer pairs.
pub struct FixedNode {
    page_size: usize,
    key_size: usize,
    value_size: usize,
    max_leaf: usize,
    max_internal: usize,
    cmp: KeyCmp,
}

impl FixedNode {
    /// Builds the layout, failing when a page cannot hold enough entries to split.
    pub fn new(page_size: usize, key_size: usize, value_size: usize, cmp: KeyCmp) -> Result<Self> {
        if key_size == 0 {
            return Err(GbpTreeError::Invalid("fixed keys must not be empty"));
        }
        let usable = page_size.saturating_sub(HEADER_LEN);
        let max_leaf = usable / (key_size + value_size);
        let max_internal = usable.saturating_sub(GSPP_LEN) / (key_size + GSPP_LEN);
        if max_leaf < 2 || max_internal < 3 {
            return Err(GbpTreeError::Invalid(
                "page size too small for the key and value sizes",
            ));
        }
        Ok(Self {
            page_size,
            key_size,
            value_size,
            max_leaf,
            max_internal,
            cmp,
        })
    }

    /// Entries a leaf holds.
    pub fn leaf_capacity(&self) -> usize {
        self.max_leaf
    }

    /// Keys an internal node holds.
    pub fn internal_capacity(&self) -> usize {
        self.max_internal
    }

    fn entry_size(&self) -> usize {
        self.key_size + self.value_size
    }

    fn leaf_offset(&self, pos: usize) -> usize {
        HEADER_LEN + pos * self.entry_size()
    }

    fn key_offset(&self, pos: usize) -> usize {
        HEADER_LEN + pos * self.key_size
    }

    fn check_pos(&self, page: &[u8], pos: usize, inclusive: bool) -> Result<usize> {
        let count = self.key_count(page)?;
        let limit = if inclusive { count } else { count.saturating_sub(1) };
        if pos > limit || (!inclusive && count == 0) {
            return Err(GbpTreeError::Invalid("node position out of range"));
        }
        Ok(count)
    }

    fn check_len(&self, bytes: &[u8], expected: usize) -> Result<()> {
        if bytes.len() != expected {
            return Err(GbpTreeError::Invalid("encoded length differs from fixed size"));
        }
        Ok(())
    }
}

impl NodeCodec for FixedNode {
    fn format(&self) -> NodeFormat {
        NodeFormat::Fixed
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn comparator(&self) -> KeyCmp {
        self.cmp
    }

    fn max_key_count(&self, kind: NodeKind) -> usize {
        match kind {
            NodeKind::Leaf => self.max_leaf,
            NodeKind::Internal => self.max_internal,
        }
    }

    fn check_entry_size(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_len(key, self.key_size)?;
        self.check_len(value, self.value_size)
    }

    fn key_value_size_cap(&self) -> usize {
        self.key_size + self.value_size
    }

    fn reset_content(&self, _page: &mut [u8]) {}

    fn key_at<'p>(&self, page: &'p [u8], pos: usize) -> Result<&'p [u8]> {
        self.check_pos(page, pos, false)?;
        let off = if page::is_leaf(page) {
            self.leaf_offset(pos)
        } else {
            self.key_offset(pos)
        };
        Ok(&page[off..off + self.key_size])
    }

    fn value_at<'p>(&self, page: &'p [u8], pos: usize) -> Result<&'p [u8]> {
        self.check_pos(page, pos, false)?;
        let off = self.leaf_offset(pos) + self.key_size;
        Ok(&page[off..off + self.value_size])
    }

    fn child_offset(&self, pos: usize) -> usize {
        HEADER_LEN + self.max_internal * self.key_size + pos * GSPP_LEN
    }

    fn insert_key_value_at(
        &self,
        page: &mut [u8],
        pos: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.check_entry_size(key, value)?;
        let count = self.check_pos(page, pos, true)?;
        if count >= self.max_leaf {
            return Err(GbpTreeError::Invalid("leaf is full"));
        }
        let start = self.leaf_offset(pos);
        page.copy_within(start..self.leaf_offset(count), start + self.entry_size());
        page[start..start + self.key_size].copy_from_slice(key);
        page[start + self.key_size..start + self.entry_size()].copy_from_slice(value);
        page::set_key_count(page, count + 1);
        Ok(())
    }

    fn remove_key_value_at(&self, page: &mut [u8], pos: usize) -> Result<()> {
        let count = self.check_pos(page, pos, false)?;
        let start = self.leaf_offset(pos);
        page.copy_within(start + self.entry_size()..self.leaf_offset(count), start);
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
        self.check_len(key, self.key_size)?;
        let count = self.check_pos(page, pos, true)?;
        if count >= self.max_internal {
            return Err(GbpTreeError::Invalid("internal node is full"));
        }
        let key_start = self.key_offset(pos);
        page.copy_within(key_start..self.key_offset(count), key_start + self.key_size);
        page[key_start..key_start + self.key_size].copy_from_slice(key);
        let child_start = self.child_offset(pos + 1);
        page.copy_within(
            child_start..self.child_offset(count + 1),
            child_start + GSPP_LEN,
        );
        gspp::clear(page, child_start);
        gspp::write(page, child_start, child, gens)?;
        page::set_key_count(page, count + 1);
        Ok(())
    }

    fn remove_key_and_right_child_at(&self, page: &mut [u8], pos: usize) -> Result<()> {
        let count = self.check_pos(page, pos, false)?;
        let key_start = self.key_offset(pos);
        page.copy_within(key_start + self.key_size..self.key_offset(count), key_start);
        let child_start = self.child_offset(pos + 1);
        page.copy_within(
            child_start + GSPP_LEN..self.child_offset(count + 1),
            child_start,
        );
        page::set_key_count(page, count - 1);
        Ok(())
    }

    fn remove_key_and_left_child_at(&self, page: &mut [u8], pos: usize) -> Result<()> {
        let count = self.check_pos(page, pos, false)?;
        let key_start = self.key_offset(pos);
        page.copy_within(key_start + self.key_size..self.key_offset(count), key_start);
        let child_start = self.child_offset(pos);
        page.copy_within(
            child_start + GSPP_LEN..self.child_offset(count + 1),
            child_start,
        );
        page::set_key_count(page, count - 1);
        Ok(())
    }

    fn leaf_overflow(&self, page: &[u8], _key: &[u8], _value: &[u8]) -> Result<Overflow> {
        Ok(if self.key_count(page)? < self.max_leaf {
            Overflow::No
        } else {
            Overflow::Yes
        })
    }

    fn internal_overflow(&self, page: &[u8], _key: &[u8]) -> Result<Overflow> {
        Ok(if self.key_count(page)? < self.max_internal {
            Overflow::No
        } else {
            Overflow::Yes
        })
    }

    fn leaf_entry_size(&self, _key: &[u8], _value: &[u8]) -> usize {
        self.entry_size()
    }

    fn internal_key_size(&self, _key: &[u8]) -> usize {
        self.key_size + GSPP_LEN
    }

    fn leaf_fits(&self, entries: &[LeafEntry]) -> bool {
        entries.len() <= self.max_leaf
    }

    fn leaf_underflows(&self, entries: &[LeafEntry]) -> bool {
        entries.len() * 2 < self.max_leaf
    }

    fn internal_fits(&self, keys: &[Vec<u8>]) -> bool {
        keys.len() <= self.max_internal
    }

    fn internal_underflows(&self, keys: &[Vec<u8>]) -> bool {
        keys.len() < self.max_internal / 2
    }

    fn write_leaf(&self, page: &mut [u8], entries: &[LeafEntry]) -> Result<()> {
        if !self.leaf_fits(entries) {
            return Err(GbpTreeError::Invalid("entries exceed leaf capacity"));
        }
        for (pos, (key, value)) in entries.iter().enumerate() {
            self.check_entry_size(key, value)?;
            let start = self.leaf_offset(pos);
            page[start..start + self.key_size].copy_from_slice(key);
            page[start + self.key_size..start + self.entry_size()].copy_from_slice(value);
        }
        page[self.leaf_offset(entries.len())..].fill(0);
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
        for (pos, key) in keys.iter().enumerate() {
            self.check_len(key, self.key_size)?;
            let start = self.key_offset(pos);
            page[start..start + self.key_size].copy_from_slice(key);
        }
        for (pos, child) in children.iter().enumerate() {
            gspp::write(page, self.child_offset(pos), *child, gens)?;
        }
        page::set_key_count(page, keys.len());
        Ok(())
    }

    fn check_meta(&self, page: &[u8]) -> Vec<&'static str> {
        match self.key_count(page) {
            Ok(_) => Vec::new(),
            Err(_) => vec!["key count exceeds node capacity"],
        }
    }
}
