//! Node codecs: the byte layout of leaf and internal pages.
//!
//! Two layouts implement [`NodeCodec`]: [`FixedNode`] when every key and
//! value has the same encoded length, and [`DynamicNode`] otherwise. The
//! layout is picked once when the tree is opened. Codecs operate on encoded
//! key and value bytes; ordering comes from the key codec's comparator.

use std::cmp::Ordering;

use crate::primitives::pager::NodeFormat;
use crate::types::{GbpTreeError, PageId, Result};

use super::gspp::{self, Generations, Pointer, PointerFault};
use super::page::{self, NodeKind};

mod dynamic;
mod fixed;

pub use dynamic::DynamicNode;
pub use fixed::FixedNode;

/// Orders two encoded keys.
pub type KeyCmp = fn(&[u8], &[u8]) -> Ordering;

/// An encoded key and its encoded value.
pub type LeafEntry = (Vec<u8>, Vec<u8>);

/// Whether one more entry fits into a node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Overflow {
    /// The entry does not fit.
    Yes,
    /// The entry fits in free space.
    No,
    /// The entry fits once dead space is reclaimed.
    NoNeedDefrag,
}

/// Byte-level operations on one node layout.
///
/// Positions are validated against the node's key count. Mutating methods
/// expect the caller to have checked space with the overflow predicates.
pub trait NodeCodec: Send + Sync {
    /// Layout identifier persisted in the file metadata.
    fn format(&self) -> NodeFormat;

    /// Page size the codec was built for.
    fn page_size(&self) -> usize;

    /// Key comparator.
    fn comparator(&self) -> KeyCmp;

    /// Upper bound on keys a node of `kind` can hold.
    fn max_key_count(&self, kind: NodeKind) -> usize;

    /// Rejects entries too large for this layout.
    fn check_entry_size(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Largest combined key and value length that is accepted whatever the
    /// split between the two.
    fn key_value_size_cap(&self) -> usize;

    /// Resets layout-specific bookkeeping after the header was initialised.
    fn reset_content(&self, page: &mut [u8]);

    /// Encoded key at `pos`.
    fn key_at<'p>(&self, page: &'p [u8], pos: usize) -> Result<&'p [u8]>;

    /// Encoded value at `pos` of a leaf.
    fn value_at<'p>(&self, page: &'p [u8], pos: usize) -> Result<&'p [u8]>;

    /// Byte offset of child pointer pair `pos` of an internal node.
    fn child_offset(&self, pos: usize) -> usize;

    /// Inserts a leaf entry at `pos`, shifting later entries.
    fn insert_key_value_at(&self, page: &mut [u8], pos: usize, key: &[u8], value: &[u8])
        -> Result<()>;

    /// Removes the leaf entry at `pos`.
    fn remove_key_value_at(&self, page: &mut [u8], pos: usize) -> Result<()>;

    /// Inserts `key` at `pos` of an internal node together with `child` as its right child.
    fn insert_key_and_right_child_at(
        &self,
        page: &mut [u8],
        pos: usize,
        key: &[u8],
        child: PageId,
        gens: Generations,
    ) -> Result<()>;

    /// Removes key `pos` and child `pos + 1`.
    fn remove_key_and_right_child_at(&self, page: &mut [u8], pos: usize) -> Result<()>;

    /// Removes key `pos` and child `pos`.
    fn remove_key_and_left_child_at(&self, page: &mut [u8], pos: usize) -> Result<()>;

    /// Predicts whether a leaf entry fits.
    fn leaf_overflow(&self, page: &[u8], key: &[u8], value: &[u8]) -> Result<Overflow>;

    /// Predicts whether an internal key plus child fits.
    fn internal_overflow(&self, page: &[u8], key: &[u8]) -> Result<Overflow>;

    /// Bytes a leaf entry consumes, used to pick split points.
    fn leaf_entry_size(&self, key: &[u8], value: &[u8]) -> usize;

    /// Bytes an internal key and its right child consume.
    fn internal_key_size(&self, key: &[u8]) -> usize;

    /// Whether `entries` fit into one leaf.
    fn leaf_fits(&self, entries: &[LeafEntry]) -> bool;

    /// Whether a leaf holding `entries` is under-full.
    fn leaf_underflows(&self, entries: &[LeafEntry]) -> bool;

    /// Whether `keys` fit into one internal node.
    fn internal_fits(&self, keys: &[Vec<u8>]) -> bool;

    /// Whether an internal node holding `keys` is under-full.
    fn internal_underflows(&self, keys: &[Vec<u8>]) -> bool;

    /// Replaces the leaf content with `entries`, keeping the header.
    fn write_leaf(&self, page: &mut [u8], entries: &[LeafEntry]) -> Result<()>;

    /// Replaces the internal content, keeping the header. Child pointers are
    /// rewritten in the unstable generation.
    fn write_internal(
        &self,
        page: &mut [u8],
        keys: &[Vec<u8>],
        children: &[PageId],
        gens: Generations,
    ) -> Result<()>;

    /// Reclaims dead heap space. A no-op for layouts without a heap.
    fn defragment(&self, _page: &mut [u8]) -> Result<()> {
        Ok(())
    }

    /// Layout bookkeeping problems, empty when the node is sound.
    fn check_meta(&self, page: &[u8]) -> Vec<&'static str>;

    /// Initialises `page` as an empty leaf in the unstable generation.
    fn initialize_leaf(&self, page: &mut [u8], gens: Generations) {
        page::initialize(page, NodeKind::Leaf, gens);
        self.reset_content(page);
    }

    /// Initialises `page` as an empty internal node in the unstable generation.
    fn initialize_internal(&self, page: &mut [u8], gens: Generations) {
        page::initialize(page, NodeKind::Internal, gens);
        self.reset_content(page);
    }

    /// Key count, validated against the layout's capacity.
    fn key_count(&self, page: &[u8]) -> Result<usize> {
        let kind = page::node_kind(page)?;
        let count = page::key_count(page);
        if count > self.max_key_count(kind) {
            return Err(GbpTreeError::Corruption("key count exceeds node capacity"));
        }
        Ok(count)
    }

    /// Resolves child pointer `pos`.
    fn child_at(
        &self,
        page: &[u8],
        pos: usize,
        gens: Generations,
    ) -> std::result::Result<Pointer, PointerFault> {
        gspp::read(page, self.child_offset(pos), gens)
    }

    /// Points child `pos` at `child` in the unstable generation.
    fn set_child_at(&self, page: &mut [u8], pos: usize, child: PageId, gens: Generations) -> Result<()> {
        gspp::write(page, self.child_offset(pos), child, gens)
    }

    /// Binary search for `key`: `(pos, true)` on an exact match, otherwise the
    /// position the key would be inserted at.
    fn search(&self, page: &[u8], key: &[u8]) -> Result<(usize, bool)> {
        let cmp = self.comparator();
        let mut lo = 0usize;
        let mut hi = self.key_count(page)?;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match cmp(self.key_at(page, mid)?, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok((mid, true)),
            }
        }
        Ok((lo, false))
    }

    /// Child index to descend into when looking for `key`: keys equal to a
    /// separator live in its right subtree.
    fn child_index(&self, page: &[u8], key: &[u8]) -> Result<usize> {
        let (pos, hit) = self.search(page, key)?;
        Ok(if hit { pos + 1 } else { pos })
    }

    /// All entries of a leaf.
    fn leaf_entries(&self, page: &[u8]) -> Result<Vec<LeafEntry>> {
        let count = self.key_count(page)?;
        let mut entries = Vec::with_capacity(count);
        for pos in 0..count {
            entries.push((
                self.key_at(page, pos)?.to_vec(),
                self.value_at(page, pos)?.to_vec(),
            ));
        }
        Ok(entries)
    }

    /// All keys of an internal node.
    fn internal_keys(&self, page: &[u8]) -> Result<Vec<Vec<u8>>> {
        let count = self.key_count(page)?;
        (0..count)
            .map(|pos| self.key_at(page, pos).map(<[u8]>::to_vec))
            .collect()
    }

    /// All children of an internal node. An unresolvable pointer is reported
    /// as a tree inconsistency.
    fn internal_children(&self, page: &[u8], id: PageId, gens: Generations) -> Result<Vec<PageId>> {
        let count = self.key_count(page)?;
        (0..=count)
            .map(|pos| match self.child_at(page, pos, gens) {
                Ok(ptr) if !ptr.is_null() => Ok(ptr.id),
                Ok(_) => Err(GbpTreeError::inconsistent(id, "null child pointer")),
                Err(fault) => Err(GbpTreeError::inconsistent(
                    id,
                    &format!("unreadable child pointer {pos}: {fault:?}"),
                )),
            })
            .collect()
    }

    /// Replaces the value at `pos`. Returns `false` when the new value does not fit.
    fn set_value_at(&self, page: &mut [u8], pos: usize, value: &[u8]) -> Result<bool> {
        let mut entries = self.leaf_entries(page)?;
        let slot = entries
            .get_mut(pos)
            .ok_or(GbpTreeError::Invalid("value position out of range"))?;
        slot.1 = value.to_vec();
        if !self.leaf_fits(&entries) {
            return Ok(false);
        }
        self.write_leaf(page, &entries)?;
        Ok(true)
    }

    /// Replaces separator `pos`. Returns `false` when the new key does not fit.
    fn set_key_at(
        &self,
        page: &mut [u8],
        pos: usize,
        key: &[u8],
        id: PageId,
        gens: Generations,
    ) -> Result<bool> {
        let mut keys = self.internal_keys(page)?;
        let children = self.internal_children(page, id, gens)?;
        let slot = keys
            .get_mut(pos)
            .ok_or(GbpTreeError::Invalid("key position out of range"))?;
        *slot = key.to_vec();
        if !self.internal_fits(&keys) {
            return Ok(false);
        }
        self.write_internal(page, &keys, &children, gens)?;
        Ok(true)
    }
}

/// Picks the codec for `format`.
pub fn codec_for(
    format: NodeFormat,
    page_size: usize,
    key_len: Option<usize>,
    value_len: Option<usize>,
    cmp: KeyCmp,
) -> Result<Box<dyn NodeCodec>> {
    match (format, key_len, value_len) {
        (NodeFormat::Fixed, Some(key_len), Some(value_len)) => Ok(Box::new(FixedNode::new(
            page_size, key_len, value_len, cmp,
        )?)),
        (NodeFormat::Fixed, _, _) => Err(GbpTreeError::Invalid(
            "fixed node format needs fixed-length keys and values",
        )),
        (NodeFormat::Dynamic, _, _) => Ok(Box::new(DynamicNode::new(page_size, cmp)?)),
    }
}

/// Format implied by the codec lengths.
pub fn format_for(key_len: Option<usize>, value_len: Option<usize>) -> NodeFormat {
    if key_len.is_some() && value_len.is_some() {
        NodeFormat::Fixed
    } else {
        NodeFormat::Dynamic
    }
}
