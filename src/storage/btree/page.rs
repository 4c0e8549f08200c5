//! Header layout shared by every tree node.
//!
//! ```text
//! 0      page type (u8)
//! 1      node kind (u8)
//! 2..6   generation (u32)
//! 6..8   key count (u16)
//! 8..36  right sibling pointer pair
//! 36..64 left sibling pointer pair
//! 64..92 successor pointer pair
//! 92..94 heap allocation offset (dynamic layout)
//! 94..96 dead heap bytes (dynamic layout)
//! ```

use crate::primitives::bytes::be;
use crate::types::{GbpTreeError, Result};

use super::gspp::{self, Generations, Pointer, PointerFault, GSPP_LEN};

const PAGE_TYPE: usize = 0;
const NODE_KIND: usize = 1;
const GENERATION: usize = 2;
const KEY_COUNT: usize = 6;
const RIGHT_SIBLING: usize = 8;
const LEFT_SIBLING: usize = RIGHT_SIBLING + GSPP_LEN;
const SUCCESSOR: usize = LEFT_SIBLING + GSPP_LEN;
/// Offset of the dynamic layout's allocation offset.
pub(crate) const ALLOC_OFFSET: usize = SUCCESSOR + GSPP_LEN;
/// Offset of the dynamic layout's dead-space counter.
pub(crate) const DEAD_SPACE: usize = ALLOC_OFFSET + 2;
/// Bytes reserved for the node header.
pub const HEADER_LEN: usize = DEAD_SPACE + 2;

/// What a page is used for.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub enum PageType {
    /// A leaf or internal node.
    TreeNode = 1,
    /// A page in the freelist chain.
    FreeList = 2,
    /// One of the two tree-state copies.
    TreeState = 3,
}

impl PageType {
    /// Decodes a page type byte; unknown values yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::TreeNode),
            2 => Some(Self::FreeList),
            3 => Some(Self::TreeState),
            _ => None,
        }
    }
}

/// Leaf or internal.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub enum NodeKind {
    /// Holds keys and values.
    Leaf = 1,
    /// Holds separator keys and child pointers.
    Internal = 2,
}

/// One of the three pointer pairs in the node header.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub enum Link {
    /// Next node on the same level.
    Right,
    /// Previous node on the same level.
    Left,
    /// Newer version of this node.
    Successor,
}

impl Link {
    /// Byte offset of the pointer pair.
    pub const fn offset(self) -> usize {
        match self {
            Link::Right => RIGHT_SIBLING,
            Link::Left => LEFT_SIBLING,
            Link::Successor => SUCCESSOR,
        }
    }

    /// All header links.
    pub const ALL: [Link; 3] = [Link::Right, Link::Left, Link::Successor];
}

/// Raw page type byte.
pub fn page_type_byte(page: &[u8]) -> u8 {
    page[PAGE_TYPE]
}

/// Page type, if recognised.
pub fn page_type(page: &[u8]) -> Option<PageType> {
    PageType::from_u8(page[PAGE_TYPE])
}

/// Stamps the page type byte.
pub fn set_page_type(page: &mut [u8], kind: PageType) {
    page[PAGE_TYPE] = kind as u8;
}

/// Returns true when the page is a tree node.
pub fn is_node(page: &[u8]) -> bool {
    page_type(page) == Some(PageType::TreeNode)
}

/// Node kind of a tree node page.
pub fn node_kind(page: &[u8]) -> Result<NodeKind> {
    match page[NODE_KIND] {
        1 => Ok(NodeKind::Leaf),
        2 => Ok(NodeKind::Internal),
        _ => Err(GbpTreeError::Corruption("unknown tree node kind")),
    }
}

/// Returns true for leaf nodes.
pub fn is_leaf(page: &[u8]) -> bool {
    page[NODE_KIND] == NodeKind::Leaf as u8
}

/// Generation the node was last written in.
pub fn generation(page: &[u8]) -> u32 {
    be::get_u32(page, GENERATION)
}

/// Restamps the node generation.
pub fn set_generation(page: &mut [u8], generation: u32) {
    be::put_u32(page, GENERATION, generation);
}

/// Number of keys stored in the node.
pub fn key_count(page: &[u8]) -> usize {
    be::get_u16(page, KEY_COUNT) as usize
}

/// Updates the key count.
pub fn set_key_count(page: &mut [u8], count: usize) {
    debug_assert!(count <= u16::MAX as usize);
    be::put_u16(page, KEY_COUNT, count as u16);
}

/// Zeroes the page and stamps it as a node of `kind` in the unstable generation.
pub fn initialize(page: &mut [u8], kind: NodeKind, gens: Generations) {
    page.fill(0);
    set_page_type(page, PageType::TreeNode);
    page[NODE_KIND] = kind as u8;
    set_generation(page, gens.unstable);
}

/// Resolves a header link.
pub fn link(page: &[u8], link: Link, gens: Generations) -> std::result::Result<Pointer, PointerFault> {
    gspp::read(page, link.offset(), gens)
}

/// Writes a header link in the unstable generation.
pub fn set_link(
    page: &mut [u8],
    link: Link,
    target: crate::types::PageId,
    gens: Generations,
) -> Result<()> {
    gspp::write(page, link.offset(), target, gens)
}
