//! The two alternating tree-state pages.
//!
//! ```text
//! 0       page type (u8)
//! 8..12   stable generation
//! 12..16  unstable generation
//! 16..24  root id
//! 24..28  root generation
//! 28..36  last allocated id
//! 36..44  freelist write page
//! 44..48  freelist write position
//! 48..56  freelist read page
//! 56..60  freelist read position
//! 60      clean flag
//! 64..72  state version
//! 72..76  header length
//! 76..    header bytes
//! last 4  checksum
//! ```

use crate::primitives::bytes::be;
use crate::primitives::io::FileIo;
use crate::types::{page_crc32, GbpTreeError, PageId, Result};

use super::freelist::FreelistCursors;
use super::gspp::{Generations, Pointer};
use super::page::{self, PageType};

/// Pages holding the two state copies.
pub const STATE_PAGES: [PageId; 2] = [PageId(1), PageId(2)];

const STABLE: usize = 8;
const UNSTABLE: usize = 12;
const ROOT_ID: usize = 16;
const ROOT_GEN: usize = 24;
const LAST_ID: usize = 28;
const FL_WRITE_PAGE: usize = 36;
const FL_WRITE_POS: usize = 44;
const FL_READ_PAGE: usize = 48;
const FL_READ_POS: usize = 56;
const CLEAN: usize = 60;
const VERSION: usize = 64;
const HEADER_LEN: usize = 72;
const HEADER: usize = 76;
const CRC_LEN: usize = 4;

/// Largest header blob a state page of `page_size` can carry.
pub fn max_header_len(page_size: usize) -> usize {
    page_size - HEADER - CRC_LEN
}

/// Everything needed to reopen the tree at its last checkpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeState {
    /// Strictly increasing across writes; the higher valid copy wins.
    pub version: u64,
    /// Generations in effect when the state was written.
    pub gens: Generations,
    /// Root node and the generation it was written in.
    pub root: Pointer,
    /// Highest allocated page id.
    pub last_id: PageId,
    /// Freelist positions.
    pub freelist: FreelistCursors,
    /// Set when the tree was closed without pending changes.
    pub clean: bool,
    /// Caller-defined bytes.
    pub header: Vec<u8>,
}

impl TreeState {
    /// Serializes into a full page image for `page_id`.
    pub fn encode(&self, page_id: PageId, page_size: usize, salt: u64) -> Result<Vec<u8>> {
        if self.header.len() > max_header_len(page_size) {
            return Err(GbpTreeError::Invalid("header does not fit in a state page"));
        }
        let mut buf = vec![0u8; page_size];
        page::set_page_type(&mut buf, PageType::TreeState);
        be::put_u32(&mut buf, STABLE, self.gens.stable);
        be::put_u32(&mut buf, UNSTABLE, self.gens.unstable);
        be::put_u64(&mut buf, ROOT_ID, self.root.id.0);
        be::put_u32(&mut buf, ROOT_GEN, self.root.generation);
        be::put_u64(&mut buf, LAST_ID, self.last_id.0);
        be::put_u64(&mut buf, FL_WRITE_PAGE, self.freelist.write_page.0);
        be::put_u32(&mut buf, FL_WRITE_POS, self.freelist.write_pos);
        be::put_u64(&mut buf, FL_READ_PAGE, self.freelist.read_page.0);
        be::put_u32(&mut buf, FL_READ_POS, self.freelist.read_pos);
        buf[CLEAN] = self.clean as u8;
        be::put_u64(&mut buf, VERSION, self.version);
        be::put_u32(&mut buf, HEADER_LEN, self.header.len() as u32);
        buf[HEADER..HEADER + self.header.len()].copy_from_slice(&self.header);
        let crc_at = page_size - CRC_LEN;
        let crc = page_crc32(page_id.0, salt, &buf[..crc_at]);
        be::put_u32(&mut buf, crc_at, crc);
        Ok(buf)
    }

    /// Parses a state page; `None` when the copy is torn, blank, or foreign.
    pub fn decode(buf: &[u8], page_id: PageId, salt: u64) -> Option<Self> {
        let crc_at = buf.len().checked_sub(CRC_LEN)?;
        if page::page_type(buf) != Some(PageType::TreeState) {
            return None;
        }
        if be::get_u32(buf, crc_at) != page_crc32(page_id.0, salt, &buf[..crc_at]) {
            return None;
        }
        let gens = Generations::new(be::get_u32(buf, STABLE), be::get_u32(buf, UNSTABLE)).ok()?;
        let header_len = be::get_u32(buf, HEADER_LEN) as usize;
        if header_len > max_header_len(buf.len()) {
            return None;
        }
        Some(Self {
            version: be::get_u64(buf, VERSION),
            gens,
            root: Pointer {
                id: PageId(be::get_u64(buf, ROOT_ID)),
                generation: be::get_u32(buf, ROOT_GEN),
            },
            last_id: PageId(be::get_u64(buf, LAST_ID)),
            freelist: FreelistCursors {
                write_page: PageId(be::get_u64(buf, FL_WRITE_PAGE)),
                write_pos: be::get_u32(buf, FL_WRITE_POS),
                read_page: PageId(be::get_u64(buf, FL_READ_PAGE)),
                read_pos: be::get_u32(buf, FL_READ_POS),
            },
            clean: buf[CLEAN] != 0,
            header: buf[HEADER..HEADER + header_len].to_vec(),
        })
    }
}

/// Reads both copies and returns the winner plus the page it lives on.
pub fn read_current(io: &dyn FileIo, page_size: usize, salt: u64) -> Result<(TreeState, PageId)> {
    let mut best: Option<(TreeState, PageId)> = None;
    let mut buf = vec![0u8; page_size];
    for id in STATE_PAGES {
        let off = id.0 * page_size as u64;
        if io.len()? < off + page_size as u64 {
            continue;
        }
        io.read_at(off, &mut buf)?;
        if let Some(state) = TreeState::decode(&buf, id, salt) {
            if best.as_ref().map_or(true, |(b, _)| state.version > b.version) {
                best = Some((state, id));
            }
        }
    }
    best.ok_or(GbpTreeError::Corruption("no valid tree state page"))
}

/// The page the next state must be written to.
pub fn other_page(current: PageId) -> PageId {
    if current == STATE_PAGES[0] {
        STATE_PAGES[1]
    } else {
        STATE_PAGES[0]
    }
}
