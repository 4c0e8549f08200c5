//! Page id allocation and generation-bounded reuse.
//!
//! Released ids are appended to a chain of freelist pages together with the
//! generation they were released in. An id is handed out again only once
//! that generation is stable, so no page reachable from the last checkpoint
//! is ever overwritten.
//!
//! ```text
//! 0      page type (u8)
//! 8..16  next freelist page (u64)
//! 16..   entries: release generation (u32) | page id (u64)
//! ```

use crate::primitives::bytes::be;
use crate::primitives::pager::PagedFile;
use crate::types::{GbpTreeError, PageId, Result};

use super::gspp::Generations;
use super::page::{self, PageType};

const NEXT: usize = 8;
const ENTRIES: usize = 16;
const ENTRY_LEN: usize = 12;

/// Read and write positions of the freelist chain.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct FreelistCursors {
    /// Page new releases are appended to.
    pub write_page: PageId,
    /// Next entry slot on the write page.
    pub write_pos: u32,
    /// Page the next reusable id is taken from.
    pub read_page: PageId,
    /// Next entry slot on the read page.
    pub read_pos: u32,
}

/// A released id waiting for reuse.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub struct FreeEntry {
    /// Generation the id was released in.
    pub generation: u32,
    /// Released page.
    pub id: PageId,
}

/// Allocator state: the highest id in use plus the freelist cursors.
#[derive(Clone, Debug)]
pub struct FreeList {
    last_id: PageId,
    cursors: FreelistCursors,
    capacity: u32,
}

impl FreeList {
    /// Entries that fit on one freelist page.
    pub fn capacity_for(page_size: usize) -> u32 {
        ((page_size - ENTRIES) / ENTRY_LEN) as u32
    }

    /// Formats `first` as an empty freelist page; `first` becomes the last id.
    pub fn initialize(pager: &PagedFile, first: PageId) -> Result<Self> {
        init_page(pager, first)?;
        Ok(Self {
            last_id: first,
            cursors: FreelistCursors {
                write_page: first,
                write_pos: 0,
                read_page: first,
                read_pos: 0,
            },
            capacity: Self::capacity_for(pager.page_size()),
        })
    }

    /// Rebuilds the allocator from persisted state.
    pub fn restore(last_id: PageId, cursors: FreelistCursors, page_size: usize) -> Result<Self> {
        let capacity = Self::capacity_for(page_size);
        if cursors.read_pos > capacity
            || cursors.write_pos > capacity
            || cursors.read_page > last_id
            || cursors.write_page > last_id
            || cursors.read_page.is_null()
            || cursors.write_page.is_null()
        {
            return Err(GbpTreeError::Corruption("freelist cursors out of range"));
        }
        Ok(Self {
            last_id,
            cursors,
            capacity,
        })
    }

    /// Highest page id handed out so far.
    pub fn last_id(&self) -> PageId {
        self.last_id
    }

    /// Current cursors, as persisted at checkpoint.
    pub fn cursors(&self) -> FreelistCursors {
        self.cursors
    }

    fn grow(&mut self) -> Result<PageId> {
        let next = PageId(self.last_id.0 + 1);
        if next > PageId::MAX {
            return Err(GbpTreeError::Invalid("page id space exhausted"));
        }
        self.last_id = next;
        Ok(next)
    }

    /// Hands out an id: the oldest released id whose release generation is
    /// stable, or a fresh id past the end of the file.
    pub fn acquire(&mut self, pager: &PagedFile, gens: Generations) -> Result<PageId> {
        loop {
            let c = self.cursors;
            if c.read_page == c.write_page && c.read_pos >= c.write_pos {
                return self.grow();
            }
            if c.read_pos >= self.capacity {
                let exhausted = c.read_page;
                let next = read_next(pager, exhausted)?;
                if next.is_null() || next > self.last_id {
                    return Err(GbpTreeError::Corruption("freelist chain broken"));
                }
                self.cursors.read_page = next;
                self.cursors.read_pos = 0;
                self.release(pager, exhausted, gens)?;
                continue;
            }
            let entry = read_entry(pager, c.read_page, c.read_pos)?;
            if entry.generation > gens.stable {
                return self.grow();
            }
            if entry.id.is_null() || entry.id > self.last_id {
                return Err(GbpTreeError::Corruption("freelist entry beyond last id"));
            }
            self.cursors.read_pos += 1;
            return Ok(entry.id);
        }
    }

    /// Queues `id` for reuse once the current unstable generation is stable.
    pub fn release(&mut self, pager: &PagedFile, id: PageId, gens: Generations) -> Result<()> {
        if self.cursors.write_pos >= self.capacity {
            let fresh = self.grow()?;
            init_page(pager, fresh)?;
            {
                let mut current = pager.write(self.cursors.write_page)?;
                be::put_u64(&mut current, NEXT, fresh.0);
            }
            self.cursors.write_page = fresh;
            self.cursors.write_pos = 0;
        }
        let off = ENTRIES + self.cursors.write_pos as usize * ENTRY_LEN;
        let mut page = pager.write(self.cursors.write_page)?;
        be::put_u32(&mut page, off, gens.unstable);
        be::put_u64(&mut page, off + 4, id.0);
        drop(page);
        self.cursors.write_pos += 1;
        Ok(())
    }

    /// Every queued entry, oldest first.
    pub fn entries(&self, pager: &PagedFile) -> Result<Vec<FreeEntry>> {
        let mut out = Vec::new();
        let mut page_id = self.cursors.read_page;
        let mut pos = self.cursors.read_pos;
        let mut hops = 0u64;
        loop {
            let end = if page_id == self.cursors.write_page {
                self.cursors.write_pos
            } else {
                self.capacity
            };
            while pos < end {
                out.push(read_entry(pager, page_id, pos)?);
                pos += 1;
            }
            if page_id == self.cursors.write_page {
                return Ok(out);
            }
            page_id = read_next(pager, page_id)?;
            pos = 0;
            hops += 1;
            if page_id.is_null() || page_id > self.last_id || hops > self.last_id.0 {
                return Err(GbpTreeError::Corruption("freelist chain broken"));
            }
        }
    }

    /// Freelist pages currently in the chain, read page first.
    pub fn pages(&self, pager: &PagedFile) -> Result<Vec<PageId>> {
        let mut out = vec![self.cursors.read_page];
        let mut page_id = self.cursors.read_page;
        while page_id != self.cursors.write_page {
            page_id = read_next(pager, page_id)?;
            if page_id.is_null() || page_id > self.last_id || out.len() as u64 > self.last_id.0 {
                return Err(GbpTreeError::Corruption("freelist chain broken"));
            }
            out.push(page_id);
        }
        Ok(out)
    }
}

fn init_page(pager: &PagedFile, id: PageId) -> Result<()> {
    let mut page = pager.write(id)?;
    page.fill(0);
    page::set_page_type(&mut page, PageType::FreeList);
    Ok(())
}

fn load(pager: &PagedFile, id: PageId) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; pager.page_size()];
    pager.read_into(id, &mut buf)?;
    if page::page_type(&buf) != Some(PageType::FreeList) {
        return Err(GbpTreeError::Corruption("expected a freelist page"));
    }
    Ok(buf)
}

fn read_next(pager: &PagedFile, id: PageId) -> Result<PageId> {
    Ok(PageId(be::get_u64(&load(pager, id)?, NEXT)))
}

fn read_entry(pager: &PagedFile, id: PageId, pos: u32) -> Result<FreeEntry> {
    let buf = load(pager, id)?;
    let off = ENTRIES + pos as usize * ENTRY_LEN;
    Ok(FreeEntry {
        generation: be::get_u32(&buf, off),
        id: PageId(be::get_u64(&buf, off + 4)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileIo;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn pager(dir: &tempfile::TempDir) -> Result<PagedFile> {
        let io = StdFileIo::open_rw(dir.path().join("free.bin"), true)?;
        Ok(PagedFile::new(Arc::new(io), 256))
    }

    #[test]
    fn released_ids_wait_for_a_checkpoint() -> Result<()> {
        let dir = tempdir()?;
        let pager = pager(&dir)?;
        let mut list = FreeList::initialize(&pager, PageId(4))?;
        let gens = Generations::new(1, 2)?;
        let a = list.acquire(&pager, gens)?;
        assert_eq!(a, PageId(5));
        list.release(&pager, a, gens)?;
        assert_eq!(list.acquire(&pager, gens)?, PageId(6));
        let later = gens.after_checkpoint();
        assert_eq!(list.acquire(&pager, later)?, PageId(5));
        assert_eq!(list.acquire(&pager, later)?, PageId(7));
        Ok(())
    }

    #[test]
    fn chain_grows_and_exhausted_pages_are_recycled() -> Result<()> {
        let dir = tempdir()?;
        let pager = pager(&dir)?;
        let mut list = FreeList::initialize(&pager, PageId(4))?;
        let gens = Generations::new(1, 2)?;
        let capacity = FreeList::capacity_for(256) as u64;
        let released: Vec<PageId> = (0..capacity + 3).map(|i| PageId(100 + i)).collect();
        list.last_id = PageId(500);
        for id in &released {
            list.release(&pager, *id, gens)?;
        }
        assert_eq!(list.pages(&pager)?.len(), 2);
        let queued: Vec<PageId> = list.entries(&pager)?.iter().map(|e| e.id).collect();
        assert_eq!(queued, released);

        let later = gens.after_checkpoint();
        for expected in &released {
            assert_eq!(list.acquire(&pager, later)?, *expected);
        }
        assert_eq!(list.pages(&pager)?.len(), 1);
        let tail = list.entries(&pager)?;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, PageId(4));
        assert_eq!(tail[0].generation, later.unstable);
        Ok(())
    }

    #[test]
    fn restore_rejects_cursors_past_last_id() {
        let cursors = FreelistCursors {
            write_page: PageId(9),
            write_pos: 0,
            read_page: PageId(4),
            read_pos: 0,
        };
        assert!(FreeList::restore(PageId(5), cursors, 256).is_err());
        assert!(FreeList::restore(PageId(9), cursors, 256).is_ok());
    }
}
