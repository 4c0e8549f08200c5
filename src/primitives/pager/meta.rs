use std::ops::Range;

use rand::{rngs::OsRng, RngCore};

use crate::primitives::bytes::be;
use crate::primitives::io::FileIo;
use crate::types::{page_crc32, GbpTreeError, Result};

/// Magic bytes at the start of every tree file.
pub const META_MAGIC: [u8; 4] = *b"GBPT";
/// Incompatible format changes bump the major version.
pub const FORMAT_MAJOR: u16 = 1;
/// Compatible additions bump the minor version.
pub const FORMAT_MINOR: u16 = 0;
/// Smallest supported page size.
pub const MIN_PAGE_SIZE: u32 = 256;
/// Largest supported page size; in-page offsets are 16 bits wide.
pub const MAX_PAGE_SIZE: u32 = 32 * 1024;
/// Number of meta bytes covered by the checksum.
pub const META_LEN: usize = 36;

const MAGIC: Range<usize> = 0..4;
const MAJOR: usize = 4;
const MINOR: usize = 6;
const PAGE_SIZE: usize = 8;
const LAYOUT_ID: usize = 12;
const NODE_FORMAT: usize = 20;
const SALT: usize = 24;
const CRC32: usize = 32;

/// How keys and values are laid out inside tree nodes.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub enum NodeFormat {
    /// Every key and value has the same encoded length.
    Fixed = 1,
    /// Keys and values carry their own lengths.
    Dynamic = 2,
}

impl NodeFormat {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Fixed),
            2 => Ok(Self::Dynamic),
            _ => Err(GbpTreeError::Corruption("unknown node format")),
        }
    }
}

/// Format metadata stored in page 0.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Meta {
    /// Size of every page in bytes.
    pub page_size: u32,
    /// Major format version.
    pub format_major: u16,
    /// Minor format version.
    pub format_minor: u16,
    /// Identifier of the key/value codec pair the tree was created with.
    pub layout_id: u64,
    /// Node layout selected at creation.
    pub node_format: NodeFormat,
    /// Random salt mixed into tree-state checksums.
    pub salt: u64,
}

impl Meta {
    /// Rejects files whose format cannot be served by the caller's configuration.
    pub fn ensure_compatible(
        &self,
        page_size: Option<u32>,
        layout_id: u64,
        node_format: NodeFormat,
    ) -> Result<()> {
        if self.format_major != FORMAT_MAJOR {
            return Err(GbpTreeError::MetadataMismatch(format!(
                "format major version {} is not supported (expected {})",
                self.format_major, FORMAT_MAJOR
            )));
        }
        if let Some(expected) = page_size {
            if expected != self.page_size {
                return Err(GbpTreeError::MetadataMismatch(format!(
                    "page size {} does not match configured {}",
                    self.page_size, expected
                )));
            }
        }
        if self.layout_id != layout_id {
            return Err(GbpTreeError::MetadataMismatch(format!(
                "layout {:#018x} does not match configured {:#018x}",
                self.layout_id, layout_id
            )));
        }
        if self.node_format != node_format {
            return Err(GbpTreeError::MetadataMismatch(format!(
                "node format {:?} does not match configured {:?}",
                self.node_format, node_format
            )));
        }
        Ok(())
    }

    fn encode(&self) -> [u8; META_LEN] {
        let mut buf = [0u8; META_LEN];
        buf[MAGIC].copy_from_slice(&META_MAGIC);
        be::put_u16(&mut buf, MAJOR, self.format_major);
        be::put_u16(&mut buf, MINOR, self.format_minor);
        be::put_u32(&mut buf, PAGE_SIZE, self.page_size);
        be::put_u64(&mut buf, LAYOUT_ID, self.layout_id);
        buf[NODE_FORMAT] = self.node_format as u8;
        be::put_u64(&mut buf, SALT, self.salt);
        let crc = page_crc32(0, 0, &buf[..CRC32]);
        be::put_u32(&mut buf, CRC32, crc);
        buf
    }

    fn decode(buf: &[u8; META_LEN]) -> Result<Self> {
        if buf[MAGIC] != META_MAGIC {
            return Err(GbpTreeError::MetadataMismatch(
                "file is not a tree file (bad magic)".into(),
            ));
        }
        if be::get_u32(buf, CRC32) != page_crc32(0, 0, &buf[..CRC32]) {
            return Err(GbpTreeError::Corruption("meta checksum mismatch"));
        }
        let page_size = be::get_u32(buf, PAGE_SIZE);
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two()
        {
            return Err(GbpTreeError::Corruption("meta page size out of range"));
        }
        Ok(Self {
            page_size,
            format_major: be::get_u16(buf, MAJOR),
            format_minor: be::get_u16(buf, MINOR),
            layout_id: be::get_u64(buf, LAYOUT_ID),
            node_format: NodeFormat::from_u8(buf[NODE_FORMAT])?,
            salt: be::get_u64(buf, SALT),
        })
    }
}

/// Validates a configured page size.
pub fn check_page_size(page_size: u32) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(GbpTreeError::Invalid("page size must be between 256 and 32768"));
    }
    if !page_size.is_power_of_two() {
        return Err(GbpTreeError::Invalid("page size must be a power of two"));
    }
    Ok(())
}

/// Builds metadata for a new file with a random salt. Nothing is written.
pub fn new_meta(page_size: u32, layout_id: u64, node_format: NodeFormat) -> Result<Meta> {
    check_page_size(page_size)?;
    Ok(Meta {
        page_size,
        format_major: FORMAT_MAJOR,
        format_minor: FORMAT_MINOR,
        layout_id,
        node_format,
        salt: OsRng.next_u64(),
    })
}

/// Writes `meta` into the first bytes of page 0, zero-filling the rest of the page.
pub fn write_meta(io: &dyn FileIo, meta: &Meta) -> Result<()> {
    let mut page = vec![0u8; meta.page_size as usize];
    page[..META_LEN].copy_from_slice(&meta.encode());
    io.write_at(0, &page)
}

/// Reads and validates page 0 without knowing the page size in advance.
pub fn read_meta(io: &dyn FileIo) -> Result<Meta> {
    if io.len()? < META_LEN as u64 {
        return Err(GbpTreeError::MetadataMismatch(
            "file is too short to hold tree metadata".into(),
        ));
    }
    let mut buf = [0u8; META_LEN];
    io.read_at(0, &mut buf)?;
    Meta::decode(&buf)
}
