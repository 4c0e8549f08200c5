#![forbid(unsafe_code)]
//! Fixed-width big-endian accessors and order-preserving key encoders.

pub mod be {
    //! Big-endian reads and writes at byte offsets inside a page.
    //!
    //! Callers validate offsets against the page length first; these helpers
    //! index directly.

    /// Reads a `u16` at `off`.
    pub fn get_u16(src: &[u8], off: usize) -> u16 {
        u16::from_be_bytes([src[off], src[off + 1]])
    }

    /// Writes a `u16` at `off`.
    pub fn put_u16(dst: &mut [u8], off: usize, v: u16) {
        dst[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads a `u32` at `off`.
    pub fn get_u32(src: &[u8], off: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&src[off..off + 4]);
        u32::from_be_bytes(buf)
    }

    /// Writes a `u32` at `off`.
    pub fn put_u32(dst: &mut [u8], off: usize, v: u32) {
        dst[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads a 48-bit unsigned value at `off`.
    pub fn get_u48(src: &[u8], off: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..].copy_from_slice(&src[off..off + 6]);
        u64::from_be_bytes(buf)
    }

    /// Writes the low 48 bits of `v` at `off`.
    pub fn put_u48(dst: &mut [u8], off: usize, v: u64) {
        debug_assert!(v < (1 << 48), "value exceeds 48 bits");
        dst[off..off + 6].copy_from_slice(&v.to_be_bytes()[2..]);
    }

    /// Reads a `u64` at `off`.
    pub fn get_u64(src: &[u8], off: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&src[off..off + 8]);
        u64::from_be_bytes(buf)
    }

    /// Writes a `u64` at `off`.
    pub fn put_u64(dst: &mut [u8], off: usize, v: u64) {
        dst[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }
}

pub mod ord {
    //! Order-preserving encoders for numeric keys.

    use crate::types::{GbpTreeError, Result};

    const U64_LEN: usize = core::mem::size_of::<u64>();
    const SIGN_BIT: u64 = 1 << 63;

    /// Big-endian encoding so byte order matches numeric order.
    pub fn put_u64_be(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Decodes a `u64` written by [`put_u64_be`].
    pub fn get_u64_be(src: &[u8]) -> Result<u64> {
        let head: [u8; U64_LEN] = src
            .get(..U64_LEN)
            .and_then(|s| s.try_into().ok())
            .ok_or(GbpTreeError::Corruption("u64 source shorter than 8 bytes"))?;
        Ok(u64::from_be_bytes(head))
    }

    /// Encodes a signed value with the sign bit flipped so negatives sort first.
    pub fn put_i64_be(dst: &mut Vec<u8>, v: i64) {
        put_u64_be(dst, (v as u64) ^ SIGN_BIT);
    }

    /// Decodes a value written by [`put_i64_be`].
    pub fn get_i64_be(src: &[u8]) -> Result<i64> {
        Ok((get_u64_be(src)? ^ SIGN_BIT) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::{be, ord};

    #[test]
    fn u48_round_trip_keeps_neighbours() {
        let mut buf = [0xAAu8; 10];
        be::put_u48(&mut buf, 2, 0x0102_0304_0506);
        assert_eq!(buf[0], 0xAA);
        assert_eq!(buf[8], 0xAA);
        assert_eq!(be::get_u48(&buf, 2), 0x0102_0304_0506);
    }

    #[test]
    fn signed_encoding_preserves_order() {
        let values = [i64::MIN, -5, -1, 0, 1, 42, i64::MAX];
        let encoded: Vec<Vec<u8>> = values
            .iter()
            .map(|v| {
                let mut out = Vec::new();
                ord::put_i64_be(&mut out, *v);
                out
            })
            .collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for (raw, bytes) in values.iter().zip(&encoded) {
            assert_eq!(ord::get_i64_be(bytes).unwrap(), *raw);
        }
    }

    #[test]
    fn short_input_is_corruption() {
        assert!(ord::get_u64_be(&[1, 2, 3]).is_err());
    }
}
