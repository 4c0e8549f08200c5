//! Key and value encodings.
//!
//! Keys are stored in an encoded form whose order is defined by
//! [`KeyCodec::compare_encoded`]. The built-in integer codecs use big-endian
//! bytes (sign-flipped for `i64`) so plain byte comparison is enough.

use std::cmp::Ordering;

use crate::primitives::bytes::ord;
use crate::types::{GbpTreeError, Result};

/// Trait implemented by key types that can be stored in the tree.
pub trait KeyCodec: Sized {
    /// Encoded length when every key encodes to the same number of bytes.
    const ENCODED_LEN: Option<usize> = None;

    /// Identifier folded into the persisted layout id.
    const LAYOUT_TAG: u32;

    /// Encode `key` into `out` using the order-preserving representation.
    fn encode_key(key: &Self, out: &mut Vec<u8>);

    /// Compare two encoded keys.
    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering;

    /// Decode a key from its encoded representation.
    fn decode_key(bytes: &[u8]) -> Result<Self>;
}

/// Trait implemented by value types that can be stored in the tree.
pub trait ValCodec: Sized {
    /// Encoded length when every value encodes to the same number of bytes.
    const ENCODED_LEN: Option<usize> = None;

    /// Identifier folded into the persisted layout id.
    const LAYOUT_TAG: u32;

    /// Encode `value` into `out`.
    fn encode_val(value: &Self, out: &mut Vec<u8>);

    /// Decode a value from `src`.
    fn decode_val(src: &[u8]) -> Result<Self>;
}

/// Layout id for a key/value pairing.
pub fn layout_id<K: KeyCodec, V: ValCodec>() -> u64 {
    ((K::LAYOUT_TAG as u64) << 32) | V::LAYOUT_TAG as u64
}

pub(crate) fn encode_key<K: KeyCodec>(key: &K) -> Vec<u8> {
    let mut out = Vec::with_capacity(K::ENCODED_LEN.unwrap_or(16));
    K::encode_key(key, &mut out);
    out
}

pub(crate) fn encode_val<V: ValCodec>(value: &V) -> Vec<u8> {
    let mut out = Vec::with_capacity(V::ENCODED_LEN.unwrap_or(16));
    V::encode_val(value, &mut out);
    out
}

impl KeyCodec for u64 {
    const ENCODED_LEN: Option<usize> = Some(8);
    const LAYOUT_TAG: u32 = 1;

    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        ord::put_u64_be(out, *key);
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        ord::get_u64_be(bytes)
    }
}

impl ValCodec for u64 {
    const ENCODED_LEN: Option<usize> = Some(8);
    const LAYOUT_TAG: u32 = 1;

    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        ord::put_u64_be(out, *value);
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        ord::get_u64_be(src)
    }
}

impl KeyCodec for i64 {
    const ENCODED_LEN: Option<usize> = Some(8);
    const LAYOUT_TAG: u32 = 2;

    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        ord::put_i64_be(out, *key);
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        ord::get_i64_be(bytes)
    }
}

impl ValCodec for i64 {
    const ENCODED_LEN: Option<usize> = Some(8);
    const LAYOUT_TAG: u32 = 2;

    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        ord::put_i64_be(out, *value);
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        ord::get_i64_be(src)
    }
}

impl KeyCodec for Vec<u8> {
    const LAYOUT_TAG: u32 = 3;

    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl ValCodec for Vec<u8> {
    const LAYOUT_TAG: u32 = 3;

    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        Ok(src.to_vec())
    }
}

impl KeyCodec for String {
    const LAYOUT_TAG: u32 = 4;

    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(key.as_bytes());
    }

    fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn decode_key(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|_| GbpTreeError::Corruption("key is not UTF-8"))
    }
}

impl ValCodec for String {
    const LAYOUT_TAG: u32 = 4;

    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(value.as_bytes());
    }

    fn decode_val(src: &[u8]) -> Result<Self> {
        String::from_utf8(src.to_vec()).map_err(|_| GbpTreeError::Corruption("value is not UTF-8"))
    }
}

/// Empty values, for trees used as ordered sets.
impl ValCodec for () {
    const ENCODED_LEN: Option<usize> = Some(0);
    const LAYOUT_TAG: u32 = 5;

    fn encode_val(_value: &Self, _out: &mut Vec<u8>) {}

    fn decode_val(src: &[u8]) -> Result<Self> {
        if !src.is_empty() {
            return Err(GbpTreeError::Corruption("unit value has bytes"));
        }
        Ok(())
    }
}
