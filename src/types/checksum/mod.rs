#![forbid(unsafe_code)]

/// Incremental checksum over byte slices.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds `bytes` into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// CRC-32 backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of a whole-page payload, salted with the page number and the
/// per-file salt so a page copied to the wrong offset fails validation.
pub fn page_crc32(page_no: u64, salt: u64, payload: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_restarts_accumulation() {
        let mut c = Crc32Fast::default();
        c.update(b"generation");
        let first = c.finalize();
        c.update(b" pointer");
        let second = c.finalize();
        assert_ne!(first, second);
        c.reset();
        c.update(b"generation pointer");
        assert_eq!(c.finalize(), second);
    }

    #[test]
    fn page_crc32_depends_on_location() {
        let payload = vec![7u8; 32];
        let base = page_crc32(1, 99, &payload);
        assert_eq!(base, page_crc32(1, 99, &payload));
        assert_ne!(base, page_crc32(2, 99, &payload));
        assert_ne!(base, page_crc32(1, 100, &payload));
        let mut changed = payload.clone();
        changed[31] ^= 1;
        assert_ne!(base, page_crc32(1, 99, &changed));
    }
}
