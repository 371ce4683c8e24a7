#![forbid(unsafe_code)]

/// Incremental 32-bit checksum.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
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

/// CRC over a counts image: the salt and format version are mixed in so an image
/// copied from another file or written by another format never validates.
pub fn image_crc32(salt: u64, format_version: u16, payload: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&salt.to_be_bytes());
    hasher.update(&format_version.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
