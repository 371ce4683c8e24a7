#![forbid(unsafe_code)]
//! Encoding utilities shared by the key layout and the on-disk image.

pub mod ord {
    //! Order-preserving encoders for fixed-width integer keys.

    use core::convert::TryInto;

    const U32_LEN: usize = core::mem::size_of::<u32>();
    const U64_LEN: usize = core::mem::size_of::<u64>();
    const SIGN_BIT_32: u32 = 1 << 31;
    const SIGN_BIT_64: u64 = 1 << 63;

    /// Big-endian encoding for lexicographic order preservation.
    pub fn put_u32_be(dst: &mut [u8], v: u32) {
        assert!(dst.len() >= U32_LEN, "destination too small");
        dst[..U32_LEN].copy_from_slice(&v.to_be_bytes());
    }

    /// Decodes a u32 from big-endian byte order.
    pub fn get_u32_be(src: &[u8]) -> u32 {
        let head = src
            .get(..U32_LEN)
            .unwrap_or_else(|| panic!("u32 source shorter than 4 bytes (have {})", src.len()));
        let bytes: [u8; U32_LEN] = head.try_into().unwrap();
        u32::from_be_bytes(bytes)
    }

    /// Encodes a signed i32 with order preservation (flip sign bit for sorting).
    pub fn put_i32_be(dst: &mut [u8], v: i32) {
        put_u32_be(dst, (v as u32) ^ SIGN_BIT_32);
    }

    /// Decodes a signed i32 with order preservation.
    pub fn get_i32_be(src: &[u8]) -> i32 {
        (get_u32_be(src) ^ SIGN_BIT_32) as i32
    }

    /// Big-endian encoding for lexicographic order preservation.
    pub fn put_u64_be(dst: &mut [u8], v: u64) {
        assert!(dst.len() >= U64_LEN, "destination too small");
        dst[..U64_LEN].copy_from_slice(&v.to_be_bytes());
    }

    /// Decodes a u64 from big-endian byte order.
    pub fn get_u64_be(src: &[u8]) -> u64 {
        let head = src
            .get(..U64_LEN)
            .unwrap_or_else(|| panic!("u64 source shorter than 8 bytes (have {})", src.len()));
        let bytes: [u8; U64_LEN] = head.try_into().unwrap();
        u64::from_be_bytes(bytes)
    }

    /// Encodes a signed i64 with order preservation (flip sign bit for sorting).
    pub fn put_i64_be(dst: &mut [u8], v: i64) {
        let flipped = (v as u64) ^ SIGN_BIT_64;
        put_u64_be(dst, flipped);
    }

    /// Decodes a signed i64 with order preservation.
    pub fn get_i64_be(src: &[u8]) -> i64 {
        let flipped = get_u64_be(src);
        let raw = flipped ^ SIGN_BIT_64;
        raw as i64
    }
}
