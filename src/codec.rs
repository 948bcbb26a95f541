//! # Value Compression
//!
//! Purpose: Compress values above the configured threshold before
//! transmission and expand them again on the read path, reusing scratch
//! buffers across calls within one operation.
//!
//! ## Design Principles
//! 1. **Worst-Case Sizing**: The scratch buffer covers the algorithm's
//!    published maximum expansion for the input length.
//! 2. **Monotonic Growth**: Buffers grow and never shrink, amortizing
//!    allocation across the keys of a bulk operation.
//! 3. **Honest Framing**: Output only counts as compressed when it is
//!    strictly smaller than the input; otherwise the caller stores plain.
//! 4. **Strict Expansion**: Decompression must produce exactly the length
//!    recorded in the value metadata, anything else is corruption.

use lz4_flex::block::{compress_into, decompress_into, get_maximum_output_size};

use crate::client::{CacheError, CacheResult};

/// Stateful compressor with a reusable worst-case-sized scratch buffer.
///
/// Not safe to share across concurrent calls; create one per operation.
pub struct Compressor {
    buf: Vec<u8>,
}

impl Compressor {
    pub fn new() -> Self {
        Compressor { buf: Vec::new() }
    }

    /// Compresses `data`, returning the compressed bytes only when they are
    /// strictly smaller than the input. `None` means "store plain".
    pub fn compress(&mut self, data: &[u8]) -> Option<&[u8]> {
        let bound = get_maximum_output_size(data.len());
        if bound > self.buf.len() {
            self.buf.resize(bound, 0);
        }

        match compress_into(data, &mut self.buf) {
            Ok(written) if written < data.len() => Some(&self.buf[..written]),
            _ => None,
        }
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateful decompressor; the buffer grows to the largest expansion seen.
///
/// Not safe to share across concurrent calls; create one per operation.
pub struct Decompressor {
    buf: Vec<u8>,
}

impl Decompressor {
    pub fn new() -> Self {
        Decompressor { buf: Vec::new() }
    }

    /// Expands `data` into exactly `expanded_len` bytes.
    ///
    /// Fails with [`CacheError::Corruption`] on malformed input or when the
    /// output length does not match the recorded expansion length.
    pub fn decompress(&mut self, data: &[u8], expanded_len: usize) -> CacheResult<&[u8]> {
        if expanded_len > self.buf.len() {
            self.buf.resize(expanded_len, 0);
        }

        match decompress_into(data, &mut self.buf[..expanded_len]) {
            Ok(written) if written == expanded_len => Ok(&self.buf[..written]),
            _ => Err(CacheError::Corruption),
        }
    }
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}
