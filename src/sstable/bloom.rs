//! Bloom filter blocks. A filter is a bit array with the probe count
//! stored as its final byte, so readers can probe filters built with
//! different parameters. Wrapped in the standard block trailer, never
//! padded.

use crate::coding::hash;
use crate::sstable::block::finalize_block;

const BLOOM_HASH_SEED: u32 = 0xbc9f1d34;

fn bloom_hash(key: &[u8]) -> u32 {
    hash(key, BLOOM_HASH_SEED)
}

/// Builds one bloom filter per table. The filter is reset and reused
/// across compactions.
pub struct BloomBlock {
    bits_per_key: usize,
    /// Bit-array length in bytes, excluding the probe-count byte.
    bytes: usize,
    space: Vec<u8>,
    bits: u32,
    k: u32,
    finished: bool,
}

impl BloomBlock {
    pub fn new(bits_per_key: usize, bytes: usize) -> Self {
        let mut filter = Self {
            bits_per_key,
            bytes,
            space: Vec::with_capacity(bytes + 1 + super::block::BLOCK_TRAILER_SIZE),
            bits: 0,
            k: 0,
            finished: false,
        };
        filter.reset();
        filter
    }

    pub fn reset(&mut self) {
        self.finished = false;
        self.space.clear();
        self.space.resize(self.bytes, 0);
        let k = (self.bits_per_key as f64 * std::f64::consts::LN_2).round() as u32;
        self.k = k.clamp(1, 30);
        // Remember the probe count in the filter itself.
        self.space.push(self.k as u8);
        self.bits = 8 * self.bytes as u32;
    }

    /// Set the probe bits for `key` using double hashing.
    pub fn add_key(&mut self, key: &[u8]) {
        assert!(!self.finished);
        if self.bits == 0 {
            return;
        }
        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..self.k {
            let bit = h % self.bits;
            self.space[(bit / 8) as usize] |= 1 << (bit % 8);
            h = h.wrapping_add(delta);
        }
    }

    /// Close the filter. Returns the payload size, which is what a
    /// table handle records as the filter size.
    pub fn finish(&mut self) -> usize {
        assert!(!self.finished);
        self.finished = true;
        self.space.len()
    }

    /// Append the trailer and expose the final bytes. Requires
    /// `finish`.
    pub fn finalize(&mut self, with_crc: bool) -> &[u8] {
        assert!(self.finished);
        finalize_block(&mut self.space, with_crc, None);
        &self.space
    }
}

/// Probe a filter payload for `key`. Degenerate payloads and probe
/// counts reserved for future encodings report "may match".
pub fn bloom_key_may_match(key: &[u8], filter: &[u8]) -> bool {
    let len = filter.len();
    if len < 2 {
        return true;
    }
    let bits = ((len - 1) * 8) as u32;
    let k = filter[len - 1] as u32;
    if k > 30 {
        // Reserved for new encodings of short filters.
        return true;
    }

    let mut h = bloom_hash(key);
    let delta = h.rotate_right(17);
    for _ in 0..k {
        let bit = h % bits;
        if filter[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
            return false;
        }
        h = h.wrapping_add(delta);
    }
    true
}
