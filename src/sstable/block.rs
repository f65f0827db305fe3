//! Block codec: a sorted run of length-prefixed key/value entries
//! with restart-point prefix compression.
//!
//! ## Block layout
//!
//! ```text
//! +---------------------------------------------+
//! | entry 0: shared | non_shared | value_len    |
//! |          key delta | value                  |
//! +---------------------------------------------+
//! | ...                                         |
//! +---------------------------------------------+
//! | restart offset 0 (u32)                      |
//! +---------------------------------------------+
//! | ...                                         |
//! +---------------------------------------------+
//! | restart count (u32)                         |
//! +---------------------------------------------+
//! | compression type (1B) | masked crc32c (4B)  |
//! +---------------------------------------------+
//! ```
//!
//! Every `restart_interval`-th entry is a restart point whose key is
//! stored in full; entries in between only store the suffix that
//! differs from the previous key. Data blocks use a large interval;
//! index, filter and meta blocks use an interval of one so that every
//! entry can be found by binary search.
//!
//! A finalized data block may carry zero padding after the trailer to
//! round the block up to the configured block size; the recorded
//! handle covers the unpadded contents, so the trailer always sits
//! immediately behind them.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::coding::{crc32c, get_varint32, mask_crc, put_varint32};
use crate::corruption;
use crate::error::Result;
use crate::Error;

/// One compression-type byte plus a 4-byte masked CRC32C.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// The only defined compression type.
pub const NO_COMPRESSION: u8 = 0;

/// Restart interval for data blocks.
pub const DATA_BLOCK_RESTART_INTERVAL: usize = 16;

/// Restart interval for index, filter and meta blocks.
pub const NON_DATA_BLOCK_RESTART_INTERVAL: usize = 1;

/// Append the block trailer to `buf`, whose current contents are the
/// finished block bytes. With `pad_to`, zero padding follows the
/// trailer so the total finalized size reaches `pad_to`; oversized
/// blocks are left unpadded.
pub(crate) fn finalize_block(buf: &mut Vec<u8>, with_crc: bool, pad_to: Option<usize>) {
    buf.push(NO_COMPRESSION);
    let mut trailer = [0u8; 4];
    if with_crc {
        let crc = crc32c(&[&buf[..]]);
        LittleEndian::write_u32(&mut trailer, mask_crc(crc));
    }
    buf.extend_from_slice(&trailer);
    if let Some(pad_to) = pad_to {
        if buf.len() < pad_to {
            buf.resize(pad_to, 0);
        }
    }
}

/// Builds a block from keys added in non-decreasing order.
pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    /// Entries since the last restart point.
    counter: usize,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval >= 1);
        Self {
            restart_interval,
            buffer: Vec::new(),
            restarts: Vec::new(),
            counter: 0,
            last_key: Vec::new(),
            finished: false,
        }
    }

    pub fn reserve(&mut self, bytes: usize) {
        self.buffer.reserve(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Estimated finished size: entries plus the restart array and its
    /// count, before the trailer.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + 4 * self.restarts.len() + 4
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!self.finished);
        debug_assert!(self.last_key.is_empty() || key >= self.last_key.as_slice());

        let shared = if self.counter < self.restart_interval {
            self.last_key
                .iter()
                .zip(key.iter())
                .take_while(|(a, b)| a == b)
                .count()
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };
        if self.restarts.is_empty() {
            // First entry opens the first restart segment.
            self.restarts.push(0);
        }

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, (key.len() - shared) as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Close the block by appending the restart array. Returns the
    /// finished contents size, which is what a handle records.
    pub fn finish(&mut self) -> usize {
        assert!(!self.finished);
        self.finished = true;
        if self.restarts.is_empty() {
            self.restarts.push(0);
        }
        for restart in &self.restarts {
            let mut word = [0u8; 4];
            LittleEndian::write_u32(&mut word, *restart);
            self.buffer.extend_from_slice(&word);
        }
        let mut count = [0u8; 4];
        LittleEndian::write_u32(&mut count, self.restarts.len() as u32);
        self.buffer.extend_from_slice(&count);
        self.buffer.len()
    }

    /// Append the trailer (and optional padding) and expose the final
    /// bytes to be written out. Requires `finish`.
    pub fn finalize(&mut self, with_crc: bool, pad_to: Option<usize>) -> &[u8] {
        assert!(self.finished);
        finalize_block(&mut self.buffer, with_crc, pad_to);
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }
}

/// A parsed, immutable block. Iterators share the block through `Arc`
/// and borrow entry bytes from it.
pub struct Block {
    data: Vec<u8>,
    restarts: Vec<u32>,
}

impl Block {
    /// Parse block contents (without trailer or padding).
    pub fn new(contents: Vec<u8>) -> Result<Self> {
        if contents.len() < 4 {
            return corruption!("block too short");
        }
        let count_offset = contents.len() - 4;
        let num_restarts = LittleEndian::read_u32(&contents[count_offset..]) as usize;
        let array_size = num_restarts
            .checked_mul(4)
            .ok_or_else(|| Error::Corruption("bad restart count".to_string()))?;
        if array_size > count_offset {
            return corruption!("restart array out of bounds");
        }
        let array_offset = count_offset - array_size;
        let mut restarts = Vec::with_capacity(num_restarts);
        for i in 0..num_restarts {
            let at = array_offset + 4 * i;
            let restart = LittleEndian::read_u32(&contents[at..at + 4]);
            if restart as usize > array_offset {
                return corruption!("restart offset out of bounds");
            }
            restarts.push(restart);
        }
        let mut data = contents;
        data.truncate(array_offset);
        Ok(Self { data, restarts })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(self: Arc<Self>) -> BlockIter {
        BlockIter::new(self)
    }

    /// Decode the full key stored at a restart offset.
    fn restart_key(&self, restart: u32) -> Result<&[u8]> {
        let mut input = &self.data[restart as usize..];
        let shared = get_varint32(&mut input)?;
        let non_shared = get_varint32(&mut input)? as usize;
        let _value_len = get_varint32(&mut input)?;
        if shared != 0 {
            return corruption!("restart entry has shared prefix");
        }
        if input.len() < non_shared {
            return corruption!("restart entry out of bounds");
        }
        Ok(&input[..non_shared])
    }
}

/// Cursor over a block's entries. Invalid until positioned; turns
/// invalid again past either end or on the first malformed entry, in
/// which case `status` reports the corruption.
pub struct BlockIter {
    block: Arc<Block>,
    /// Offset of the current entry, `data.len()` when exhausted.
    current: usize,
    /// Offset right behind the current entry.
    next_offset: usize,
    restart_index: usize,
    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,
    valid: bool,
    status: Result<()>,
}

impl BlockIter {
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            current: 0,
            next_offset: 0,
            restart_index: 0,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            valid: false,
            status: Ok(()),
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    /// REQUIRES: `valid()`
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    /// REQUIRES: `valid()`
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value_offset..self.value_offset + self.value_len]
    }

    pub fn seek_to_first(&mut self) {
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    pub fn seek_to_last(&mut self) {
        self.seek_to_restart_point(self.block.restarts.len().saturating_sub(1));
        while self.parse_next_entry() && self.next_offset < self.block.data.len() {}
    }

    /// Position at the first entry with key >= `target`: binary search
    /// over the restart points, then a linear scan within the restart
    /// segment.
    pub fn seek(&mut self, target: &[u8]) {
        let block = Arc::clone(&self.block);
        let mut left = 0;
        let mut right = block.restarts.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let key = match block.restart_key(block.restarts[mid]) {
                Ok(key) => key,
                Err(e) => {
                    self.corrupt(e);
                    return;
                }
            };
            match key.cmp(target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        // `left` is the first restart with key >= target; scan from
        // the segment before it, which may still hold smaller keys
        // followed by the target.
        self.seek_to_restart_point(left.saturating_sub(1));
        while self.parse_next_entry() {
            if self.key.as_slice() >= target {
                return;
            }
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid);
        self.parse_next_entry();
    }

    /// Step back to the entry before the current one; invalid when
    /// already at the first entry.
    pub fn prev(&mut self) {
        debug_assert!(self.valid);
        let original = self.current;
        let mut restart_index = self.restart_index;
        while self.block.restarts[restart_index] as usize >= original {
            if restart_index == 0 {
                self.valid = false;
                self.current = self.block.data.len();
                return;
            }
            restart_index -= 1;
        }
        self.seek_to_restart_point(restart_index);
        while self.parse_next_entry() && self.next_offset < original {}
    }

    fn seek_to_restart_point(&mut self, restart_index: usize) {
        self.restart_index = restart_index;
        self.key.clear();
        self.valid = false;
        self.next_offset = self
            .block
            .restarts
            .get(restart_index)
            .copied()
            .unwrap_or(0) as usize;
    }

    /// Decode the entry at `next_offset`. Returns false past the last
    /// entry or on corruption.
    fn parse_next_entry(&mut self) -> bool {
        self.current = self.next_offset;
        if self.current >= self.block.data.len() {
            self.valid = false;
            return false;
        }
        let mut input = &self.block.data[self.current..];
        let header = (|| -> Result<(usize, usize, usize)> {
            let shared = get_varint32(&mut input)? as usize;
            let non_shared = get_varint32(&mut input)? as usize;
            let value_len = get_varint32(&mut input)? as usize;
            Ok((shared, non_shared, value_len))
        })();
        let (shared, non_shared, value_len) = match header {
            Ok(header) => header,
            Err(e) => {
                self.corrupt(e);
                return false;
            }
        };
        let delta_offset = self.block.data.len() - input.len();
        if shared > self.key.len() || non_shared + value_len > input.len() {
            self.corrupt(Error::Corruption("block entry out of bounds".to_string()));
            return false;
        }
        self.key.truncate(shared);
        self.key
            .extend_from_slice(&self.block.data[delta_offset..delta_offset + non_shared]);
        self.value_offset = delta_offset + non_shared;
        self.value_len = value_len;
        self.next_offset = self.value_offset + value_len;
        while self.restart_index + 1 < self.block.restarts.len()
            && (self.block.restarts[self.restart_index + 1] as usize) <= self.current
        {
            self.restart_index += 1;
        }
        self.valid = true;
        true
    }

    fn corrupt(&mut self, error: Error) {
        self.valid = false;
        self.current = self.block.data.len();
        self.next_offset = self.block.data.len();
        if self.status.is_ok() {
            self.status = Err(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        let size = builder.finish();
        let contents = builder.finalize(true, None)[..size].to_vec();
        Arc::new(Block::new(contents).expect("Failed to parse block"))
    }

    const FRUIT: &[(&[u8], &[u8])] = &[
        (b"apple", b"fruit"),
        (b"application", b"software"),
        (b"banana", b"fruit"),
        (b"band", b"music"),
        (b"bandana", b"clothing"),
    ];

    #[test]
    fn test_builder_and_scan() {
        for interval in [1, 2, 16] {
            let block = build_block(FRUIT, interval);
            let mut iter = block.iter();
            iter.seek_to_first();
            for (key, value) in FRUIT {
                assert!(iter.valid(), "interval {interval}");
                assert_eq!(iter.key(), *key);
                assert_eq!(iter.value(), *value);
                iter.next();
            }
            assert!(!iter.valid());
            iter.status().expect("Scan reported corruption");
        }
    }

    #[test]
    fn test_seek() {
        for interval in [1, 2, 16] {
            let block = build_block(FRUIT, interval);
            let mut iter = block.iter();

            iter.seek(b"band");
            assert!(iter.valid());
            assert_eq!(iter.key(), b"band");

            // Between keys: lands on the next larger one.
            iter.seek(b"bana");
            assert!(iter.valid());
            assert_eq!(iter.key(), b"banana");

            // Before all keys.
            iter.seek(b"");
            assert!(iter.valid());
            assert_eq!(iter.key(), b"apple");

            // Past all keys.
            iter.seek(b"zzz");
            assert!(!iter.valid());
        }
    }

    #[test]
    fn test_prev_and_seek_to_last() {
        let block = build_block(FRUIT, 2);
        let mut iter = block.iter();

        iter.seek_to_last();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"bandana");

        iter.prev();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"band");

        iter.seek_to_first();
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_duplicate_keys_scan_in_insertion_order() {
        let entries: &[(&[u8], &[u8])] = &[
            (b"k", b"v1"),
            (b"k", b"v2"),
            (b"k", b"v3"),
            (b"z", b"v4"),
        ];
        let block = build_block(entries, 16);
        let mut iter = block.iter();
        iter.seek_to_first();
        let mut values = Vec::new();
        while iter.valid() && iter.key() == b"k" {
            values.push(iter.value().to_vec());
            iter.next();
        }
        assert_eq!(values, vec![b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()]);

        // Seek still finds the first occurrence.
        iter.seek(b"k");
        assert_eq!(iter.value(), b"v1");
    }

    #[test]
    fn test_size_estimate_tracks_finish() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"aaa", b"1");
        builder.add(b"aab", b"2");
        let estimate = builder.current_size_estimate();
        let finished = builder.finish();
        assert_eq!(estimate, finished);
    }

    #[test]
    fn test_finalize_trailer_and_padding() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"key", b"value");
        let size = builder.finish();
        let final_bytes = builder.finalize(true, Some(256)).to_vec();
        assert_eq!(final_bytes.len(), 256);
        assert_eq!(final_bytes[size], NO_COMPRESSION);
        // Everything after the trailer is zero padding.
        assert!(final_bytes[size + BLOCK_TRAILER_SIZE..]
            .iter()
            .all(|&b| b == 0));
        // The stored checksum covers contents plus the type byte.
        let crc = LittleEndian::read_u32(&final_bytes[size + 1..size + 5]);
        assert_eq!(
            crate::coding::unmask_crc(crc),
            crate::coding::crc32c(&[&final_bytes[..size + 1]])
        );
    }

    #[test]
    fn test_finalize_without_crc_writes_zero() {
        let mut builder = BlockBuilder::new(1);
        builder.add(b"key", b"value");
        let size = builder.finish();
        let final_bytes = builder.finalize(false, None);
        assert_eq!(final_bytes.len(), size + BLOCK_TRAILER_SIZE);
        assert_eq!(&final_bytes[size + 1..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_reset_reuses_builder() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"a", b"1");
        builder.finish();
        builder.finalize(true, None);
        builder.reset();
        assert!(builder.is_empty());
        builder.add(b"b", b"2");
        let size = builder.finish();
        let contents = builder.finalize(true, None)[..size].to_vec();
        let block = Arc::new(Block::new(contents).unwrap());
        let mut iter = block.iter();
        iter.seek_to_first();
        assert_eq!(iter.key(), b"b");
    }

    #[test]
    fn test_malformed_block_rejected() {
        assert!(Block::new(vec![1, 2]).is_err());
        // Restart count larger than the block itself.
        let mut contents = vec![0u8; 8];
        LittleEndian::write_u32(&mut contents[4..], 1000);
        assert!(Block::new(contents).is_err());
    }

    #[test]
    fn test_iterator_surfaces_corruption() {
        let mut builder = BlockBuilder::new(2);
        for (key, value) in FRUIT {
            builder.add(key, value);
        }
        let size = builder.finish();
        let mut contents = builder.finalize(true, None)[..size].to_vec();
        contents[0] = 0xff; // Mangle the first entry header
        let broken = Arc::new(Block::new(contents).unwrap());
        let mut iter = broken.iter();
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(iter.status().is_err());
    }
}
