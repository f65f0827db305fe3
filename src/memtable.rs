//! The in-memory staging table for one partition. Records are
//! appended, length-prefixed, into a flat byte store while an offsets
//! array remembers where each record starts; finishing the buffer
//! sorts the offsets by key so compaction can stream records out in
//! order without moving the bytes themselves.

use crate::coding::{get_length_prefixed_slice, put_length_prefixed_slice};
use crate::error::Result;
use crate::Error;

/// Append-only write buffer. Lifecycle: reset → filled by `add` →
/// `finish` (sorts, no further appends) → iterated → reset.
#[derive(Default)]
pub struct WriteBuffer {
    /// Starting offsets of inserted records.
    offsets: Vec<u32>,
    buffer: Vec<u8>,
    num_entries: u32,
    finished: bool,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, num_entries: u32, buffer_size: usize) {
        self.offsets.reserve(num_entries as usize);
        self.buffer.reserve(buffer_size);
    }

    pub fn current_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    pub fn memory_usage(&self) -> usize {
        self.buffer.capacity() + 4 * self.offsets.capacity()
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!self.finished);
        assert!(!key.is_empty(), "keys cannot be empty");
        let offset = self.buffer.len() as u32;
        put_length_prefixed_slice(&mut self.buffer, key);
        put_length_prefixed_slice(&mut self.buffer, value);
        self.offsets.push(offset);
        self.num_entries += 1;
    }

    /// Sort records by key. The sort is stable, so records that share
    /// a key keep their insertion order.
    pub fn finish(&mut self) {
        assert!(!self.finished);
        let buffer = &self.buffer;
        self.offsets
            .sort_by(|&a, &b| key_at(buffer, a).cmp(key_at(buffer, b)));
        self.finished = true;
    }

    pub fn reset(&mut self) {
        self.offsets.clear();
        self.buffer.clear();
        self.num_entries = 0;
        self.finished = false;
    }

    /// Cursor over the sorted records. REQUIRES: `finish` has been
    /// called.
    pub fn iter(&self) -> WriteBufferIter<'_> {
        assert!(self.finished);
        WriteBufferIter {
            buffer: self,
            cursor: -1,
        }
    }
}

fn key_at(buffer: &[u8], offset: u32) -> &[u8] {
    let mut input = &buffer[offset as usize..];
    get_length_prefixed_slice(&mut input).expect("buffer record is self-written")
}

fn entry_at(buffer: &[u8], offset: u32) -> (&[u8], &[u8]) {
    let mut input = &buffer[offset as usize..];
    let key = get_length_prefixed_slice(&mut input).expect("buffer record is self-written");
    let value = get_length_prefixed_slice(&mut input).expect("buffer record is self-written");
    (key, value)
}

/// Cursor over a finished write buffer. Seeking to a target key is
/// not available; compactions only ever stream the whole buffer.
pub struct WriteBufferIter<'a> {
    buffer: &'a WriteBuffer,
    cursor: i64,
}

impl WriteBufferIter<'_> {
    pub fn valid(&self) -> bool {
        self.cursor >= 0 && (self.cursor as usize) < self.buffer.offsets.len()
    }

    pub fn seek_to_first(&mut self) {
        self.cursor = 0;
    }

    pub fn seek_to_last(&mut self) {
        self.cursor = self.buffer.offsets.len() as i64 - 1;
    }

    pub fn seek(&mut self, _target: &[u8]) -> Result<()> {
        Err(Error::NotSupported(
            "seek on a write buffer iterator".to_string(),
        ))
    }

    pub fn next(&mut self) {
        self.cursor += 1;
    }

    pub fn prev(&mut self) {
        self.cursor -= 1;
    }

    /// REQUIRES: `valid()`
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        key_at(&self.buffer.buffer, self.buffer.offsets[self.cursor as usize])
    }

    /// REQUIRES: `valid()`
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        entry_at(&self.buffer.buffer, self.buffer.offsets[self.cursor as usize]).1
    }
}
