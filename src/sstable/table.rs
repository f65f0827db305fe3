//! Assembles tables out of sorted record runs and writes them to a
//! pair of logs.
//!
//! ## Log layout
//!
//! ```text
//! data log:   | data block | data block | ...
//!
//! index log:  | index block | filter block? |   per table
//!             | ...                          |  per epoch
//!             | meta-index block             |
//!             | zero padding?                |
//!             | footer                       |
//! ```
//!
//! Data blocks are staged in memory and flushed to the shared data
//! log in one append per commit, taken under the data sink's lock so
//! multiple partitions can interleave commits without tearing. The
//! staged index entries carry buffer-relative offsets that are
//! rebased to the log offset observed inside the lock.
//!
//! The index log has a single writer and needs no such coordination.

use std::sync::Arc;

use crate::coding::{find_short_successor, find_shortest_separator};
use crate::config::DirOptions;
use crate::error::Result;
use crate::io::LogSink;
use crate::sstable::block::{
    BlockBuilder, BLOCK_TRAILER_SIZE, DATA_BLOCK_RESTART_INTERVAL,
    NON_DATA_BLOCK_RESTART_INTERVAL,
};
use crate::sstable::bloom::BloomBlock;
use crate::sstable::format::{
    epoch_key, BlockHandle, Footer, TableHandle, FOOTER_ENCODED_LEN, MAX_BLOCK_HANDLE_LEN,
};
use crate::Error;

pub const MAX_EPOCHS: u32 = u32::MAX;
pub const MAX_TABLES_PER_EPOCH: u32 = u32::MAX;

/// Bytes generated for data, indexes, filters and the footer. The
/// `final_*` figures include trailers and padding.
#[derive(Clone, Debug, Default)]
pub struct OutputStats {
    pub footer_size: usize,
    pub final_data_size: usize,
    pub data_size: usize,
    pub final_meta_size: usize,
    pub meta_size: usize,
    pub final_index_size: usize,
    pub index_size: usize,
    pub final_filter_size: usize,
    pub filter_size: usize,
    pub value_size: usize,
    pub key_size: usize,
}

impl OutputStats {
    pub(crate) fn total_index_size(&self) -> usize {
        self.filter_size + self.index_size + self.meta_size + self.footer_size
    }

    pub(crate) fn total_data_size(&self) -> usize {
        self.data_size
    }
}

/// Writes one directory partition's tables, and at finish the
/// meta-index block and footer. The first error becomes sticky: every
/// later operation is a no-op returning that error.
pub struct TableLogger {
    options: DirOptions,
    status: Result<()>,
    smallest_key: Vec<u8>,
    largest_key: Vec<u8>,
    last_key: Vec<u8>,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    meta_block: BlockBuilder,
    pending_index_entry: bool,
    pending_index_handle: BlockHandle,
    /// Number of tables within the current epoch.
    num_tables: u32,
    /// Number of epochs closed so far.
    num_epochs: u32,
    /// Finalized data blocks awaiting one locked append.
    data_buffer: Vec<u8>,
    /// Separator keys and buffer-relative handles for the staged
    /// blocks.
    uncommitted_indexes: Vec<(Vec<u8>, BlockHandle)>,
    num_uncommitted_data: usize,
    output_stats: OutputStats,
    data_sink: Arc<LogSink>,
    index_sink: Arc<LogSink>,
    finished: bool,
}

impl TableLogger {
    pub fn new(options: DirOptions, data_sink: Arc<LogSink>, index_sink: Arc<LogSink>) -> Self {
        let mut data_block = BlockBuilder::new(DATA_BLOCK_RESTART_INTERVAL);
        data_block.reserve(options.block_size);
        let mut index_block = BlockBuilder::new(NON_DATA_BLOCK_RESTART_INTERVAL);
        index_block.reserve(4 << 10);
        let mut meta_block = BlockBuilder::new(NON_DATA_BLOCK_RESTART_INTERVAL);
        meta_block.reserve(4 << 10);
        let mut data_buffer = Vec::new();
        data_buffer.reserve(options.block_buffer);
        Self {
            options,
            status: Ok(()),
            smallest_key: Vec::new(),
            largest_key: Vec::new(),
            last_key: Vec::new(),
            data_block,
            index_block,
            meta_block,
            pending_index_entry: false,
            pending_index_handle: BlockHandle::default(),
            num_tables: 0,
            num_epochs: 0,
            data_buffer,
            uncommitted_indexes: Vec::new(),
            num_uncommitted_data: 0,
            output_stats: OutputStats::default(),
            data_sink,
            index_sink,
            finished: false,
        }
    }

    pub fn ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    pub fn num_epochs(&self) -> u32 {
        self.num_epochs
    }

    pub fn output_stats(&self) -> &OutputStats {
        &self.output_stats
    }

    /// Run `f` unless an earlier error is sticky; record its error if
    /// it produces one.
    fn guarded(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        if let Err(e) = &self.status {
            return Err(e.clone());
        }
        let result = f(self);
        if let Err(e) = &result {
            self.status = Err(e.clone());
        }
        result
    }

    /// Append one record to the current table. Keys must arrive in
    /// non-decreasing order; duplicates are allowed only when
    /// `unique_keys` is off.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.guarded(|t| {
            if t.finished {
                return Err(Error::AssertionFailed("add after finish".to_string()));
            }
            assert!(!key.is_empty(), "keys cannot be empty");
            if !t.last_key.is_empty() {
                debug_assert!(key >= t.last_key.as_slice());
                if t.options.unique_keys {
                    debug_assert!(key != t.last_key.as_slice());
                }
            }
            if t.smallest_key.is_empty() {
                t.smallest_key = key.to_vec();
            }
            t.largest_key.clear();
            t.largest_key.extend_from_slice(key);

            if t.pending_index_entry {
                let mut separator = std::mem::take(&mut t.last_key);
                find_shortest_separator(&mut separator, key);
                t.uncommitted_indexes.push((separator, t.pending_index_handle));
                t.pending_index_entry = false;
            }

            // Flush the staging buffer if the next block may overflow it.
            if t.data_buffer.len() + t.options.block_size > t.options.block_buffer {
                t.commit_impl()?;
            }

            t.last_key.clear();
            t.last_key.extend_from_slice(key);
            t.output_stats.value_size += value.len();
            t.output_stats.key_size += key.len();

            t.data_block.add(key, value);
            let threshold = (t.options.block_size as f64 * t.options.block_util) as usize;
            if t.data_block.current_size_estimate() + BLOCK_TRAILER_SIZE >= threshold {
                t.end_block_impl()?;
            }
            Ok(())
        })
    }

    /// Force the start of a new data block.
    pub fn end_block(&mut self) -> Result<()> {
        self.guarded(Self::end_block_impl)
    }

    fn end_block_impl(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let block_size = self.data_block.finish();
        let pad_to = self.options.block_padding.then_some(self.options.block_size);
        let final_bytes = self
            .data_block
            .finalize(!self.options.skip_checksums, pad_to);
        let final_len = final_bytes.len();
        self.data_buffer.extend_from_slice(final_bytes);
        let block_offset = (self.data_buffer.len() - final_len) as u64;
        self.output_stats.final_data_size += final_len;
        self.output_stats.data_size += block_size;
        self.data_block.reset();
        debug_assert!(!self.pending_index_entry);
        self.pending_index_handle = BlockHandle::new(block_offset, block_size as u64);
        self.pending_index_entry = true;
        self.num_uncommitted_data += 1;
        Ok(())
    }

    /// Flush all staged data blocks in one locked append and move
    /// their index entries, rebased to the final log position, into
    /// the index block.
    fn commit_impl(&mut self) -> Result<()> {
        if self.data_buffer.is_empty() {
            return Ok(());
        }
        let base = {
            let mut data = self.data_sink.lock()?;
            debug_assert_eq!(self.num_uncommitted_data, self.uncommitted_indexes.len());
            let base = data.tell();
            data.write(&self.data_buffer)?;
            base
        };
        let mut encoding = Vec::with_capacity(MAX_BLOCK_HANDLE_LEN);
        for (separator, mut handle) in self.uncommitted_indexes.drain(..) {
            handle.offset += base;
            encoding.clear();
            handle.encode_to(&mut encoding);
            self.index_block.add(&separator, &encoding);
        }
        self.num_uncommitted_data = 0;
        self.data_buffer.clear();
        Ok(())
    }

    /// Close the current table, writing its index block and the given
    /// filter to the index log and staging its meta-index entry. A
    /// table that received no records is skipped silently.
    pub fn end_table(&mut self, filter: Option<&mut BloomBlock>) -> Result<()> {
        self.guarded(|t| t.end_table_impl(filter))
    }

    fn end_table_impl(&mut self, filter: Option<&mut BloomBlock>) -> Result<()> {
        if self.finished {
            return Err(Error::AssertionFailed("table after finish".to_string()));
        }
        self.end_block_impl()?;
        if self.pending_index_entry {
            let mut successor = std::mem::take(&mut self.last_key);
            find_short_successor(&mut successor);
            self.uncommitted_indexes.push((successor, self.pending_index_handle));
            self.pending_index_entry = false;
        }
        self.commit_impl()?;
        if self.index_block.is_empty() {
            return Ok(()); // Empty table
        }

        let index_size = self.index_block.finish();
        let (index_offset, filter_offset, filter_size) = {
            let mut indx = self.index_sink.lock()?;
            let index_offset = indx.tell();
            let final_index = self
                .index_block
                .finalize(!self.options.skip_checksums, None);
            let final_index_len = final_index.len();
            indx.write(final_index)?;
            self.output_stats.final_index_size += final_index_len;

            let filter_offset = indx.tell();
            let mut filter_size = 0;
            if let Some(bloom) = filter {
                filter_size = bloom.finish();
                let final_filter = bloom.finalize(!self.options.skip_checksums);
                let final_filter_len = final_filter.len();
                indx.write(final_filter)?;
                self.output_stats.final_filter_size += final_filter_len;
                self.output_stats.filter_size += filter_size;
            }
            (index_offset, filter_offset, filter_size)
        };
        self.output_stats.index_size += index_size;
        self.index_block.reset();

        if self.num_tables >= MAX_TABLES_PER_EPOCH {
            return Err(Error::AssertionFailed("too many tables".to_string()));
        }
        let mut largest_key = std::mem::take(&mut self.largest_key);
        find_short_successor(&mut largest_key);
        let handle = TableHandle {
            index: BlockHandle::new(index_offset, index_size as u64),
            filter: BlockHandle::new(filter_offset, filter_size as u64),
            smallest_key: std::mem::take(&mut self.smallest_key),
            largest_key,
        };
        let mut encoding = Vec::new();
        handle.encode_to(&mut encoding);
        self.meta_block
            .add(&epoch_key(self.num_epochs, self.num_tables), &encoding);
        self.last_key.clear();
        self.num_tables += 1;
        Ok(())
    }

    /// Close the current epoch. An epoch that received no tables is
    /// skipped silently.
    pub fn make_epoch(&mut self) -> Result<()> {
        self.guarded(|t| {
            t.end_table_impl(None)?;
            t.make_epoch_impl()
        })
    }

    fn make_epoch_impl(&mut self) -> Result<()> {
        if self.num_tables == 0 {
            return Ok(()); // Empty epoch
        }
        if self.num_epochs >= MAX_EPOCHS {
            return Err(Error::AssertionFailed("too many epochs".to_string()));
        }
        self.num_tables = 0;
        self.num_epochs += 1;
        Ok(())
    }

    /// Finalize the directory: close the last epoch, write the
    /// meta-index block, the optional tail padding and the footer.
    /// No further writes are accepted.
    pub fn finish(&mut self) -> Result<()> {
        self.guarded(|t| {
            if t.finished {
                return Err(Error::AssertionFailed("finish after finish".to_string()));
            }
            t.end_table_impl(None)?;
            t.make_epoch_impl()?;
            t.finished = true;

            let meta_size = t.meta_block.finish();
            {
                let mut indx = t.index_sink.lock()?;
                let meta_offset = indx.tell();
                let final_meta = t.meta_block.finalize(!t.options.skip_checksums, None);
                let final_meta_len = final_meta.len();
                indx.write(final_meta)?;
                t.output_stats.final_meta_size += final_meta_len;

                let footer = Footer {
                    meta_handle: BlockHandle::new(meta_offset, meta_size as u64),
                    num_epochs: t.num_epochs,
                };
                let mut footer_buf = Vec::with_capacity(FOOTER_ENCODED_LEN);
                footer.encode_to(&mut footer_buf);

                if t.options.tail_padding {
                    // Round the final index log size up to a multiple
                    // of the physical write size.
                    let total = indx.tell() + footer_buf.len() as u64;
                    let overflow = (total % t.options.index_buffer as u64) as usize;
                    if overflow != 0 {
                        indx.write(&vec![0u8; t.options.index_buffer - overflow])?;
                    }
                }
                indx.write(&footer_buf)?;
                t.output_stats.footer_size += footer_buf.len();
            }
            t.output_stats.meta_size += meta_size;
            tracing::debug!(epochs = t.num_epochs, "directory contents finalized");
            Ok(())
        })
    }
}
