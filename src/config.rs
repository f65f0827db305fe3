use std::fmt;
use std::sync::Arc;

use crate::env::{Env, PosixEnv, ThreadPool};

/// Configuration for one indexed directory.
#[derive(Clone)]
pub struct DirOptions {
    /// Target size of a data block, and the padding multiple when
    /// `block_padding` is on (default: 128KiB)
    pub block_size: usize,

    /// Fraction of `block_size` at which a data block is closed
    /// (default: 0.996)
    pub block_util: f64,

    /// Pad each data block to `block_size` (default: true)
    pub block_padding: bool,

    /// In-memory batching threshold for data blocks before a single
    /// locked append to the shared data log (default: 2MiB)
    pub block_buffer: usize,

    /// Write buffering for the data log sink (default: 4MiB)
    pub data_buffer: usize,

    /// Write buffering for the index log sink, and the padding
    /// multiple when `tail_padding` is on (default: 2MiB)
    pub index_buffer: usize,

    /// Aggregate ingest buffer across all partitions (default: 32MiB)
    pub memtable_buffer: usize,

    /// Mutable-buffer fill fraction that triggers a swap
    /// (default: 0.97)
    pub memtable_util: f64,

    /// Number of partitions, in log2: each directory has
    /// 2^`lg_parts` partitions (default: 0)
    pub lg_parts: u32,

    /// Estimated average key size, used to size buffers (default: 8)
    pub key_size: usize,

    /// Estimated average value size, used to size buffers
    /// (default: 32)
    pub value_size: usize,

    /// Bloom filter bits per key; 0 disables filters (default: 8)
    pub bf_bits_per_key: usize,

    /// Forbid duplicate keys within a table and enable binary-search
    /// seeks on read (default: true)
    pub unique_keys: bool,

    /// Fan point queries out with one task per epoch (default: false)
    pub parallel_reads: bool,

    /// Writers return `BufferFull` instead of blocking for buffer
    /// space (default: false)
    pub non_blocking: bool,

    /// Write zero in place of block checksums (default: false)
    pub skip_checksums: bool,

    /// Verify block checksums on read (default: false)
    pub verify_checksums: bool,

    /// Pad the index log to a multiple of `index_buffer` before the
    /// footer (default: false)
    pub tail_padding: bool,

    /// Thread pool for background compaction jobs; None runs
    /// compactions on the calling thread (default: None)
    pub compaction_pool: Option<Arc<dyn ThreadPool>>,

    /// Thread pool for parallel point queries (default: None)
    pub reader_pool: Option<Arc<dyn ThreadPool>>,

    /// Fall back to the shared environment pool when a pool is not
    /// supplied (default: false)
    pub allow_env_threads: bool,

    /// Low-level file and clock access (default: `PosixEnv`)
    pub env: Arc<dyn Env>,
}

impl Default for DirOptions {
    fn default() -> Self {
        Self {
            block_size: 128 * 1024,
            block_util: 0.996,
            block_padding: true,
            block_buffer: 2 * 1024 * 1024,
            data_buffer: 4 * 1024 * 1024,
            index_buffer: 2 * 1024 * 1024,
            memtable_buffer: 32 * 1024 * 1024,
            memtable_util: 0.97,
            lg_parts: 0,
            key_size: 8,
            value_size: 32,
            bf_bits_per_key: 8,
            unique_keys: true,
            parallel_reads: false,
            non_blocking: false,
            skip_checksums: false,
            verify_checksums: false,
            tail_padding: false,
            compaction_pool: None,
            reader_pool: None,
            allow_env_threads: false,
            env: Arc::new(PosixEnv),
        }
    }
}

impl DirOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target data block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the block fill fraction
    pub fn block_util(mut self, util: f64) -> Self {
        self.block_util = util;
        self
    }

    /// Enable or disable data block padding
    pub fn block_padding(mut self, enabled: bool) -> Self {
        self.block_padding = enabled;
        self
    }

    /// Set the data block commit threshold
    pub fn block_buffer(mut self, size: usize) -> Self {
        self.block_buffer = size;
        self
    }

    /// Set the aggregate ingest buffer size
    pub fn memtable_buffer(mut self, size: usize) -> Self {
        self.memtable_buffer = size;
        self
    }

    /// Set the mutable-buffer fill fraction
    pub fn memtable_util(mut self, util: f64) -> Self {
        self.memtable_util = util;
        self
    }

    /// Set the partition count (log2)
    pub fn lg_parts(mut self, lg: u32) -> Self {
        self.lg_parts = lg;
        self
    }

    /// Set the estimated key and value sizes
    pub fn entry_sizes(mut self, key_size: usize, value_size: usize) -> Self {
        self.key_size = key_size;
        self.value_size = value_size;
        self
    }

    /// Set the bloom filter density; 0 disables filters
    pub fn bf_bits_per_key(mut self, bits: usize) -> Self {
        self.bf_bits_per_key = bits;
        self
    }

    /// Allow or forbid duplicate keys within a table
    pub fn unique_keys(mut self, unique: bool) -> Self {
        self.unique_keys = unique;
        self
    }

    /// Enable parallel epoch fan-out on read
    pub fn parallel_reads(mut self, parallel: bool) -> Self {
        self.parallel_reads = parallel;
        self
    }

    /// Make writers return `BufferFull` instead of blocking
    pub fn non_blocking(mut self, non_blocking: bool) -> Self {
        self.non_blocking = non_blocking;
        self
    }

    /// Disable checksum generation on write
    pub fn skip_checksums(mut self, skip: bool) -> Self {
        self.skip_checksums = skip;
        self
    }

    /// Enable checksum verification on read
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Pad the index log tail before the footer
    pub fn tail_padding(mut self, enabled: bool) -> Self {
        self.tail_padding = enabled;
        self
    }

    /// Use the given pool for background compactions
    pub fn compaction_pool(mut self, pool: Arc<dyn ThreadPool>) -> Self {
        self.compaction_pool = Some(pool);
        self
    }

    /// Use the given pool for parallel reads
    pub fn reader_pool(mut self, pool: Arc<dyn ThreadPool>) -> Self {
        self.reader_pool = Some(pool);
        self
    }

    /// Allow falling back to the shared environment pool
    pub fn allow_env_threads(mut self, allow: bool) -> Self {
        self.allow_env_threads = allow;
        self
    }

    /// Use the given environment for file and clock access
    pub fn env(mut self, env: Arc<dyn Env>) -> Self {
        self.env = env;
        self
    }

    /// Number of partitions this configuration yields.
    pub fn num_parts(&self) -> usize {
        1 << self.lg_parts
    }
}

impl fmt::Debug for DirOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirOptions")
            .field("block_size", &self.block_size)
            .field("block_util", &self.block_util)
            .field("block_padding", &self.block_padding)
            .field("block_buffer", &self.block_buffer)
            .field("data_buffer", &self.data_buffer)
            .field("index_buffer", &self.index_buffer)
            .field("memtable_buffer", &self.memtable_buffer)
            .field("memtable_util", &self.memtable_util)
            .field("lg_parts", &self.lg_parts)
            .field("key_size", &self.key_size)
            .field("value_size", &self.value_size)
            .field("bf_bits_per_key", &self.bf_bits_per_key)
            .field("unique_keys", &self.unique_keys)
            .field("parallel_reads", &self.parallel_reads)
            .field("non_blocking", &self.non_blocking)
            .field("skip_checksums", &self.skip_checksums)
            .field("verify_checksums", &self.verify_checksums)
            .field("tail_padding", &self.tail_padding)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = DirOptions::default();
        assert_eq!(options.block_size, 128 * 1024);
        assert_eq!(options.memtable_buffer, 32 * 1024 * 1024);
        assert_eq!(options.lg_parts, 0);
        assert_eq!(options.num_parts(), 1);
        assert!(options.unique_keys);
        assert!(options.block_padding);
        assert!(!options.non_blocking);
        assert!(options.compaction_pool.is_none());
    }

    #[test]
    fn test_options_builder() {
        let options = DirOptions::new()
            .block_size(32 * 1024)
            .lg_parts(2)
            .bf_bits_per_key(10)
            .unique_keys(false)
            .non_blocking(true)
            .verify_checksums(true);

        assert_eq!(options.block_size, 32 * 1024);
        assert_eq!(options.num_parts(), 4);
        assert_eq!(options.bf_bits_per_key, 10);
        assert!(!options.unique_keys);
        assert!(options.non_blocking);
        assert!(options.verify_checksums);
    }
}
