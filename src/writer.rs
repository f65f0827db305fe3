//! The write side of a directory: per-partition double-buffered
//! ingest with a background compactor, and the partitioned writer
//! façade on top.
//!
//! Each partition owns two write buffers. Records go into the mutable
//! one; when it fills past `memtable_util` (or a flush forces it),
//! the buffer is promoted to the immutable slot and a compaction is
//! scheduled, while the other buffer takes over as mutable. At most
//! one compaction is in flight per partition; a second promotion must
//! wait for the slot, or reports `BufferFull` in non-blocking mode.
//!
//! The compaction sorts the buffer and streams it through the
//! partition's table logger, all without holding the partition lock;
//! only the slot bookkeeping and counters are published under it.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::coding::{hash, varint32_len};
use crate::config::DirOptions;
use crate::env::{default_env_pool, ThreadPool};
use crate::error::Result;
use crate::io::LogSink;
use crate::memtable::WriteBuffer;
use crate::sstable::bloom::BloomBlock;
use crate::sstable::table::TableLogger;
use crate::Error;

/// How a flush behaves.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlushOptions {
    /// Only check the writer status; do not schedule or wait.
    pub dry_run: bool,
    /// Close the current epoch once the buffer is compacted.
    pub epoch_flush: bool,
    /// Finalize the directory once the buffer is compacted.
    pub finalize: bool,
    /// Return as soon as the flush is scheduled.
    pub no_wait: bool,
}

/// Cumulative bytes pushed to the two logs by compactions.
#[derive(Clone, Copy, Debug, Default)]
pub struct IoStats {
    pub data_size: u64,
    pub index_size: u64,
}

struct LoggerState {
    bufs: [WriteBuffer; 2],
    /// Index of the buffer accepting writes.
    mem: usize,
    /// Index of the buffer being compacted, if any.
    imm: Option<usize>,
    imm_is_epoch_flush: bool,
    imm_is_final: bool,
    has_bg_compaction: bool,
    num_flush_requested: u64,
    num_flush_completed: u64,
    /// Mirror of the table logger's sticky status, readable without
    /// touching the compaction state.
    status: Result<()>,
}

struct CompactionInner {
    table: TableLogger,
    filter: Option<BloomBlock>,
}

struct LoggerCore {
    options: DirOptions,
    /// Bytes one write buffer is sized for.
    buf_bytes: usize,
    /// Fill level at which the mutable buffer swaps out.
    buf_threshold: usize,
    state: Mutex<LoggerState>,
    cv: Condvar,
    /// Exclusive to the single in-flight compaction.
    compaction: Mutex<CompactionInner>,
    data: Arc<LogSink>,
    index: Arc<LogSink>,
    io_stats: Arc<Mutex<IoStats>>,
}

/// One partition's logger.
pub(crate) struct DirLogger {
    core: Arc<LoggerCore>,
}

impl DirLogger {
    pub(crate) fn new(
        options: DirOptions,
        data: Arc<LogSink>,
        index: Arc<LogSink>,
        io_stats: Arc<Mutex<IoStats>>,
    ) -> DirLogger {
        // Derive per-buffer capacity and the bloom filter length from
        // the aggregate memory budget. Works best when key and value
        // sizes are fixed; underestimating them shrinks the filter
        // and raises its false positive rate.
        let overhead_per_entry = varint32_len(options.key_size as u32)
            + varint32_len(options.value_size as u32)
            + 4;
        let bytes_per_entry = options.key_size + options.value_size + overhead_per_entry;
        let bits_per_entry = 8 * bytes_per_entry;
        // Double buffering stores every entry twice.
        let total_bits_per_entry = options.bf_bits_per_key + 2 * bits_per_entry;
        let table_buffer = (options.memtable_buffer / options.num_parts())
            .saturating_sub(options.block_buffer);
        // At least one entry per buffer, so an undersized budget still
        // leaves the swap threshold above zero and writers make
        // progress.
        let entries_per_buf =
            (((8.0 * table_buffer as f64) / total_bits_per_entry as f64).ceil() as u32).max(1);
        let buf_bytes = entries_per_buf as usize * (bytes_per_entry - 4);
        let mut bf_bits = entries_per_buf as usize * options.bf_bits_per_key;
        // Tiny filters see very high false positive rates; enforce a
        // minimum length.
        if bf_bits > 0 && bf_bits < 64 {
            bf_bits = 64;
        }
        let bf_bytes = bf_bits.div_ceil(8);

        tracing::debug!(
            buf_bytes,
            entries_per_buf,
            bf_bytes,
            "partition buffers sized"
        );

        let mut bufs = [WriteBuffer::new(), WriteBuffer::new()];
        for buf in &mut bufs {
            buf.reserve(entries_per_buf, buf_bytes);
        }
        let filter = (options.bf_bits_per_key != 0)
            .then(|| BloomBlock::new(options.bf_bits_per_key, bf_bytes));
        let table = TableLogger::new(options.clone(), Arc::clone(&data), Arc::clone(&index));
        let buf_threshold = (buf_bytes as f64 * options.memtable_util) as usize;

        DirLogger {
            core: Arc::new(LoggerCore {
                options,
                buf_bytes,
                buf_threshold,
                state: Mutex::new(LoggerState {
                    bufs,
                    mem: 0,
                    imm: None,
                    imm_is_epoch_flush: false,
                    imm_is_final: false,
                    has_bg_compaction: false,
                    num_flush_requested: 0,
                    num_flush_completed: 0,
                    status: Ok(()),
                }),
                cv: Condvar::new(),
                compaction: Mutex::new(CompactionInner { table, filter }),
                data,
                index,
                io_stats,
            }),
        }
    }

    pub(crate) fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let state = self.core.state.lock()?;
        let mut state = LoggerCore::prepare(&self.core, state, false, false, false)?;
        let mem = state.mem;
        state.bufs[mem].add(key, value);
        Ok(())
    }

    pub(crate) fn flush(&self, options: FlushOptions) -> Result<()> {
        let mut state = self.core.state.lock()?;
        // Wait for buffer space.
        while state.imm.is_some() {
            if options.dry_run || self.core.options.non_blocking {
                return Err(Error::BufferFull);
            }
            state = self.core.cv.wait(state).map_err(Error::from)?;
        }

        if options.dry_run {
            return state.status.clone(); // Status check only
        }

        state.num_flush_requested += 1;
        let thres = state.num_flush_requested;
        let mut state =
            LoggerCore::prepare(&self.core, state, true, options.epoch_flush, options.finalize)?;
        if !options.no_wait {
            while state.num_flush_completed < thres {
                state = self.core.cv.wait(state).map_err(Error::from)?;
            }
            return state.status.clone();
        }
        Ok(())
    }

    /// Block until no compaction is in flight, then report the writer
    /// status.
    pub(crate) fn wait(&self) -> Result<()> {
        let mut state = self.core.state.lock()?;
        while state.status.is_ok() && state.has_bg_compaction {
            state = self.core.cv.wait(state).map_err(Error::from)?;
        }
        state.status.clone()
    }

    /// Flush and close the underlying log sinks. The shared data log
    /// closes on the first call; later calls are no-ops there.
    pub(crate) fn pre_close(&self, sync: bool) -> Result<()> {
        self.core.data.close(sync)?;
        self.core.index.close(sync)
    }
}

impl Drop for DirLogger {
    fn drop(&mut self) {
        let Ok(mut state) = self.core.state.lock() else {
            return;
        };
        while state.has_bg_compaction {
            match self.core.cv.wait(state) {
                Ok(next) => state = next,
                Err(_) => return,
            }
        }
    }
}

impl LoggerCore {
    /// Make room for an incoming write. Blocks (or reports
    /// `BufferFull`) while the immutable slot is occupied; otherwise
    /// promotes the mutable buffer and schedules its compaction.
    fn prepare<'a>(
        core: &'a Arc<LoggerCore>,
        mut state: MutexGuard<'a, LoggerState>,
        mut force: bool,
        mut epoch_flush: bool,
        mut finalize: bool,
    ) -> Result<MutexGuard<'a, LoggerState>> {
        loop {
            if let Err(e) = &state.status {
                return Err(e.clone());
            }
            let mem_size = state.bufs[state.mem].current_size();
            if !force && mem_size < core.buf_threshold {
                // There is room in the current write buffer.
                return Ok(state);
            }
            if state.imm.is_some() {
                if core.options.non_blocking {
                    return Err(Error::BufferFull);
                }
                state = core.cv.wait(state).map_err(Error::from)?;
                continue;
            }
            // Promote the mutable buffer and swap in the other one.
            force = false;
            state.imm = Some(state.mem);
            if epoch_flush {
                state.imm_is_epoch_flush = true;
                epoch_flush = false;
            }
            if finalize {
                state.imm_is_final = true;
                finalize = false;
            }
            state.mem = 1 - state.mem;
            state = Self::maybe_schedule_compaction(core, state)?;
        }
    }

    fn maybe_schedule_compaction<'a>(
        core: &'a Arc<LoggerCore>,
        mut state: MutexGuard<'a, LoggerState>,
    ) -> Result<MutexGuard<'a, LoggerState>> {
        if state.has_bg_compaction {
            return Ok(state); // One is already in flight
        }
        if state.imm.is_none() {
            return Ok(state); // Nothing to compact
        }
        state.has_bg_compaction = true;

        // The lock is released before handing the job over so pools
        // that run jobs on the calling thread cannot re-enter it.
        drop(state);
        let pool = core
            .options
            .compaction_pool
            .clone()
            .or_else(|| core.options.allow_env_threads.then(default_env_pool));
        match pool {
            Some(pool) => {
                let job = Arc::clone(core);
                pool.schedule(Box::new(move || job.compact_once()));
            }
            None => core.compact_once(), // No pool: compact right here
        }
        Ok(core.state.lock()?)
    }

    /// Run one compaction: sort the immutable buffer, stream it into
    /// the table logger, then publish the outcome. The partition lock
    /// is dropped for the sort and block building.
    fn compact_once(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        debug_assert!(state.has_bg_compaction);
        debug_assert!(state.imm.is_some());
        let Some(imm) = state.imm else {
            return;
        };
        let is_epoch_flush = state.imm_is_epoch_flush;
        let is_final = state.imm_is_final;
        let mut buffer = std::mem::take(&mut state.bufs[imm]);
        drop(state);

        let start = self.options.env.now_micros();
        tracing::debug!(
            bytes = buffer.current_size(),
            capacity = self.buf_bytes,
            "compacting write buffer"
        );

        let (result, stats_delta) = {
            let Ok(mut inner) = self.compaction.lock() else {
                return;
            };
            let inner = &mut *inner;
            if let Some(filter) = inner.filter.as_mut() {
                filter.reset();
            }
            buffer.finish();
            let start_stats = inner.table.output_stats().clone();

            let mut iter = buffer.iter();
            iter.seek_to_first();
            while iter.valid() {
                if let Some(filter) = inner.filter.as_mut() {
                    filter.add_key(iter.key());
                }
                if inner.table.add(iter.key(), iter.value()).is_err() {
                    break;
                }
                iter.next();
            }

            let mut result = inner.table.status();
            if result.is_ok() {
                result = inner.table.end_table(inner.filter.as_mut());
            }
            if result.is_ok() && is_epoch_flush {
                result = inner.table.make_epoch();
            }
            if result.is_ok() && is_final {
                result = inner.table.finish();
            }

            let end_stats = inner.table.output_stats().clone();
            let delta = (
                (end_stats.total_data_size() - start_stats.total_data_size()) as u64,
                (end_stats.total_index_size() - start_stats.total_index_size()) as u64,
            );
            (result, delta)
        };

        let elapsed = self.options.env.now_micros().saturating_sub(start);
        match &result {
            Ok(()) => tracing::debug!(
                entries = buffer.num_entries(),
                micros = elapsed,
                "compaction done"
            ),
            Err(e) => tracing::error!(error = %e, "compaction failed"),
        }
        buffer.reset();

        if let Ok(mut io) = self.io_stats.lock() {
            io.data_size += stats_delta.0;
            io.index_size += stats_delta.1;
        }

        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.bufs[imm] = buffer;
        state.imm = None;
        state.imm_is_epoch_flush = false;
        state.imm_is_final = false;
        state.has_bg_compaction = false;
        if state.status.is_ok() {
            if let Err(e) = result {
                state.status = Err(e);
            }
        }
        state.num_flush_completed += 1;
        self.cv.notify_all();
    }
}

pub(crate) const DATA_LOG: &str = "data.log";

pub(crate) fn index_log_name(part: usize) -> String {
    format!("index-{part:02}.log")
}

pub(crate) fn partition_of(key: &[u8], part_mask: u32) -> usize {
    (hash(key, 0) & part_mask) as usize
}

/// Writes one indexed directory: keys route to one of `2^lg_parts`
/// partitions, each with its own index log, all sharing one data log.
pub struct DirWriter {
    parts: Vec<DirLogger>,
    part_mask: u32,
    io_stats: Arc<Mutex<IoStats>>,
    finished: Mutex<bool>,
}

impl DirWriter {
    /// Create a directory at `name` and open its logs for writing.
    pub fn open(options: DirOptions, name: impl AsRef<Path>) -> Result<DirWriter> {
        let name = name.as_ref();
        let env = Arc::clone(&options.env);
        env.create_dir_all(name)?;
        let data = LogSink::open(Arc::clone(&env), name.join(DATA_LOG))?;
        let io_stats = Arc::new(Mutex::new(IoStats::default()));
        let num_parts = options.num_parts();
        let mut parts = Vec::with_capacity(num_parts);
        for part in 0..num_parts {
            let index = LogSink::open(Arc::clone(&env), name.join(index_log_name(part)))?;
            parts.push(DirLogger::new(
                options.clone(),
                Arc::clone(&data),
                index,
                Arc::clone(&io_stats),
            ));
        }
        tracing::info!(name = %name.display(), parts = num_parts, "directory opened for writing");
        Ok(DirWriter {
            parts,
            part_mask: num_parts as u32 - 1,
            io_stats,
            finished: Mutex::new(false),
        })
    }

    /// Append one record. Never blocks in non-blocking mode: the
    /// record lands in a buffer or the call reports `BufferFull`.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::AssertionFailed("keys cannot be empty".to_string()));
        }
        self.ensure_open()?;
        self.parts[partition_of(key, self.part_mask)].add(key, value)
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.finished.lock()? {
            return Err(Error::AssertionFailed(
                "writer already finished".to_string(),
            ));
        }
        Ok(())
    }

    fn flush_all(&self, epoch_flush: bool, finalize: bool) -> Result<()> {
        for part in &self.parts {
            part.flush(FlushOptions {
                epoch_flush,
                finalize,
                no_wait: true,
                ..Default::default()
            })?;
        }
        for part in &self.parts {
            part.wait()?;
        }
        Ok(())
    }

    /// Compact all buffered records without closing the epoch.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.flush_all(false, false)
    }

    /// Close the current epoch on every partition. Later records land
    /// in strictly later epochs.
    pub fn make_epoch(&self) -> Result<()> {
        self.ensure_open()?;
        self.flush_all(true, false)
    }

    /// Finalize every partition (meta-index block and footer), then
    /// sync and close the logs. No further writes are accepted.
    pub fn finish(&self) -> Result<()> {
        {
            let mut finished = self.finished.lock()?;
            if *finished {
                return Err(Error::AssertionFailed(
                    "writer already finished".to_string(),
                ));
            }
            *finished = true;
        }
        self.flush_all(false, true)?;
        for part in &self.parts {
            part.pre_close(true)?;
        }
        Ok(())
    }

    /// Block until no compaction is in flight on any partition.
    pub fn wait(&self) -> Result<()> {
        for part in &self.parts {
            part.wait()?;
        }
        Ok(())
    }

    pub fn io_stats(&self) -> IoStats {
        self.io_stats.lock().map(|io| *io).unwrap_or_default()
    }
}
