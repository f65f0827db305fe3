//! The read side of a directory: footer discovery, the cached
//! meta-index block, and point queries that walk every epoch's
//! tables, pruned by key range and bloom filter.
//!
//! A point query returns the concatenation of every value ever
//! written under the key, ordered by epoch; a missing key is an empty
//! result, not an error. Queries optionally fan out one task per
//! epoch on a reader pool, and the collected fragments are merged
//! back into epoch order.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use itertools::Itertools;

use crate::coding::{crc32c, unmask_crc};
use crate::config::DirOptions;
use crate::corruption;
use crate::env::{default_env_pool, ThreadPool};
use crate::error::Result;
use crate::io::LogSource;
use crate::sstable::block::{Block, BlockIter, BLOCK_TRAILER_SIZE};
use crate::sstable::bloom::bloom_key_may_match;
use crate::sstable::format::{
    epoch_key, BlockHandle, Footer, TableHandle, FOOTER_ENCODED_LEN,
};
use crate::writer::{index_log_name, partition_of, DATA_LOG};
use crate::Error;

/// Read a block's contents at `handle`, verifying the trailer
/// checksum when configured. The returned bytes exclude the trailer.
pub(crate) fn read_block(
    source: &LogSource,
    options: &DirOptions,
    handle: &BlockHandle,
) -> Result<Vec<u8>> {
    let n = handle.size as usize;
    let m = if options.skip_checksums {
        n
    } else {
        n + BLOCK_TRAILER_SIZE
    };
    let mut data = source.read(handle.offset, m)?;
    if data.len() != m {
        return corruption!("truncated block read");
    }
    if !options.skip_checksums && options.verify_checksums {
        let expected = unmask_crc(LittleEndian::read_u32(&data[n + 1..n + 5]));
        let actual = crc32c(&[&data[..n + 1]]);
        if actual != expected {
            return corruption!("block checksum mismatch");
        }
    }
    data.truncate(n);
    Ok(data)
}

/// Shared per-query state: outstanding epoch tasks, the first error
/// observed, and the collected value fragments.
struct ReadCtx {
    core: Mutex<ReadCore>,
    cv: Condvar,
}

struct ReadCore {
    open_reads: usize,
    status: Result<()>,
    frags: Vec<(u32, Vec<u8>)>,
}

impl ReadCtx {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(ReadCore {
                open_reads: 0,
                status: Ok(()),
                frags: Vec::new(),
            }),
            cv: Condvar::new(),
        })
    }
}

struct DirState {
    in_flight_reads: usize,
}

/// One partition of a closed directory, opened for point queries.
pub struct Dir {
    options: DirOptions,
    data: Arc<LogSource>,
    indx: Arc<LogSource>,
    num_epochs: u32,
    /// Cached meta-index block.
    epochs: Arc<Block>,
    state: Mutex<DirState>,
    cv: Condvar,
}

impl Dir {
    /// Parse the index log footer and cache the meta-index block.
    pub fn open(
        options: DirOptions,
        data: Arc<LogSource>,
        indx: Arc<LogSource>,
    ) -> Result<Arc<Dir>> {
        if indx.size() < FOOTER_ENCODED_LEN as u64 {
            return corruption!("index log too short to hold a footer");
        }
        let tail = indx.read(
            indx.size() - FOOTER_ENCODED_LEN as u64,
            FOOTER_ENCODED_LEN,
        )?;
        let footer = Footer::decode_from(&tail)?;
        let contents = read_block(&indx, &options, &footer.meta_handle)?;
        let epochs = Arc::new(Block::new(contents)?);
        tracing::debug!(num_epochs = footer.num_epochs, "directory opened for reading");
        Ok(Arc::new(Dir {
            options,
            data,
            indx,
            num_epochs: footer.num_epochs,
            epochs,
            state: Mutex::new(DirState { in_flight_reads: 0 }),
            cv: Condvar::new(),
        }))
    }

    pub fn num_epochs(&self) -> u32 {
        self.num_epochs
    }

    /// Return all values ever written under `key`, concatenated in
    /// epoch order. A key that was never written yields an empty
    /// result.
    pub fn read(self: Arc<Self>, key: &[u8]) -> Result<Vec<u8>> {
        {
            let mut state = self.state.lock()?;
            state.in_flight_reads += 1;
        }
        let result = Self::read_epochs(&self, key);
        let mut state = self.state.lock()?;
        state.in_flight_reads -= 1;
        self.cv.notify_all();
        result
    }

    fn read_epochs(dir: &Arc<Dir>, key: &[u8]) -> Result<Vec<u8>> {
        let ctx = ReadCtx::new();
        if dir.num_epochs > 0 {
            if !dir.options.parallel_reads {
                // Serial: run inline, reusing one meta-index iterator.
                let mut iter = Arc::clone(&dir.epochs).iter();
                for epoch in 0..dir.num_epochs {
                    ctx.core.lock()?.open_reads += 1;
                    dir.read_one_epoch(key, epoch, &mut iter, &ctx);
                    if ctx.core.lock()?.status.is_err() {
                        break;
                    }
                }
            } else {
                let pool = dir
                    .options
                    .reader_pool
                    .clone()
                    .or_else(|| dir.options.allow_env_threads.then(default_env_pool));
                for epoch in 0..dir.num_epochs {
                    ctx.core.lock()?.open_reads += 1;
                    match &pool {
                        Some(pool) => {
                            let dir = Arc::clone(dir);
                            let ctx = Arc::clone(&ctx);
                            let key = key.to_vec();
                            pool.schedule(Box::new(move || {
                                let mut iter = Arc::clone(&dir.epochs).iter();
                                dir.read_one_epoch(&key, epoch, &mut iter, &ctx);
                            }));
                        }
                        None => {
                            let mut iter = Arc::clone(&dir.epochs).iter();
                            dir.read_one_epoch(key, epoch, &mut iter, &ctx);
                        }
                    }
                    if ctx.core.lock()?.status.is_err() {
                        break;
                    }
                }
            }
        }

        // Wait for every outstanding epoch task.
        let mut core = ctx.core.lock()?;
        while core.open_reads > 0 {
            core = ctx.cv.wait(core).map_err(Error::from)?;
        }
        core.status.clone()?;
        let frags = std::mem::take(&mut core.frags);
        drop(core);

        // Merge fragments back into epoch order; the sort is stable,
        // so values within an epoch keep their table and block order.
        Ok(frags
            .into_iter()
            .sorted_by_key(|(epoch, _)| *epoch)
            .flat_map(|(_, value)| value)
            .collect())
    }

    /// Walk the tables of one epoch, fetching candidate values. The
    /// outcome lands in the shared context.
    fn read_one_epoch(&self, key: &[u8], epoch: u32, iter: &mut BlockIter, ctx: &ReadCtx) {
        let mut status = Ok(());
        let mut table = 0u32;
        loop {
            let ekey = epoch_key(epoch, table);
            // Reuse the current cursor position when it already sits
            // on the wanted entry.
            if !iter.valid() || iter.key() != ekey.as_slice() {
                iter.seek(&ekey);
                if !iter.valid() {
                    break; // Past the last table
                }
                if iter.key() != ekey.as_slice() {
                    break; // No such table
                }
            }
            let mut input = iter.value();
            let handle = match TableHandle::decode_from(&mut input) {
                Ok(handle) => handle,
                Err(e) => {
                    status = Err(e);
                    break;
                }
            };
            iter.next();

            let mut found = false;
            status = self.fetch_table(key, epoch, &handle, ctx, &mut found);
            if status.is_err() {
                break;
            }
            if found && self.options.unique_keys {
                break; // A unique key cannot recur in later tables
            }
            table += 1;
        }
        if status.is_ok() {
            status = iter.status();
        }

        let Ok(mut core) = ctx.core.lock() else {
            return;
        };
        debug_assert!(core.open_reads > 0);
        core.open_reads -= 1;
        if core.status.is_ok() {
            if let Err(e) = status {
                core.status = Err(e);
            }
        }
        ctx.cv.notify_all();
    }

    /// Probe one table for `key`: range check, bloom filter, index
    /// block search, then data block scans.
    fn fetch_table(
        &self,
        key: &[u8],
        epoch: u32,
        handle: &TableHandle,
        ctx: &ReadCtx,
        found: &mut bool,
    ) -> Result<()> {
        if key < handle.smallest_key.as_slice() || key > handle.largest_key.as_slice() {
            return Ok(());
        }
        if handle.filter.size != 0 && !self.key_may_match(key, &handle.filter) {
            return Ok(());
        }

        let contents = read_block(&self.indx, &self.options, &handle.index)?;
        let mut iter = Arc::new(Block::new(contents)?).iter();
        if self.options.unique_keys {
            iter.seek(key);
        } else {
            iter.seek_to_first();
            while iter.valid() && key > iter.key() {
                iter.next();
            }
        }
        while iter.valid() {
            let mut input = iter.value();
            let block_handle = BlockHandle::decode_from(&mut input)?;
            let exhausted = self.fetch_block(key, epoch, &block_handle, ctx, found)?;
            if exhausted {
                break;
            }
            iter.next();
        }
        iter.status()
    }

    /// Scan one data block, saving every value stored under `key`.
    /// Returns true once a larger key proves nothing further can
    /// match.
    fn fetch_block(
        &self,
        key: &[u8],
        epoch: u32,
        handle: &BlockHandle,
        ctx: &ReadCtx,
        found: &mut bool,
    ) -> Result<bool> {
        let contents = read_block(&self.data, &self.options, handle)?;
        let mut iter = Arc::new(Block::new(contents)?).iter();
        if self.options.unique_keys {
            iter.seek(key);
        } else {
            iter.seek_to_first();
            while iter.valid() && key > iter.key() {
                iter.next();
            }
        }
        let mut exhausted = false;
        while iter.valid() {
            if iter.key() == key {
                {
                    let mut core = ctx.core.lock()?;
                    core.frags.push((epoch, iter.value().to_vec()));
                }
                *found = true;
                if self.options.unique_keys {
                    exhausted = true;
                    break;
                }
            } else {
                debug_assert!(iter.key() > key);
                exhausted = true;
                break;
            }
            iter.next();
        }
        iter.status()?;
        Ok(exhausted)
    }

    /// Probe the table's bloom filter. A filter that cannot be read
    /// degrades to "may match" rather than failing the query.
    fn key_may_match(&self, key: &[u8], handle: &BlockHandle) -> bool {
        match read_block(&self.indx, &self.options, handle) {
            Ok(payload) => bloom_key_may_match(key, &payload),
            Err(_) => true,
        }
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        while state.in_flight_reads > 0 {
            match self.cv.wait(state) {
                Ok(next) => state = next,
                Err(_) => return,
            }
        }
    }
}

/// Opens every partition of a closed directory and routes point
/// queries to the partition that owns the key.
pub struct DirReader {
    parts: Vec<Arc<Dir>>,
    part_mask: u32,
}

impl DirReader {
    pub fn open(options: DirOptions, name: impl AsRef<Path>) -> Result<DirReader> {
        let name = name.as_ref();
        let env = Arc::clone(&options.env);
        let data = LogSource::open(env.as_ref(), &name.join(DATA_LOG))?;
        let num_parts = options.num_parts();
        let mut parts = Vec::with_capacity(num_parts);
        for part in 0..num_parts {
            let indx = LogSource::open(env.as_ref(), &name.join(index_log_name(part)))?;
            parts.push(Dir::open(options.clone(), Arc::clone(&data), indx)?);
        }
        Ok(DirReader {
            parts,
            part_mask: num_parts as u32 - 1,
        })
    }

    /// Return all values ever written under `key`, in epoch order.
    pub fn read(&self, key: &[u8]) -> Result<Vec<u8>> {
        let part = partition_of(key, self.part_mask);
        Arc::clone(&self.parts[part]).read(key)
    }

    /// Largest epoch count over all partitions; empty epochs are
    /// partition-local.
    pub fn num_epochs(&self) -> u32 {
        self.parts.iter().map(|p| p.num_epochs()).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::env::{Env, PosixEnv, RandomAccessFile, StdThreadPool, ThreadPool, WritableFile};
    use crate::tmpfs::TempDir;
    use crate::writer::DirWriter;

    fn small_options() -> DirOptions {
        let mut options = DirOptions::default()
            .block_size(512)
            .block_util(0.9)
            .verify_checksums(true);
        options.memtable_buffer = 64 * 1024;
        options.block_buffer = 4 * 1024;
        options
    }

    fn roundtrip(options: &DirOptions, writes: impl FnOnce(&DirWriter)) -> (TempDir, DirReader) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let name = dir.path().join("d");
        let writer = DirWriter::open(options.clone(), &name).expect("Failed to open writer");
        writes(&writer);
        writer.finish().expect("Finish failed");
        let reader = DirReader::open(options.clone(), &name).expect("Failed to open reader");
        (dir, reader)
    }

    #[test]
    fn test_single_key_single_epoch() {
        let options = small_options();
        let (_dir, reader) = roundtrip(&options, |writer| {
            writer.add(b"a", b"1").expect("Add failed");
            writer.make_epoch().expect("Make epoch failed");
        });
        assert_eq!(reader.read(b"a").expect("Read failed"), b"1");
        assert_eq!(reader.read(b"b").expect("Read failed"), b"");
        assert_eq!(reader.num_epochs(), 1);
    }

    #[test]
    fn test_duplicates_within_one_epoch() {
        let options = small_options().unique_keys(false);
        let (_dir, reader) = roundtrip(&options, |writer| {
            writer.add(b"k", b"v1").expect("Add failed");
            writer.add(b"k", b"v2").expect("Add failed");
            writer.make_epoch().expect("Make epoch failed");
        });
        // Insertion order survives the stable compaction sort.
        assert_eq!(reader.read(b"k").expect("Read failed"), b"v1v2");
    }

    #[test]
    fn test_cross_epoch_values_in_epoch_order() {
        let options = small_options();
        let (_dir, reader) = roundtrip(&options, |writer| {
            writer.add(b"k", b"e0").expect("Add failed");
            writer.make_epoch().expect("Make epoch failed");
            writer.add(b"k", b"e1").expect("Add failed");
            writer.make_epoch().expect("Make epoch failed");
        });
        assert_eq!(reader.num_epochs(), 2);
        assert_eq!(reader.read(b"k").expect("Read failed"), b"e0e1");
    }

    #[test]
    fn test_many_keys_many_epochs() {
        let options = small_options();
        let (_dir, reader) = roundtrip(&options, |writer| {
            for epoch in 0..4 {
                for i in 0..300 {
                    let key = format!("key_{i:04}").into_bytes();
                    let value = format!("e{epoch}_{i:04}").into_bytes();
                    writer.add(&key, &value).expect("Add failed");
                }
                writer.make_epoch().expect("Make epoch failed");
            }
        });
        for i in (0..300).step_by(37) {
            let key = format!("key_{i:04}").into_bytes();
            let expected: Vec<u8> = (0..4)
                .flat_map(|epoch| format!("e{epoch}_{i:04}").into_bytes())
                .collect();
            assert_eq!(reader.read(&key).expect("Read failed"), expected);
        }
        assert_eq!(reader.read(b"key_9999").expect("Read failed"), b"");
    }

    #[test]
    fn test_parallel_reads_merge_in_epoch_order() {
        let pool: Arc<dyn ThreadPool> = Arc::new(StdThreadPool::new(3));
        let options = small_options().parallel_reads(true).reader_pool(pool);
        let (_dir, reader) = roundtrip(&options, |writer| {
            for epoch in 0..8 {
                writer
                    .add(b"k", format!("e{epoch};").as_bytes())
                    .expect("Add failed");
                writer.make_epoch().expect("Make epoch failed");
            }
        });
        assert_eq!(
            reader.read(b"k").expect("Read failed"),
            b"e0;e1;e2;e3;e4;e5;e6;e7;"
        );
        assert_eq!(reader.read(b"missing").expect("Read failed"), b"");
    }

    #[test]
    fn test_multiple_partitions() {
        let options = small_options().lg_parts(2);
        let (_dir, reader) = roundtrip(&options, |writer| {
            for i in 0..200 {
                let key = format!("key_{i:04}").into_bytes();
                let value = format!("value_{i:04}").into_bytes();
                writer.add(&key, &value).expect("Add failed");
            }
            writer.make_epoch().expect("Make epoch failed");
        });
        for i in 0..200 {
            let key = format!("key_{i:04}").into_bytes();
            let value = format!("value_{i:04}").into_bytes();
            assert_eq!(reader.read(&key).expect("Read failed"), value);
        }
    }

    #[test]
    fn test_padding_toggles_preserve_semantics() {
        let mut sizes = Vec::new();
        for (block_padding, tail_padding) in [(false, false), (true, false), (false, true)] {
            let mut options = small_options()
                .block_padding(block_padding)
                .tail_padding(tail_padding);
            options.index_buffer = 4096;
            let dir = TempDir::new().expect("Failed to create temp dir");
            let name = dir.path().join("d");
            let writer = DirWriter::open(options.clone(), &name).expect("Failed to open writer");
            for i in 0..50 {
                let key = format!("key_{i:04}").into_bytes();
                writer.add(&key, b"same_value").expect("Add failed");
            }
            writer.make_epoch().expect("Make epoch failed");
            writer.finish().expect("Finish failed");

            let reader = DirReader::open(options, &name).expect("Failed to open reader");
            assert_eq!(reader.read(b"key_0007").expect("Read failed"), b"same_value");
            let data_len = std::fs::metadata(name.join("data.log")).unwrap().len();
            let index_len = std::fs::metadata(name.join(index_log_name(0))).unwrap().len();
            sizes.push((data_len, index_len));
        }
        // Same logical contents, byte-different logs.
        assert_ne!(sizes[0].0, sizes[1].0);
        assert_ne!(sizes[0].1, sizes[2].1);
    }

    /// Environment that counts positional reads against the data log,
    /// to observe bloom filters short-circuiting block fetches.
    struct CountingEnv {
        inner: PosixEnv,
        data_reads: Arc<AtomicUsize>,
    }

    struct CountingFile {
        inner: Box<dyn RandomAccessFile>,
        reads: Option<Arc<AtomicUsize>>,
    }

    impl RandomAccessFile for CountingFile {
        fn read(&self, offset: u64, n: usize) -> crate::error::Result<Vec<u8>> {
            if let Some(reads) = &self.reads {
                reads.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.read(offset, n)
        }
    }

    impl Env for CountingEnv {
        fn now_micros(&self) -> u64 {
            self.inner.now_micros()
        }

        fn create_dir_all(&self, path: &std::path::Path) -> crate::error::Result<()> {
            self.inner.create_dir_all(path)
        }

        fn new_writable_file(
            &self,
            path: &std::path::Path,
        ) -> crate::error::Result<Box<dyn WritableFile>> {
            self.inner.new_writable_file(path)
        }

        fn new_random_access_file(
            &self,
            path: &std::path::Path,
        ) -> crate::error::Result<(Box<dyn RandomAccessFile>, u64)> {
            let (inner, size) = self.inner.new_random_access_file(path)?;
            let reads = (path.file_name() == Some(std::ffi::OsStr::new(DATA_LOG)))
                .then(|| Arc::clone(&self.data_reads));
            Ok((Box::new(CountingFile { inner, reads }), size))
        }
    }

    #[test]
    fn test_bloom_filter_short_circuits_data_reads() {
        let options = small_options().bf_bits_per_key(10);
        let dir = TempDir::new().expect("Failed to create temp dir");
        let name = dir.path().join("d");
        let writer = DirWriter::open(options.clone(), &name).expect("Failed to open writer");
        for (key, value) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
            writer.add(key, value).expect("Add failed");
        }
        writer.make_epoch().expect("Make epoch failed");
        writer.finish().expect("Finish failed");

        let data_reads = Arc::new(AtomicUsize::new(0));
        let counting = Arc::new(CountingEnv {
            inner: PosixEnv,
            data_reads: Arc::clone(&data_reads),
        });
        let reader =
            DirReader::open(options.env(counting), &name).expect("Failed to open reader");

        // A key outside the table's range is pruned by the range
        // check; one inside the range but absent is pruned by the
        // bloom filter. Neither touches the data log.
        assert_eq!(reader.read(b"z").expect("Read failed"), b"");
        assert_eq!(reader.read(b"bb").expect("Read failed"), b"");
        assert_eq!(data_reads.load(Ordering::SeqCst), 0);

        // A present key does.
        assert_eq!(reader.read(b"a").expect("Read failed"), b"1");
        assert!(data_reads.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_corruption_detected_and_isolated() {
        let options = small_options().bf_bits_per_key(0);
        let dir = TempDir::new().expect("Failed to create temp dir");
        let name = dir.path().join("d");
        let writer = DirWriter::open(options.clone(), &name).expect("Failed to open writer");
        // Two epochs with disjoint key ranges, so each lands in its
        // own data block.
        writer.add(b"a", b"1").expect("Add failed");
        writer.make_epoch().expect("Make epoch failed");
        writer.add(b"x", b"2").expect("Add failed");
        writer.make_epoch().expect("Make epoch failed");
        writer.finish().expect("Finish failed");

        // Flip one byte inside the first data block.
        let data_path = name.join("data.log");
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&data_path)
            .expect("Failed to reopen data log");
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(2)).unwrap();
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xff;
        file.seek(SeekFrom::Start(2)).unwrap();
        file.write_all(&byte).unwrap();
        file.sync_all().unwrap();

        let reader = DirReader::open(options.clone(), &name).expect("Failed to open reader");
        assert!(matches!(reader.read(b"a"), Err(Error::Corruption(_))));
        // The second epoch's table does not overlap the corrupted
        // block and stays readable.
        assert_eq!(reader.read(b"x").expect("Read failed"), b"2");

        // Without verification the flipped byte goes unnoticed at
        // read time.
        let lax = DirReader::open(options.verify_checksums(false), &name)
            .expect("Failed to open reader");
        let loose = lax.read(b"a");
        assert!(loose.is_ok() || matches!(loose, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_skip_checksums_roundtrip() {
        let options = small_options().skip_checksums(true).verify_checksums(false);
        let (_dir, reader) = roundtrip(&options, |writer| {
            writer.add(b"k", b"v").expect("Add failed");
            writer.make_epoch().expect("Make epoch failed");
        });
        assert_eq!(reader.read(b"k").expect("Read failed"), b"v");
    }

    #[test]
    fn test_open_rejects_short_index_log() {
        let options = small_options();
        let dir = TempDir::new().expect("Failed to create temp dir");
        let name = dir.path().join("d");
        std::fs::create_dir_all(&name).unwrap();
        std::fs::write(name.join(DATA_LOG), b"").unwrap();
        std::fs::write(name.join(index_log_name(0)), b"short").unwrap();
        assert!(matches!(
            DirReader::open(options, &name),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_unique_keys_read_finds_single_value() {
        // Binary-search mode with several data blocks per table.
        let options = small_options();
        let (_dir, reader) = roundtrip(&options, |writer| {
            for i in 0..500 {
                let key = format!("key_{i:05}").into_bytes();
                let value = format!("value_{i:05}").into_bytes();
                writer.add(&key, &value).expect("Add failed");
            }
            writer.make_epoch().expect("Make epoch failed");
        });
        assert_eq!(reader.read(b"key_00000").expect("Read failed"), b"value_00000");
        assert_eq!(reader.read(b"key_00257").expect("Read failed"), b"value_00257");
        assert_eq!(reader.read(b"key_00499").expect("Read failed"), b"value_00499");
        assert_eq!(reader.read(b"key_00500").expect("Read failed"), b"");
    }
}
