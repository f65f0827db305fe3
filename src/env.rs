//! Capability interfaces for the outside world: raw file access, a
//! monotonic-enough clock, and thread pools for background work.
//! Implementations are injected through `DirOptions`, so tests and
//! embedders can substitute their own.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// An append-only file handle.
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// A file handle supporting positional reads from multiple threads.
pub trait RandomAccessFile: Send + Sync {
    /// Read up to `n` bytes starting at `offset`. Returns fewer bytes
    /// only at end of file.
    fn read(&self, offset: u64, n: usize) -> Result<Vec<u8>>;
}

/// Low-level storage and clock access.
pub trait Env: Send + Sync {
    fn now_micros(&self) -> u64;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;
    /// Open a file for random access, returning the handle and the
    /// current file size.
    fn new_random_access_file(&self, path: &Path) -> Result<(Box<dyn RandomAccessFile>, u64)>;
}

/// The standard filesystem-backed environment.
pub struct PosixEnv;

struct PosixWritableFile {
    writer: BufWriter<File>,
}

impl WritableFile for PosixWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

struct PosixRandomAccessFile {
    file: File,
}

impl RandomAccessFile for PosixRandomAccessFile {
    fn read(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if read == 0 {
                break; // EOF
            }
            filled += read;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl Env for PosixEnv {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(PosixWritableFile {
            writer: BufWriter::new(file),
        }))
    }

    fn new_random_access_file(&self, path: &Path) -> Result<(Box<dyn RandomAccessFile>, u64)> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok((Box::new(PosixRandomAccessFile { file }), size))
    }
}

/// A pool that runs queued jobs on its own threads.
pub trait ThreadPool: Send + Sync {
    fn schedule(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool over a shared job queue. Dropping the pool
/// closes the queue and joins every worker.
pub struct StdThreadPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StdThreadPool {
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0, "pool requires at least one thread");
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("dirlog-worker-{i}"))
                .spawn(move || Self::worker_loop(receiver))
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
        loop {
            let job = {
                let receiver = match receiver.lock() {
                    Ok(receiver) => receiver,
                    Err(_) => return,
                };
                receiver.recv()
            };
            match job {
                Ok(job) => job(),
                Err(_) => return, // Queue closed
            }
        }
    }
}

impl ThreadPool for StdThreadPool {
    fn schedule(&self, job: Job) {
        let sender = self.sender.lock().unwrap();
        if let Some(sender) = sender.as_ref() {
            if sender.send(job).is_err() {
                tracing::error!("pool workers exited, job dropped");
            }
        }
    }
}

impl Drop for StdThreadPool {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

/// The shared fallback pool used when `allow_env_threads` is set and
/// no explicit pool was configured. Created on first use and kept for
/// the life of the process.
pub fn default_env_pool() -> Arc<dyn ThreadPool> {
    static POOL: OnceLock<Arc<StdThreadPool>> = OnceLock::new();
    let pool = Arc::clone(POOL.get_or_init(|| Arc::new(StdThreadPool::new(4))));
    pool
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_pool_runs_jobs() {
        let pool = StdThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.schedule(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drop(pool); // Joins the workers, draining the queue
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_posix_env_files() {
        let dir = crate::tmpfs::TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("env_test");
        let env = PosixEnv;

        let mut file = env.new_writable_file(&path).expect("Failed to create file");
        file.append(b"hello ").expect("Append failed");
        file.append(b"world").expect("Append failed");
        file.sync().expect("Sync failed");
        drop(file);

        let (file, size) = env
            .new_random_access_file(&path)
            .expect("Failed to open file");
        assert_eq!(size, 11);
        assert_eq!(file.read(0, 5).expect("Read failed"), b"hello");
        assert_eq!(file.read(6, 5).expect("Read failed"), b"world");
        // Reads past the end return the available bytes only.
        assert_eq!(file.read(6, 100).expect("Read failed"), b"world");
    }

    #[test]
    fn test_env_clock() {
        let env = PosixEnv;
        let a = env.now_micros();
        let b = env.now_micros();
        assert!(b >= a);
    }
}
