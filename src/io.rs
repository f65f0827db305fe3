//! Log sinks and sources: the append-only write side and the
//! random-access read side of a log file. A sink tracks its logical
//! write offset so callers can record block handles without querying
//! the filesystem; the shared data log is written by multiple
//! partitions under the sink's own lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::assertion_failed;
use crate::env::{Env, RandomAccessFile, WritableFile};
use crate::error::Result;

/// Append-only log writer shared between partitions through `Arc`.
/// All state lives behind one mutex; `lock` exposes a guard for
/// callers that must pair an offset query with the following append.
pub struct LogSink {
    name: PathBuf,
    env: Arc<dyn Env>,
    inner: Mutex<SinkInner>,
}

struct SinkInner {
    /// None once the log has been closed.
    file: Option<Box<dyn WritableFile>>,
    /// Logical write offset, monotonically increasing.
    offset: u64,
}

/// Exclusive access to a sink while the guard is held.
pub struct LockedSink<'a> {
    name: &'a Path,
    inner: MutexGuard<'a, SinkInner>,
}

impl LogSink {
    /// Create the log file and return a shareable sink for it.
    pub fn open(env: Arc<dyn Env>, name: PathBuf) -> Result<Arc<LogSink>> {
        let file = env.new_writable_file(&name)?;
        Ok(Arc::new(LogSink {
            name,
            env,
            inner: Mutex::new(SinkInner {
                file: Some(file),
                offset: 0,
            }),
        }))
    }

    pub fn lock(&self) -> Result<LockedSink<'_>> {
        Ok(LockedSink {
            name: &self.name,
            inner: self.inner.lock()?,
        })
    }

    /// Current logical write offset.
    pub fn tell(&self) -> Result<u64> {
        Ok(self.lock()?.tell())
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.lock()?.write(data)
    }

    pub fn sync(&self) -> Result<()> {
        self.lock()?.sync()
    }

    /// Close the log so no further writes will be accepted,
    /// optionally forcing a sync first. Closing twice is a no-op.
    pub fn close(&self, sync: bool) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if let Some(mut file) = inner.file.take() {
            file.flush()?;
            if sync {
                file.sync()?;
            }
        }
        Ok(())
    }

    /// Flush and close the current log file and redirect all future
    /// appends to a new piece named after `index`. The logical offset
    /// keeps increasing across pieces.
    pub fn rotate(&self, index: usize, sync: bool) -> Result<()> {
        let mut inner = self.inner.lock()?;
        match inner.file.take() {
            Some(mut file) => {
                file.flush()?;
                if sync {
                    file.sync()?;
                }
            }
            None => {
                return assertion_failed!("log already closed: {}", self.name.display());
            }
        }
        let mut piece = self.name.clone().into_os_string();
        piece.push(format!(".{index}"));
        inner.file = Some(self.env.new_writable_file(Path::new(&piece))?);
        Ok(())
    }
}

impl LockedSink<'_> {
    pub fn tell(&self) -> u64 {
        self.inner.offset
    }

    /// Append data to the log. May lose data until the next `sync`.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let inner = &mut *self.inner;
        match inner.file.as_mut() {
            Some(file) => {
                file.append(data)?;
                inner.offset += data.len() as u64;
                Ok(())
            }
            None => assertion_failed!("log already closed: {}", self.name.display()),
        }
    }

    pub fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.inner.file.as_mut() {
            file.sync()?;
        }
        Ok(())
    }
}

/// Random-access log reader shared through `Arc`.
pub struct LogSource {
    file: Box<dyn RandomAccessFile>,
    size: u64,
}

impl LogSource {
    pub fn open(env: &dyn Env, name: &Path) -> Result<Arc<LogSource>> {
        let (file, size) = env.new_random_access_file(name)?;
        Ok(Arc::new(LogSource { file, size }))
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        self.file.read(offset, n)
    }
}
