//! Scratch directories for tests. Every test in this crate works
//! against a directory of log files, so one uniquely named directory
//! per test is all the scaffolding needed.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const BASE: &str = "/tmp/dirlog_tests";

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// A scratch directory removed again on drop. Names combine the
/// process id with a per-process counter, so concurrent test runs
/// and concurrent tests within one run cannot collide.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let path = Path::new(BASE).join(format!("{}-{id}", std::process::id()));
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                eprintln!("leaking scratch dir {}: {e}", self.path.display());
            }
        }
    }
}
