//! An append-only, log-structured indexed directory engine. Records
//! grouped into epochs are double-buffered in memory, compacted by a
//! background thread into sorted tables on a pair of logs, and read
//! back with point queries that visit every epoch.

pub mod coding;
pub mod config;
pub mod env;
pub mod error;
pub mod io;
pub mod memtable;
pub mod reader;
pub mod sstable;
pub mod writer;

#[cfg(test)]
pub mod tmpfs;

pub use config::DirOptions;
pub use error::Error;
pub use reader::{Dir, DirReader};
pub use writer::{DirWriter, FlushOptions, IoStats};
