//! On-disk table machinery: the block codec, bloom filter blocks,
//! handle and footer encodings, and the table logger that assembles
//! them into the data and index logs.

pub mod block;
pub mod bloom;
pub mod format;
pub mod table;

pub use block::{Block, BlockBuilder, BlockIter, BLOCK_TRAILER_SIZE};
pub use bloom::{bloom_key_may_match, BloomBlock};
pub use format::{epoch_key, BlockHandle, Footer, TableHandle, FOOTER_ENCODED_LEN};
pub use table::{OutputStats, TableLogger};
