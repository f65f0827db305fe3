//! Handle encodings: block handles locate blocks inside a log, table
//! handles describe one table's index block, filter block and key
//! range, epoch keys order the meta-index entries, and the footer is
//! the fixed-size trailing record of the index log.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::coding::{
    get_length_prefixed_slice, get_varint64, put_length_prefixed_slice, put_varint64,
    MAX_VARINT64_LEN,
};
use crate::error::Result;
use crate::Error;

/// Location of a block (without its trailer) inside a log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

/// Maximum encoded length of a block handle.
pub const MAX_BLOCK_HANDLE_LEN: usize = 2 * MAX_VARINT64_LEN;

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let offset = get_varint64(input)?;
        let size = get_varint64(input)?;
        Ok(Self { offset, size })
    }
}

/// Description of one table: the location of its index block and
/// bloom filter block in the index log, plus the table's key range.
/// The stored largest key may be a short successor of the true
/// largest, so it is an inclusive upper bound rather than an exact
/// key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableHandle {
    pub index: BlockHandle,
    pub filter: BlockHandle,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
}

impl TableHandle {
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        self.index.encode_to(dst);
        put_varint64(dst, self.filter.offset);
        put_varint64(dst, self.filter.size);
        put_length_prefixed_slice(dst, &self.smallest_key);
        put_length_prefixed_slice(dst, &self.largest_key);
    }

    pub fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let index = BlockHandle::decode_from(input)?;
        let filter_offset = get_varint64(input)?;
        let filter_size = get_varint64(input)?;
        let smallest_key = get_length_prefixed_slice(input)?.to_vec();
        let largest_key = get_length_prefixed_slice(input)?.to_vec();
        Ok(Self {
            index,
            filter: BlockHandle::new(filter_offset, filter_size),
            smallest_key,
            largest_key,
        })
    }
}

/// Canonical meta-index key for table `table` of epoch `epoch`.
/// Big-endian so that all entries of an epoch sort contiguously and
/// in table order.
pub fn epoch_key(epoch: u32, table: u32) -> [u8; 8] {
    let mut key = [0u8; 8];
    BigEndian::write_u32(&mut key[..4], epoch);
    BigEndian::write_u32(&mut key[4..], table);
    key
}

/// Fixed-size trailing record of the index log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Footer {
    pub meta_handle: BlockHandle,
    pub num_epochs: u32,
}

/// Encoded footer length: a zero-padded meta-index handle, the epoch
/// count, and the magic.
pub const FOOTER_ENCODED_LEN: usize = MAX_BLOCK_HANDLE_LEN + 4 + 8;

const FOOTER_MAGIC: u64 = 0xca3f_9f7b_5e8a_2d16;

impl Footer {
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        let start = dst.len();
        self.meta_handle.encode_to(dst);
        dst.resize(start + MAX_BLOCK_HANDLE_LEN, 0);
        let mut fixed = [0u8; 12];
        LittleEndian::write_u32(&mut fixed[..4], self.num_epochs);
        LittleEndian::write_u64(&mut fixed[4..], FOOTER_MAGIC);
        dst.extend_from_slice(&fixed);
        debug_assert_eq!(dst.len() - start, FOOTER_ENCODED_LEN);
    }

    pub fn decode_from(input: &[u8]) -> Result<Self> {
        if input.len() < FOOTER_ENCODED_LEN {
            return Err(Error::Corruption("footer too short".to_string()));
        }
        let magic = LittleEndian::read_u64(&input[MAX_BLOCK_HANDLE_LEN + 4..FOOTER_ENCODED_LEN]);
        if magic != FOOTER_MAGIC {
            return Err(Error::Corruption("bad footer magic".to_string()));
        }
        let mut handle_input = &input[..MAX_BLOCK_HANDLE_LEN];
        let meta_handle = BlockHandle::decode_from(&mut handle_input)?;
        let num_epochs =
            LittleEndian::read_u32(&input[MAX_BLOCK_HANDLE_LEN..MAX_BLOCK_HANDLE_LEN + 4]);
        Ok(Self {
            meta_handle,
            num_epochs,
        })
    }
}
