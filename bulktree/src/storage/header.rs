//! Tree header structure and serialization.
//!
//! The header occupies block 0 and records what is needed to reopen a tree:
//! the block size, how many blocks exist and where the root lives.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use crate::storage::buffer_pool::BufferPool;
use crate::storage::page::{BlockId, MIN_BLOCK_SIZE, NO_BLOCK, Page, is_valid_block_size};

/// Magic number identifying a bulk-loaded tree file: "BLKTREE1"
pub const MAGIC: [u8; 8] = *b"BLKTREE1";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Header field offsets.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const BLOCK_SIZE: usize = 12;
    pub const BLOCK_COUNT: usize = 16;
    pub const ROOT: usize = 24;
    pub const HEIGHT: usize = 32;
    pub const LEAF_CAPACITY: usize = 36;
    pub const INDEX_CAPACITY: usize = 40;
    pub const ENTRY_COUNT: usize = 44;
    // 52..block_size: reserved
}

/// Number of header bytes that carry data.
pub const ENCODED_LEN: usize = 52;

const _: () = assert!(ENCODED_LEN <= MIN_BLOCK_SIZE);

/// Tree-wide metadata persisted in block 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TreeHeader {
    /// Format version number.
    pub format_version: u32,
    /// Block size in bytes, fixed for the life of the file.
    pub block_size: u32,
    /// Total number of blocks in the file, header included.
    pub block_count: u64,
    /// Block address of the root node (`NO_BLOCK` before `init`).
    pub root: BlockId,
    /// Level of the root node.
    pub height: u32,
    /// Leaf capacity the tree was built with.
    pub leaf_capacity: u32,
    /// Index capacity the tree was built with.
    pub index_capacity: u32,
    /// Number of entries stored in the leaves.
    pub entry_count: u64,
}

impl TreeHeader {
    /// Create a header for a fresh file that holds only the header block.
    #[must_use]
    pub const fn new(block_size: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            block_size,
            block_count: 1,
            root: NO_BLOCK,
            height: 0,
            leaf_capacity: 0,
            index_capacity: 0,
            entry_count: 0,
        }
    }

    /// Number of node blocks (everything except the header).
    #[must_use]
    pub const fn node_count(&self) -> u64 {
        self.block_count.saturating_sub(1)
    }

    /// Serialize the header to a page.
    ///
    /// Returns `None` if the buffer pool is exhausted.
    pub fn to_page(&self, pool: &Arc<BufferPool>) -> Option<Page> {
        let mut page = pool.lease_page_zeroed()?;

        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, self.format_version);
        page.write_u32(offsets::BLOCK_SIZE, self.block_size);
        page.write_u64(offsets::BLOCK_COUNT, self.block_count);
        page.write_u64(offsets::ROOT, self.root);
        page.write_u32(offsets::HEIGHT, self.height);
        page.write_u32(offsets::LEAF_CAPACITY, self.leaf_capacity);
        page.write_u32(offsets::INDEX_CAPACITY, self.index_capacity);
        page.write_u64(offsets::ENTRY_COUNT, self.entry_count);

        Some(page)
    }

    /// Read the block size out of the leading header bytes.
    ///
    /// Used when opening a file, before the block size is known.
    pub fn peek_block_size(prefix: &[u8]) -> Result<u32, HeaderError> {
        if prefix.len() < ENCODED_LEN {
            return Err(HeaderError::Truncated(prefix.len()));
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&prefix[offsets::MAGIC..offsets::MAGIC + 8]);
        if magic != MAGIC {
            return Err(HeaderError::InvalidMagic(magic));
        }

        let mut raw = [0u8; 4];
        raw.copy_from_slice(&prefix[offsets::BLOCK_SIZE..offsets::BLOCK_SIZE + 4]);
        let block_size = u32::from_le_bytes(raw);
        if !is_valid_block_size(block_size as usize) {
            return Err(HeaderError::InvalidBlockSize(block_size));
        }
        Ok(block_size)
    }

    /// Deserialize a header from a page.
    pub fn from_page(page: &Page) -> Result<Self, HeaderError> {
        let block_size = Self::peek_block_size(page.as_bytes())?;
        if block_size as usize != page.len() {
            return Err(HeaderError::InvalidBlockSize(block_size));
        }

        let format_version = page.read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion(format_version));
        }

        Ok(Self {
            format_version,
            block_size,
            block_count: page.read_u64(offsets::BLOCK_COUNT),
            root: page.read_u64(offsets::ROOT),
            height: page.read_u32(offsets::HEIGHT),
            leaf_capacity: page.read_u32(offsets::LEAF_CAPACITY),
            index_capacity: page.read_u32(offsets::INDEX_CAPACITY),
            entry_count: page.read_u64(offsets::ENTRY_COUNT),
        })
    }
}

/// Errors that can occur when reading a tree header.
#[derive(Debug)]
pub enum HeaderError {
    /// Invalid magic number.
    InvalidMagic([u8; 8]),
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Block size outside the supported range, or not matching the block read.
    InvalidBlockSize(u32),
    /// Fewer bytes than the encoded header needs.
    Truncated(usize),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(
                    f,
                    "invalid magic number: {:?}",
                    String::from_utf8_lossy(magic)
                )
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidBlockSize(s) => write!(f, "invalid block size: {s}"),
            Self::Truncated(len) => {
                write!(f, "header truncated: {len} bytes (need {ENCODED_LEN})")
            }
        }
    }
}

impl std::error::Error for HeaderError {}
