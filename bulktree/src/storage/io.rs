//! Block storage abstraction.
//!
//! The `BlockStore` trait is everything the tree needs from its backing
//! storage: block allocation, block reads and writes, and the tree header.
//! The real implementation is `BlockFile`; `MemoryStore` keeps blocks in
//! memory and can inject faults for testing.

use std::sync::Arc;

use crate::storage::buffer_pool::BufferPool;
use crate::storage::header::TreeHeader;
use crate::storage::page::{BlockId, Page};

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Block out of bounds.
    BlockOutOfBounds { block: BlockId, total_blocks: u64 },
    /// Header error.
    Header(String),
    /// Injected fault for testing.
    InjectedFault(String),
    /// Corruption detected.
    Corruption(String),
    /// Buffer pool exhausted - no buffers available.
    BufferPoolExhausted,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::BlockOutOfBounds {
                block,
                total_blocks,
            } => write!(
                f,
                "block {block} out of bounds (total blocks: {total_blocks})"
            ),
            Self::Header(e) => write!(f, "header error: {e}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::BufferPoolExhausted => write!(f, "buffer pool exhausted"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over block-addressed storage.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `allocate_block` returns strictly increasing addresses, never block 0
/// - `read_block` returns the last written content for a block
/// - `sync` makes all previous writes durable
/// - Header changes are persisted on `write_header` + `sync`
///
/// Implementations are not internally synchronized. Concurrent builders
/// share one store behind a mutex.
pub trait BlockStore {
    /// Get a reference to the buffer pool that block reads lease from.
    fn buffer_pool(&self) -> &Arc<BufferPool>;

    /// Size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Allocate one new block at the end of storage.
    fn allocate_block(&mut self) -> Result<BlockId, StorageError>;

    /// Read a block from storage.
    fn read_block(&mut self, block: BlockId) -> Result<Page, StorageError>;

    /// Write a block to storage.
    fn write_block(&mut self, block: BlockId, page: &Page) -> Result<(), StorageError>;

    /// Total number of blocks, header included.
    fn total_blocks(&self) -> u64;

    /// Get a reference to the tree header.
    fn header(&self) -> &TreeHeader;

    /// Get a mutable reference to the tree header.
    fn header_mut(&mut self) -> &mut TreeHeader;

    /// Write the header to block 0.
    fn write_header(&mut self) -> Result<(), StorageError>;

    /// Sync all pending writes to durable storage.
    fn sync(&mut self) -> Result<(), StorageError>;
}
