//! Block-addressed storage for bulk-loaded trees.
//!
//! # File Format
//!
//! A tree file is a sequence of fixed-size blocks (128 bytes to 64KB, chosen
//! at creation):
//!
//! - Block 0: Tree header (block size, block count, root address, height)
//! - Blocks 1-N: B-tree nodes, allocated strictly in increasing order
//!
//! # Usage
//!
//! ```ignore
//! use storage::{BlockFile, BlockStore, BufferPool};
//!
//! let pool = BufferPool::new(64, 512);
//! let mut file = BlockFile::create(path, pool)?;
//!
//! let block = file.allocate_block()?;
//! let mut page = file.buffer_pool().lease_page_zeroed()?;
//! page.write_bytes(0, b"hello");
//! file.write_block(block, &page)?;
//!
//! file.write_header()?;
//! file.sync()?;
//! ```

mod buffer_pool;
mod file;
mod header;
mod io;
mod memory;
mod page;

pub use buffer_pool::{BufferPool, DEFAULT_POOL_CAPACITY};
pub use file::{BlockFile, FileError};
pub use header::{FORMAT_VERSION, HeaderError, MAGIC, TreeHeader};
pub use io::{BlockStore, StorageError};
pub use memory::{FaultConfig, MemoryStore, MemoryStoreStats};
pub use page::{
    BlockId, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, NO_BLOCK, Page, PageError,
    PageHeader, PageType, is_valid_block_size,
};
