//! Tree file I/O operations.
//!
//! This module handles reading and writing fixed-size blocks to the tree file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::storage::buffer_pool::BufferPool;
use crate::storage::header::{ENCODED_LEN, HeaderError, TreeHeader};
use crate::storage::io::{BlockStore, StorageError};
use crate::storage::page::{BlockId, Page, is_valid_block_size};

/// A tree file handle with low-level block I/O operations.
pub struct BlockFile {
    file: File,
    header: TreeHeader,
    buffer_pool: Arc<BufferPool>,
}

impl BlockFile {
    /// Create a new tree file at the given path.
    ///
    /// The block size is the buffer size of `buffer_pool`.
    /// Returns an error if the file already exists.
    pub fn create(path: &Path, buffer_pool: Arc<BufferPool>) -> Result<Self, FileError> {
        if path.exists() {
            return Err(FileError::AlreadyExists(path.to_path_buf()));
        }

        let block_size = buffer_pool.block_size();
        let encoded_block_size = u32::try_from(block_size)
            .ok()
            .filter(|_| is_valid_block_size(block_size))
            .ok_or(FileError::InvalidBlockSize(block_size))?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(FileError::Io)?;

        // Initialize with a fresh header
        let header = TreeHeader::new(encoded_block_size);
        let page = header
            .to_page(&buffer_pool)
            .ok_or(FileError::BufferPoolExhausted)?;

        file.write_all(page.as_bytes()).map_err(FileError::Io)?;
        file.sync_all().map_err(FileError::Io)?;

        Ok(Self {
            file,
            header,
            buffer_pool,
        })
    }

    /// Open an existing tree file.
    ///
    /// The block size is read from the header; a buffer pool of
    /// `pool_capacity` buffers of that size is created for the file.
    pub fn open(path: &Path, pool_capacity: usize) -> Result<Self, FileError> {
        if !path.exists() {
            return Err(FileError::NotFound(path.to_path_buf()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(FileError::Io)?;

        // The block size lives in the header, so read the fixed prefix first
        let mut prefix = [0u8; ENCODED_LEN];
        file.read_exact(&mut prefix).map_err(FileError::Io)?;
        let block_size = TreeHeader::peek_block_size(&prefix).map_err(FileError::Header)?;

        let buffer_pool = BufferPool::new(pool_capacity, block_size as usize);
        let mut page = buffer_pool
            .lease_page()
            .ok_or(FileError::BufferPoolExhausted)?;
        file.seek(SeekFrom::Start(0)).map_err(FileError::Io)?;
        file.read_exact(page.as_bytes_mut())
            .map_err(FileError::Io)?;

        let header = TreeHeader::from_page(&page).map_err(FileError::Header)?;
        drop(page);

        let expected_len = header.block_count * u64::from(header.block_size);
        let actual_len = file.metadata().map_err(FileError::Io)?.len();
        if actual_len < expected_len {
            return Err(FileError::Truncated {
                expected: expected_len,
                actual: actual_len,
            });
        }

        Ok(Self {
            file,
            header,
            buffer_pool,
        })
    }

    /// Get a reference to the header.
    #[must_use]
    pub const fn header(&self) -> &TreeHeader {
        &self.header
    }

    /// Get a mutable reference to the header.
    pub const fn header_mut(&mut self) -> &mut TreeHeader {
        &mut self.header
    }

    /// Block size of this file in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.buffer_pool.block_size()
    }

    fn offset_of(&self, block: BlockId) -> u64 {
        block * u64::from(self.header.block_size)
    }

    const fn check_bounds(&self, block: BlockId) -> Result<(), FileError> {
        if block >= self.header.block_count {
            return Err(FileError::BlockOutOfBounds {
                block,
                total_blocks: self.header.block_count,
            });
        }
        Ok(())
    }

    /// Read a block from the file.
    ///
    /// Returns an error if the block is out of bounds or buffer pool is exhausted.
    pub fn read_block(&mut self, block: BlockId) -> Result<Page, FileError> {
        self.check_bounds(block)?;

        // Lease a page buffer from the pool
        let mut page = self
            .buffer_pool
            .lease_page()
            .ok_or(FileError::BufferPoolExhausted)?;

        let offset = self.offset_of(block);
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(FileError::Io)?;

        self.file
            .read_exact(page.as_bytes_mut())
            .map_err(FileError::Io)?;

        Ok(page)
    }

    /// Write a block to the file.
    pub fn write_block(&mut self, block: BlockId, page: &Page) -> Result<(), FileError> {
        self.check_bounds(block)?;
        if page.len() != self.block_size() {
            return Err(FileError::InvalidBlockSize(page.len()));
        }

        let offset = self.offset_of(block);
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(FileError::Io)?;

        self.file
            .write_all(page.as_bytes())
            .map_err(FileError::Io)?;

        Ok(())
    }

    /// Write the header to block 0.
    pub fn write_header(&mut self) -> Result<(), FileError> {
        let page = self
            .header
            .to_page(&self.buffer_pool)
            .ok_or(FileError::BufferPoolExhausted)?;

        self.file.seek(SeekFrom::Start(0)).map_err(FileError::Io)?;
        self.file
            .write_all(page.as_bytes())
            .map_err(FileError::Io)?;

        Ok(())
    }

    /// Get a reference to the buffer pool.
    #[must_use]
    pub const fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Allocate new blocks at the end of the file.
    ///
    /// Returns the address of the first allocated block.
    pub fn allocate_blocks(&mut self, count: u64) -> Result<BlockId, FileError> {
        let first_new_block = self.header.block_count;

        // Extend the file
        let new_total = first_new_block + count;
        self.file
            .set_len(new_total * u64::from(self.header.block_size))
            .map_err(FileError::Io)?;

        self.header.block_count = new_total;

        Ok(first_new_block)
    }

    /// Sync all pending writes to disk.
    pub fn sync(&self) -> Result<(), FileError> {
        self.file.sync_all().map_err(FileError::Io)
    }

    /// Get the total number of blocks in the file.
    #[must_use]
    pub const fn total_blocks(&self) -> u64 {
        self.header.block_count
    }
}

/// Errors that can occur during file operations.
#[derive(Debug)]
pub enum FileError {
    /// I/O error.
    Io(std::io::Error),
    /// File already exists.
    AlreadyExists(PathBuf),
    /// File does not exist.
    NotFound(PathBuf),
    /// Header error.
    Header(HeaderError),
    /// Block size outside the supported range.
    InvalidBlockSize(usize),
    /// Block address out of bounds.
    BlockOutOfBounds { block: BlockId, total_blocks: u64 },
    /// File shorter than the header claims.
    Truncated { expected: u64, actual: u64 },
    /// Buffer pool exhausted.
    BufferPoolExhausted,
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
            Self::NotFound(p) => write!(f, "tree file {} does not exist", p.display()),
            Self::Header(e) => write!(f, "header error: {e}"),
            Self::InvalidBlockSize(size) => write!(f, "invalid block size: {size}"),
            Self::BlockOutOfBounds {
                block,
                total_blocks,
            } => {
                write!(
                    f,
                    "block {block} out of bounds (total blocks: {total_blocks})"
                )
            }
            Self::Truncated { expected, actual } => {
                write!(
                    f,
                    "file truncated: expected at least {expected} bytes, found {actual}"
                )
            }
            Self::BufferPoolExhausted => write!(f, "buffer pool exhausted"),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Header(e) => Some(e),
            Self::AlreadyExists(_)
            | Self::NotFound(_)
            | Self::InvalidBlockSize(_)
            | Self::BlockOutOfBounds { .. }
            | Self::Truncated { .. }
            | Self::BufferPoolExhausted => None,
        }
    }
}

impl From<FileError> for StorageError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Io(io_err) => Self::Io(io_err),
            FileError::BlockOutOfBounds {
                block,
                total_blocks,
            } => Self::BlockOutOfBounds {
                block,
                total_blocks,
            },
            FileError::AlreadyExists(path) => Self::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("file already exists: {}", path.display()),
            )),
            FileError::NotFound(path) => Self::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("tree file {} does not exist", path.display()),
            )),
            FileError::Header(e) => Self::Header(e.to_string()),
            FileError::InvalidBlockSize(_) | FileError::Truncated { .. } => {
                Self::Corruption(e.to_string())
            }
            FileError::BufferPoolExhausted => Self::BufferPoolExhausted,
        }
    }
}

impl BlockStore for BlockFile {
    fn buffer_pool(&self) -> &Arc<BufferPool> {
        Self::buffer_pool(self)
    }

    fn block_size(&self) -> usize {
        Self::block_size(self)
    }

    fn allocate_block(&mut self) -> Result<BlockId, StorageError> {
        Self::allocate_blocks(self, 1).map_err(StorageError::from)
    }

    fn read_block(&mut self, block: BlockId) -> Result<Page, StorageError> {
        Self::read_block(self, block).map_err(StorageError::from)
    }

    fn write_block(&mut self, block: BlockId, page: &Page) -> Result<(), StorageError> {
        Self::write_block(self, block, page).map_err(StorageError::from)
    }

    fn total_blocks(&self) -> u64 {
        Self::total_blocks(self)
    }

    fn header(&self) -> &TreeHeader {
        Self::header(self)
    }

    fn header_mut(&mut self) -> &mut TreeHeader {
        Self::header_mut(self)
    }

    fn write_header(&mut self) -> Result<(), StorageError> {
        Self::write_header(self).map_err(StorageError::from)
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        Self::sync(self).map_err(StorageError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer_pool::DEFAULT_POOL_CAPACITY;
    use std::fs;
    use tempfile::tempdir;

    fn test_pool(block_size: usize) -> Arc<BufferPool> {
        BufferPool::new(16, block_size)
    }

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bin");

        {
            let file = BlockFile::create(&path, test_pool(512)).expect("create file");
            assert_eq!(file.total_blocks(), 1);
            assert_eq!(file.block_size(), 512);
        }

        {
            let file = BlockFile::open(&path, DEFAULT_POOL_CAPACITY).expect("open file");
            assert_eq!(file.total_blocks(), 1);
            assert_eq!(file.block_size(), 512);
            assert_eq!(file.header().block_size, 512);
        }
    }

    #[test]
    fn test_create_already_exists() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bin");

        fs::write(&path, b"existing").expect("write file");

        let result = BlockFile::create(&path, test_pool(512));
        assert!(matches!(result, Err(FileError::AlreadyExists(_))));
    }

    #[test]
    fn test_create_rejects_tiny_blocks() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bin");

        let result = BlockFile::create(&path, test_pool(64));
        assert!(matches!(result, Err(FileError::InvalidBlockSize(64))));
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("missing.bin");

        let result = BlockFile::open(&path, 4);
        assert!(matches!(result, Err(FileError::NotFound(_))));
    }

    #[test]
    fn test_allocate_and_write_blocks() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bin");

        let mut file = BlockFile::create(&path, test_pool(256)).expect("create file");

        let first = file.allocate_blocks(5).expect("allocate");
        assert_eq!(first, 1); // Block 0 is the header
        assert_eq!(file.total_blocks(), 6);

        let next = BlockStore::allocate_block(&mut file).expect("allocate one");
        assert_eq!(next, 6);

        let mut page = file.buffer_pool().lease_page_zeroed().expect("lease page");
        page.write_bytes(0, b"hello world");
        file.write_block(3, &page).expect("write block");
        drop(page);

        let read_page = file.read_block(3).expect("read block");
        assert_eq!(read_page.read_bytes(0, 11), b"hello world");
    }

    #[test]
    fn test_block_out_of_bounds() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bin");

        let mut file = BlockFile::create(&path, test_pool(512)).expect("create file");

        let result = file.read_block(100);
        assert!(matches!(result, Err(FileError::BlockOutOfBounds { .. })));
    }

    #[test]
    fn test_header_persistence() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bin");

        {
            let mut file = BlockFile::create(&path, test_pool(1024)).expect("create file");
            file.allocate_blocks(3).expect("allocate");
            file.header_mut().root = 3;
            file.header_mut().height = 2;
            file.write_header().expect("write header");
            file.sync().expect("sync");
        }

        {
            let file = BlockFile::open(&path, 4).expect("open file");
            assert_eq!(file.header().root, 3);
            assert_eq!(file.header().height, 2);
            assert_eq!(file.total_blocks(), 4);
            assert_eq!(file.block_size(), 1024);
        }
    }

    #[test]
    fn test_block_data_persistence() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bin");

        {
            let mut file = BlockFile::create(&path, test_pool(512)).expect("create file");
            file.allocate_blocks(2).expect("allocate");

            let mut page = file.buffer_pool().lease_page_zeroed().expect("lease page");
            page.write_u64(100, 0xDEAD_BEEF_CAFE_BABE);
            file.write_block(1, &page).expect("write");
            drop(page);
            file.write_header().expect("write header");
            file.sync().expect("sync");
        }

        {
            let mut file = BlockFile::open(&path, 4).expect("open file");
            let page = file.read_block(1).expect("read");
            assert_eq!(page.read_u64(100), 0xDEAD_BEEF_CAFE_BABE);
        }
    }

    #[test]
    fn test_open_detects_truncation() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("tree.bin");

        {
            let mut file = BlockFile::create(&path, test_pool(512)).expect("create file");
            file.allocate_blocks(4).expect("allocate");
            file.write_header().expect("write header");
            file.sync().expect("sync");
        }

        let handle = OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("reopen raw");
        handle.set_len(2 * 512).expect("truncate");
        drop(handle);

        let result = BlockFile::open(&path, 4);
        assert!(matches!(result, Err(FileError::Truncated { .. })));
    }
}
