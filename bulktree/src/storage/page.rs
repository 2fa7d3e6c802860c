//! Block buffers and constants for the block file.
//!
//! A tree file is a sequence of fixed-size blocks. The block size is chosen
//! when the file is created and never changes afterwards.

use std::sync::Arc;

use crate::storage::buffer_pool::BufferPool;

/// A block address (0-indexed block number).
pub type BlockId = u64;

/// Block 0 holds the tree header, so no node ever lives there.
/// On disk a sibling pointer of 0 means "no sibling".
pub const NO_BLOCK: BlockId = 0;

/// Smallest supported block size in bytes.
pub const MIN_BLOCK_SIZE: usize = 128;

/// Largest supported block size in bytes.
pub const MAX_BLOCK_SIZE: usize = 65_536;

/// Block size used when none is configured.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Check that a block size is within the supported range.
#[must_use]
pub const fn is_valid_block_size(block_size: usize) -> bool {
    block_size >= MIN_BLOCK_SIZE && block_size <= MAX_BLOCK_SIZE
}

/// Page type identifiers stored in page headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Tree header (block 0 only)
    Header = 0x01,
    /// B-tree index node
    BTreeIndex = 0x03,
    /// B-tree leaf node
    BTreeLeaf = 0x04,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Header),
            0x03 => Ok(Self::BTreeIndex),
            0x04 => Ok(Self::BTreeLeaf),
            _ => Err(value),
        }
    }
}

/// Common page header present at the start of every node block.
///
/// Layout:
/// - `page_type`: 1 byte
/// - `flags`: 1 byte
/// - `checksum`: 4 bytes (CRC32)
/// - `reserved`: 2 bytes
///
/// Total: 8 bytes
#[derive(Debug, Copy, Clone)]
pub struct PageHeader {
    pub page_type: PageType,
    pub flags: u8,
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 8;

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.page_type as u8;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.checksum.to_le_bytes());
        // bytes 6-7 reserved
        buf
    }

    /// Deserialize a header from bytes.
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Result<Self, PageError> {
        let page_type = PageType::try_from(bytes[0]).map_err(PageError::InvalidPageType)?;
        let flags = bytes[1];
        let checksum = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);

        Ok(Self {
            page_type,
            flags,
            checksum,
        })
    }

    /// Read the header from the first bytes of a page.
    pub fn from_page(page: &Page) -> Result<Self, PageError> {
        let mut bytes = [0u8; Self::SIZE];
        bytes.copy_from_slice(page.read_bytes(0, Self::SIZE));
        Self::from_bytes(bytes)
    }
}

/// A raw block buffer.
///
/// Pages leased from a [`BufferPool`] hand their buffer back to the pool
/// when dropped.
pub struct Page {
    data: Box<[u8]>,
    pool: Option<Arc<BufferPool>>,
}

impl Page {
    /// Create a new zeroed page that is not backed by a pool.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            data: vec![0u8; block_size].into_boxed_slice(),
            pool: None,
        }
    }

    /// Wrap a pool buffer. The buffer goes back to `pool` on drop.
    #[must_use]
    pub(crate) const fn from_pool(data: Box<[u8]>, pool: Arc<BufferPool>) -> Self {
        Self {
            data,
            pool: Some(pool),
        }
    }

    /// Size of the page in bytes (the block size).
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the page has no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get mutable access to the raw page data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read a u8 at the given offset.
    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    /// Write a u8 at the given offset.
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    /// Read a u32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    /// Write a u32 (little-endian) at the given offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Read an f32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_f32(&self, offset: usize) -> f32 {
        f32::from_bits(self.read_u32(offset))
    }

    /// Write an f32 (little-endian) at the given offset.
    pub fn write_f32(&mut self, offset: usize, value: f32) {
        self.write_u32(offset, value.to_bits());
    }

    /// Compute CRC32 checksum of the page data (excluding the checksum field itself).
    /// Assumes checksum is stored at bytes 2-5 of the header.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[0..2]); // page_type + flags
        hasher.update(&[0u8; 4]); // zero out checksum field
        hasher.update(&self.data[6..]); // rest of page
        hasher.finalize()
    }

    /// Compute the checksum and store it in the page header.
    pub fn stamp_checksum(&mut self) {
        let checksum = self.compute_checksum();
        self.write_u32(2, checksum);
    }

    /// Check the stored checksum against the page contents.
    pub fn verify_checksum(&self) -> Result<(), PageError> {
        let expected = self.read_u32(2);
        let actual = self.compute_checksum();
        if expected == actual {
            Ok(())
        } else {
            Err(PageError::ChecksumMismatch { expected, actual })
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.return_buffer(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = self.data.len().min(16);
        f.debug_struct("Page")
            .field("len", &self.data.len())
            .field("first_16_bytes", &&self.data[..shown])
            .finish_non_exhaustive()
    }
}

/// Errors related to page operations.
#[derive(Debug)]
pub enum PageError {
    /// Invalid page type byte.
    InvalidPageType(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPageType(v) => write!(f, "invalid page type: 0x{v:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for PageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_header_roundtrip() {
        let header = PageHeader {
            page_type: PageType::BTreeLeaf,
            flags: 0x42,
            checksum: 0xDEAD_BEEF,
        };

        let bytes = header.to_bytes();
        let restored = PageHeader::from_bytes(bytes).expect("should parse");

        assert_eq!(restored.page_type, PageType::BTreeLeaf);
        assert_eq!(restored.flags, 0x42);
        assert_eq!(restored.checksum, 0xDEAD_BEEF);
    }

    #[test]
    fn test_page_read_write() {
        let mut page = Page::new(DEFAULT_BLOCK_SIZE);
        assert_eq!(page.len(), DEFAULT_BLOCK_SIZE);

        page.write_u8(0, 0xFF);
        assert_eq!(page.read_u8(0), 0xFF);

        page.write_u32(100, 0x1234_5678);
        assert_eq!(page.read_u32(100), 0x1234_5678);

        page.write_u64(200, 0x0102_0304_0506_0708);
        assert_eq!(page.read_u64(200), 0x0102_0304_0506_0708);

        page.write_f32(300, -12.5);
        assert!((page.read_f32(300) - -12.5).abs() < f32::EPSILON);

        page.write_bytes(500, b"hello");
        assert_eq!(page.read_bytes(500, 5), b"hello");
    }

    #[test]
    fn test_page_type_conversion() {
        assert_eq!(PageType::try_from(0x01), Ok(PageType::Header));
        assert_eq!(PageType::try_from(0x04), Ok(PageType::BTreeLeaf));
        assert!(PageType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut page = Page::new(MIN_BLOCK_SIZE);
        let header = PageHeader {
            page_type: PageType::BTreeIndex,
            flags: 0,
            checksum: 0,
        };
        page.write_bytes(0, &header.to_bytes());
        page.write_u64(40, 77);
        page.stamp_checksum();
        assert!(page.verify_checksum().is_ok());

        page.write_u8(41, 0xAA);
        assert!(matches!(
            page.verify_checksum(),
            Err(PageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_block_size_range() {
        assert!(is_valid_block_size(DEFAULT_BLOCK_SIZE));
        assert!(is_valid_block_size(MIN_BLOCK_SIZE));
        assert!(!is_valid_block_size(MIN_BLOCK_SIZE - 1));
        assert!(!is_valid_block_size(MAX_BLOCK_SIZE + 1));
    }
}
