//! In-memory block storage with fault injection.
//!
//! `MemoryStore` implements `BlockStore` without touching the filesystem.
//! It can inject faults at the I/O boundary:
//! - Read, write and sync errors at a configurable rate
//! - Allocation failure after a fixed number of allocations
//! - Address gaps between allocations, as if another allocator shared the
//!   address space

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::buffer_pool::{BufferPool, DEFAULT_POOL_CAPACITY};
use crate::storage::header::TreeHeader;
use crate::storage::io::{BlockStore, StorageError};
use crate::storage::page::{BlockId, Page};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Fail every allocation after this many have succeeded.
    pub fail_allocation_after: Option<u64>,
    /// Number of addresses skipped after each allocation.
    pub allocation_gap: u64,
}

impl FaultConfig {
    /// Fail allocation once `count` blocks have been handed out.
    #[must_use]
    pub fn fail_allocation_after(count: u64) -> Self {
        Self {
            fail_allocation_after: Some(count),
            ..Self::default()
        }
    }

    /// Leave `gap` unused addresses after every allocated block.
    #[must_use]
    pub fn with_allocation_gap(gap: u64) -> Self {
        Self {
            allocation_gap: gap,
            ..Self::default()
        }
    }
}

/// Statistics about in-memory storage operations.
#[derive(Debug, Default, Clone)]
pub struct MemoryStoreStats {
    /// Number of block reads.
    pub reads: u64,
    /// Number of block writes.
    pub writes: u64,
    /// Number of blocks allocated.
    pub allocations: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected faults of any kind.
    pub injected_faults: u64,
}

/// In-memory `BlockStore` for deterministic testing.
///
/// The seed makes fault injection reproducible: the same seed produces the
/// same sequence of faults.
pub struct MemoryStore {
    blocks: HashMap<BlockId, Box<[u8]>>,
    header: TreeHeader,
    buffer_pool: Arc<BufferPool>,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryStoreStats,
}

impl MemoryStore {
    /// Create an empty store with `block_size` blocks and no faults.
    #[must_use]
    pub fn new(block_size: u32, seed: u64) -> Self {
        Self::with_config(block_size, seed, FaultConfig::default())
    }

    /// Create an empty store with custom fault configuration.
    #[must_use]
    pub fn with_config(block_size: u32, seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            blocks: HashMap::new(),
            header: TreeHeader::new(block_size),
            buffer_pool: BufferPool::new(DEFAULT_POOL_CAPACITY, block_size as usize),
            fault_config,
            rng: StdRng::seed_from_u64(seed),
            stats: MemoryStoreStats::default(),
        }
    }

    /// Get the current statistics.
    #[must_use]
    pub const fn stats(&self) -> &MemoryStoreStats {
        &self.stats
    }

    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        let hit = self.rng.random::<f64>() < rate;
        if hit {
            self.stats.injected_faults += 1;
        }
        hit
    }

    const fn check_bounds(&self, block: BlockId) -> Result<(), StorageError> {
        if block >= self.header.block_count {
            return Err(StorageError::BlockOutOfBounds {
                block,
                total_blocks: self.header.block_count,
            });
        }
        Ok(())
    }
}

impl BlockStore for MemoryStore {
    fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    fn block_size(&self) -> usize {
        self.buffer_pool.block_size()
    }

    fn allocate_block(&mut self) -> Result<BlockId, StorageError> {
        if let Some(limit) = self.fault_config.fail_allocation_after
            && self.stats.allocations >= limit
        {
            self.stats.injected_faults += 1;
            return Err(StorageError::InjectedFault(
                "simulated allocation failure".to_string(),
            ));
        }

        let block = self.header.block_count;
        self.header.block_count = block + 1 + self.fault_config.allocation_gap;
        self.stats.allocations += 1;
        Ok(block)
    }

    fn read_block(&mut self, block: BlockId) -> Result<Page, StorageError> {
        self.stats.reads += 1;
        self.check_bounds(block)?;

        if self.should_inject_fault(self.fault_config.read_error_rate) {
            return Err(StorageError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        // Blocks never written read back as zeroes, like a freshly extended file
        let mut page = self
            .buffer_pool
            .lease_page_zeroed()
            .ok_or(StorageError::BufferPoolExhausted)?;
        if let Some(data) = self.blocks.get(&block) {
            page.as_bytes_mut().copy_from_slice(data);
        }
        Ok(page)
    }

    fn write_block(&mut self, block: BlockId, page: &Page) -> Result<(), StorageError> {
        self.stats.writes += 1;
        self.check_bounds(block)?;

        if page.len() != self.block_size() {
            return Err(StorageError::Corruption(format!(
                "page of {} bytes written to {}-byte block",
                page.len(),
                self.block_size()
            )));
        }

        if self.should_inject_fault(self.fault_config.write_error_rate) {
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        self.blocks
            .insert(block, page.as_bytes().to_vec().into_boxed_slice());
        Ok(())
    }

    fn total_blocks(&self) -> u64 {
        self.header.block_count
    }

    fn header(&self) -> &TreeHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut TreeHeader {
        &mut self.header
    }

    fn write_header(&mut self) -> Result<(), StorageError> {
        let page = self
            .header
            .to_page(&self.buffer_pool)
            .ok_or(StorageError::BufferPoolExhausted)?;
        self.blocks
            .insert(0, page.as_bytes().to_vec().into_boxed_slice());
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.stats.syncs += 1;

        if self.should_inject_fault(self.fault_config.sync_error_rate) {
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }

        // Writes are already "durable"
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_read_write() {
        let mut store = MemoryStore::new(256, 42);

        let block = store.allocate_block().expect("allocate");
        assert_eq!(block, 1);

        let mut page = store.buffer_pool().lease_page_zeroed().expect("lease");
        page.write_bytes(0, b"hello world");
        store.write_block(block, &page).expect("write");
        drop(page);

        let read_page = store.read_block(block).expect("read");
        assert_eq!(read_page.read_bytes(0, 11), b"hello world");
        assert_eq!(store.stats().reads, 1);
        assert_eq!(store.stats().writes, 1);
    }

    #[test]
    fn test_unwritten_block_reads_zeroed() {
        let mut store = MemoryStore::new(128, 1);
        let block = store.allocate_block().expect("allocate");

        let page = store.read_block(block).expect("read");
        assert!(page.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_out_of_bounds() {
        let mut store = MemoryStore::new(128, 1);
        let result = store.read_block(5);
        assert!(matches!(
            result,
            Err(StorageError::BlockOutOfBounds { block: 5, .. })
        ));
    }

    #[test]
    fn test_allocation_failure() {
        let mut store = MemoryStore::with_config(128, 1, FaultConfig::fail_allocation_after(2));

        assert!(store.allocate_block().is_ok());
        assert!(store.allocate_block().is_ok());
        assert!(matches!(
            store.allocate_block(),
            Err(StorageError::InjectedFault(_))
        ));
        assert_eq!(store.stats().injected_faults, 1);
    }

    #[test]
    fn test_allocation_gap() {
        let mut store = MemoryStore::with_config(128, 1, FaultConfig::with_allocation_gap(2));

        let a = store.allocate_block().expect("allocate");
        let b = store.allocate_block().expect("allocate");
        let c = store.allocate_block().expect("allocate");
        assert_eq!((a, b, c), (1, 4, 7));
        assert_eq!(store.total_blocks(), 10);
    }

    #[test]
    fn test_write_fault_injection_is_deterministic() {
        let config = FaultConfig {
            write_error_rate: 0.5,
            ..FaultConfig::default()
        };

        let outcomes = |seed| {
            let mut store = MemoryStore::with_config(128, seed, config.clone());
            let block = store.allocate_block().expect("allocate");
            let page = Page::new(128);
            (0..32)
                .map(|_| store.write_block(block, &page).is_ok())
                .collect::<Vec<_>>()
        };

        let first = outcomes(7);
        assert_eq!(first, outcomes(7));
        assert!(first.iter().any(|ok| *ok));
        assert!(first.iter().any(|ok| !*ok));
    }

    #[test]
    fn test_header_write() {
        let mut store = MemoryStore::new(512, 1);
        store.allocate_block().expect("allocate");
        store.header_mut().root = 1;
        store.write_header().expect("write header");

        let page = store.read_block(0).expect("read header block");
        let header = TreeHeader::from_page(&page).expect("parse header");
        assert_eq!(header.root, 1);
        assert_eq!(header.block_count, 2);
    }
}
