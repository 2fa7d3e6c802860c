//! Buffer pool for pre-allocated block buffers.
//!
//! The buffer pool reduces allocation overhead during bulk load by keeping a
//! pool of block-sized scratch buffers that are leased out and returned
//! automatically.
//!
//! # Design
//!
//! - Pre-allocates all buffers at construction time
//! - Uses a free list (Vec) for O(1) lease/return
//! - Returns buffers automatically via RAII (Drop trait on Page)
//! - Thread-safe: uses Mutex for internal synchronization
//!
//! # Invariants
//!
//! - Every buffer is exactly `block_size` bytes
//! - Capacity only grows, through `ensure_capacity`
//! - Free list size + leased count == capacity

use std::sync::{Arc, Mutex};

use crate::storage::page::Page;

/// Default buffer pool capacity in buffers.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Free list plus the capacity it is accounted against.
struct PoolState {
    free_list: Vec<Box<[u8]>>,
    capacity: usize,
}

/// A buffer pool that pre-allocates block buffers.
///
/// # Pre-conditions
/// - `capacity` must be > 0 when creating
///
/// # Post-conditions
/// - All buffers are zeroed on creation
/// - Free list contains `capacity` buffers
pub struct BufferPool {
    state: Mutex<PoolState>,
    block_size: usize,
}

impl BufferPool {
    /// Create a new buffer pool of `capacity` buffers, each `block_size` bytes.
    ///
    /// # Panics
    /// Panics if capacity is 0.
    #[must_use]
    pub fn new(capacity: usize, block_size: usize) -> Arc<Self> {
        assert!(capacity > 0, "Buffer pool capacity must be positive");

        let free_list = (0..capacity)
            .map(|_| vec![0u8; block_size].into_boxed_slice())
            .collect();

        Arc::new(Self {
            state: Mutex::new(PoolState {
                free_list,
                capacity,
            }),
            block_size,
        })
    }

    /// Size in bytes of every buffer handed out by this pool.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Lease a buffer from the pool.
    ///
    /// Returns `None` if the pool is exhausted. Buffer contents are undefined.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn lease(&self) -> Option<Box<[u8]>> {
        self.state.lock().expect("lock poisoned").free_list.pop()
    }

    /// Lease a zeroed buffer from the pool.
    pub fn lease_zeroed(&self) -> Option<Box<[u8]>> {
        let mut buffer = self.lease()?;
        buffer.fill(0);
        Some(buffer)
    }

    /// Lease a page from the pool. Page contents are undefined.
    pub fn lease_page(self: &Arc<Self>) -> Option<Page> {
        let buffer = self.lease()?;
        Some(Page::from_pool(buffer, Arc::clone(self)))
    }

    /// Lease a zeroed page from the pool.
    pub fn lease_page_zeroed(self: &Arc<Self>) -> Option<Page> {
        let buffer = self.lease_zeroed()?;
        Some(Page::from_pool(buffer, Arc::clone(self)))
    }

    /// Return a buffer to the pool.
    ///
    /// # Panics
    /// Panics if returning would exceed capacity or the buffer has the wrong
    /// size (both indicate a bug).
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn return_buffer(&self, buffer: Box<[u8]>) {
        assert_eq!(
            buffer.len(),
            self.block_size,
            "Buffer pool received a buffer of the wrong size"
        );
        let mut state = self.state.lock().expect("lock poisoned");
        assert!(
            state.free_list.len() < state.capacity,
            "Buffer pool overflow: returning buffer to full pool"
        );
        state.free_list.push(buffer);
    }

    /// Grow the pool so that it holds at least `min_capacity` buffers.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn ensure_capacity(&self, min_capacity: usize) {
        let mut state = self.state.lock().expect("lock poisoned");
        let missing = min_capacity.saturating_sub(state.capacity);
        state.capacity += missing;
        state
            .free_list
            .extend((0..missing).map(|_| vec![0u8; self.block_size].into_boxed_slice()));
        drop(state);
    }

    /// Get the number of available buffers.
    #[must_use]
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn available(&self) -> usize {
        self.state.lock().expect("lock poisoned").free_list.len()
    }

    /// Get the total capacity.
    #[must_use]
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn capacity(&self) -> usize {
        self.state.lock().expect("lock poisoned").capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let pool = BufferPool::new(10, 512);
        assert_eq!(pool.capacity(), 10);
        assert_eq!(pool.available(), 10);
        assert_eq!(pool.block_size(), 512);
    }

    #[test]
    fn test_lease_and_return() {
        let pool = BufferPool::new(2, 128);

        let buf1 = pool.lease().expect("first lease");
        assert_eq!(buf1.len(), 128);
        assert_eq!(pool.available(), 1);

        let buf2 = pool.lease().expect("second lease");
        assert_eq!(pool.available(), 0);

        // Pool exhausted
        assert!(pool.lease().is_none());

        pool.return_buffer(buf1);
        assert_eq!(pool.available(), 1);

        pool.return_buffer(buf2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_lease_page_zeroed() {
        let pool = BufferPool::new(1, 256);

        {
            let mut page = pool.lease_page_zeroed().expect("should lease");
            page.write_u8(0, 0xFF);
            page.write_u8(100, 0xAB);
        }

        // Dropped page gave its buffer back; leasing zeroed clears it
        let page = pool.lease_page_zeroed().expect("should lease");
        assert_eq!(page.read_u8(0), 0);
        assert_eq!(page.read_u8(100), 0);
    }

    #[test]
    fn test_pages_return_on_drop() {
        let pool = BufferPool::new(2, 128);
        {
            let _page1 = pool.lease_page().expect("should lease");
            let _page2 = pool.lease_page().expect("should lease");
            assert!(pool.lease_page().is_none());
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_ensure_capacity_grows() {
        let pool = BufferPool::new(2, 128);
        let _held = pool.lease_page().expect("should lease");

        pool.ensure_capacity(6);
        assert_eq!(pool.capacity(), 6);
        assert_eq!(pool.available(), 5);

        // Never shrinks
        pool.ensure_capacity(3);
        assert_eq!(pool.capacity(), 6);
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn test_zero_capacity_panics() {
        let _ = BufferPool::new(0, 128);
    }

    #[test]
    #[should_panic(expected = "Buffer pool overflow")]
    fn test_return_to_full_pool_panics() {
        let pool = BufferPool::new(1, 128);
        pool.return_buffer(vec![0u8; 128].into_boxed_slice());
    }
}
