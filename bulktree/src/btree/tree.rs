//! The tree handle.
//!
//! `BTree` owns the block store, caches the root node and drives the bulk
//! loaders. The header in block 0 is rewritten whenever the handle is
//! closed or dropped after a build.

#![allow(clippy::cast_possible_truncation)]

use std::path::Path;

use crate::btree::bulkload::{self, BuildOutcome};
use crate::btree::node::{LeafNode, Node, NodeCapacity, NodeError};
use crate::btree::parallel;
use crate::entry::Entry;
use crate::storage::{
    BlockFile, BlockId, BlockStore, BufferPool, DEFAULT_BLOCK_SIZE, DEFAULT_POOL_CAPACITY,
    FileError, NO_BLOCK, StorageError,
};

/// Options for creating a new tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeOptions {
    /// Block size in bytes.
    pub block_size: usize,
    /// Lower the leaf capacity below what the block size allows.
    pub leaf_capacity: Option<usize>,
    /// Lower the index capacity below what the block size allows.
    pub index_capacity: Option<usize>,
    /// Number of scratch buffers in the buffer pool.
    pub pool_capacity: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            leaf_capacity: None,
            index_capacity: None,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl TreeOptions {
    #[must_use]
    pub const fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub const fn with_leaf_capacity(mut self, capacity: usize) -> Self {
        self.leaf_capacity = Some(capacity);
        self
    }

    #[must_use]
    pub const fn with_index_capacity(mut self, capacity: usize) -> Self {
        self.index_capacity = Some(capacity);
        self
    }
}

/// A bulk-loaded B+-tree over a block store.
pub struct BTree<S: BlockStore = BlockFile> {
    store: S,
    root: BlockId,
    root_node: Option<Node>,
    capacity: NodeCapacity,
    header_dirty: bool,
}

impl BTree<BlockFile> {
    /// Create a fresh tree file at `path`, replacing any existing file.
    pub fn init(path: &Path, options: &TreeOptions) -> Result<Self, BTreeError> {
        if options.pool_capacity == 0 {
            return Err(BTreeError::InvalidOptions(
                "buffer pool capacity must be positive".to_string(),
            ));
        }

        if path.exists() {
            tracing::warn!("Replacing existing tree file {}", path.display());
            std::fs::remove_file(path).map_err(FileError::Io)?;
        }

        let pool = BufferPool::new(options.pool_capacity, options.block_size);
        let file = BlockFile::create(path, pool)?;
        Self::with_store(file, options)
    }

    /// Reopen an existing tree file.
    pub fn restore(path: &Path) -> Result<Self, BTreeError> {
        let file = BlockFile::open(path, DEFAULT_POOL_CAPACITY)?;
        Self::from_store(file)
    }
}

impl<S: BlockStore> BTree<S> {
    /// Start a new tree in an empty store.
    ///
    /// Writes an empty leaf as the placeholder root. `options.block_size`
    /// must match the store's block size.
    pub fn with_store(mut store: S, options: &TreeOptions) -> Result<Self, BTreeError> {
        if options.block_size != store.block_size() {
            return Err(BTreeError::InvalidOptions(format!(
                "block size {} does not match the store's {}-byte blocks",
                options.block_size,
                store.block_size()
            )));
        }

        let capacity = NodeCapacity::with_overrides(
            store.block_size(),
            options.leaf_capacity,
            options.index_capacity,
        )?;

        let root = store.allocate_block()?;
        let placeholder = Node::Leaf(LeafNode::new(root, capacity.leaf));
        write_node(&mut store, &placeholder)?;

        let header = store.header_mut();
        header.root = root;
        header.height = 0;
        header.entry_count = 0;
        header.leaf_capacity = capacity.leaf as u32;
        header.index_capacity = capacity.index as u32;
        store.write_header()?;
        store.sync()?;

        Ok(Self {
            store,
            root,
            root_node: None,
            capacity,
            header_dirty: false,
        })
    }

    /// Open a tree from a store whose header already describes one.
    pub fn from_store(store: S) -> Result<Self, BTreeError> {
        let header = *store.header();
        if header.root == NO_BLOCK || header.root >= header.block_count {
            return Err(BTreeError::InvariantViolation(format!(
                "header root {} is not a node block",
                header.root
            )));
        }

        let capacity = NodeCapacity::with_overrides(
            store.block_size(),
            Some(header.leaf_capacity as usize),
            Some(header.index_capacity as usize),
        )?;

        Ok(Self {
            store,
            root: header.root,
            root_node: None,
            capacity,
            header_dirty: false,
        })
    }

    /// Block address of the root node.
    #[must_use]
    pub const fn root(&self) -> BlockId {
        self.root
    }

    /// Level of the root node.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.store.header().height
    }

    /// Number of entries stored in the leaves.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.store.header().entry_count
    }

    /// Node capacities the tree is built with.
    #[must_use]
    pub const fn capacity(&self) -> NodeCapacity {
        self.capacity
    }

    /// Block size of the underlying store.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.store.block_size()
    }

    /// Get a reference to the underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Get mutable access to the underlying store.
    #[allow(clippy::missing_const_for_fn)] // mutable references can't be const
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Sequentially bulk load `entries`, which must be sorted by key.
    ///
    /// Returns the new root block. An empty slice leaves the tree unchanged.
    pub fn bulkload(&mut self, entries: &[Entry]) -> Result<BlockId, BTreeError> {
        if entries.is_empty() {
            tracing::info!("No entries to load, keeping root {}", self.root);
            return Ok(self.root);
        }

        tracing::info!("Bulk loading {} entries sequentially", entries.len());
        let outcome = bulkload::bulkload(&mut self.store, entries, self.capacity)?;
        Ok(self.install(outcome))
    }

    /// Make a finished build the tree's contents.
    fn install(&mut self, outcome: BuildOutcome) -> BlockId {
        self.release_root();
        self.root = outcome.root;

        let header = self.store.header_mut();
        header.root = outcome.root;
        header.height = u32::from(outcome.height);
        header.entry_count = outcome.entries as u64;
        self.header_dirty = true;

        tracing::info!(
            "Bulk load complete: root={}, height={}, entries={}",
            outcome.root,
            outcome.height,
            outcome.entries
        );
        outcome.root
    }

    /// Read and decode the node stored in `block`.
    pub fn read_node(&mut self, block: BlockId) -> Result<Node, BTreeError> {
        let page = self.store.read_block(block)?;
        Ok(Node::from_page(block, &page)?)
    }

    /// Get the root node, reading it on first use.
    pub fn load_root(&mut self) -> Result<&Node, BTreeError> {
        let node = match self.root_node.take() {
            Some(node) => node,
            None => self.read_node(self.root)?,
        };
        Ok(self.root_node.insert(node))
    }

    /// Drop the cached root node.
    pub fn release_root(&mut self) {
        self.root_node = None;
    }

    /// Whether the root node is currently cached.
    #[must_use]
    pub const fn is_root_cached(&self) -> bool {
        self.root_node.is_some()
    }

    /// Block address of the leftmost leaf.
    fn leftmost_leaf(&mut self) -> Result<BlockId, BTreeError> {
        let mut block = self.root;
        loop {
            let node = self.read_node(block)?;
            if node.is_leaf() {
                return Ok(block);
            }
            block = node.son(0).ok_or_else(|| {
                BTreeError::InvariantViolation(format!("index node {block} has no children"))
            })?;
        }
    }

    /// Walk the leaves left to right through their sibling links.
    pub fn leaf_cursor(&mut self) -> Result<LeafCursor<'_, S>, BTreeError> {
        let first = self.leftmost_leaf()?;
        Ok(LeafCursor {
            tree: self,
            next: Some(first),
        })
    }

    /// Every entry id in leaf order.
    pub fn scan_ids(&mut self) -> Result<Vec<u32>, BTreeError> {
        let mut ids = Vec::with_capacity(self.entry_count() as usize);
        let mut cursor = self.leaf_cursor()?;
        while let Some(leaf) = cursor.next_leaf()? {
            ids.extend_from_slice(leaf.ids());
        }
        Ok(ids)
    }

    /// Write the header and sync the store.
    pub fn persist_header(&mut self) -> Result<(), BTreeError> {
        self.store.header_mut().root = self.root;
        self.store.write_header()?;
        self.store.sync()?;
        self.header_dirty = false;
        Ok(())
    }

    /// Persist the header and close the tree.
    pub fn close(mut self) -> Result<(), BTreeError> {
        self.persist_header()
    }
}

impl<S: BlockStore + Send> BTree<S> {
    /// Bulk load `entries` with `workers` threads.
    ///
    /// `entries` must be sorted by key. With fewer than two workers this is
    /// the sequential load.
    pub fn bulkload_parallel(
        &mut self,
        entries: &[Entry],
        workers: usize,
    ) -> Result<BlockId, BTreeError> {
        if workers <= 1 || entries.is_empty() {
            return self.bulkload(entries);
        }

        tracing::info!(
            "Bulk loading {} entries with {} workers",
            entries.len(),
            workers
        );
        let outcome = parallel::bulkload_parallel(&mut self.store, entries, workers, self.capacity)?;
        Ok(self.install(outcome))
    }
}

impl<S: BlockStore> Drop for BTree<S> {
    fn drop(&mut self) {
        if self.header_dirty
            && let Err(e) = self.persist_header()
        {
            tracing::error!("Failed to persist tree header: {e}");
        }
    }
}

fn write_node<S: BlockStore>(store: &mut S, node: &Node) -> Result<(), BTreeError> {
    let mut page = store
        .buffer_pool()
        .lease_page_zeroed()
        .ok_or(StorageError::BufferPoolExhausted)?;
    node.write_to_page(&mut page);
    store.write_block(node.block(), &page)?;
    Ok(())
}

/// Cursor over the leaf level, left to right.
pub struct LeafCursor<'t, S: BlockStore> {
    tree: &'t mut BTree<S>,
    next: Option<BlockId>,
}

impl<S: BlockStore> LeafCursor<'_, S> {
    /// Get the next leaf.
    pub fn next_leaf(&mut self) -> Result<Option<LeafNode>, BTreeError> {
        let Some(block) = self.next else {
            return Ok(None);
        };

        match self.tree.read_node(block)? {
            Node::Leaf(leaf) => {
                self.next = leaf.header.right_sibling;
                Ok(Some(leaf))
            }
            Node::Index(_) => Err(NodeError::WrongNodeType(block).into()),
        }
    }
}

/// Errors that can occur during B-tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// Storage error.
    Storage(StorageError),
    /// File I/O error.
    File(FileError),
    /// Node error.
    Node(NodeError),
    /// Workers built subtrees of different heights.
    HeightMismatch {
        worker: usize,
        expected: u8,
        actual: u8,
    },
    /// A worker thread could not be started.
    ThreadSpawn(std::io::Error),
    /// A worker thread panicked.
    WorkerPanicked { worker: usize },
    /// The shared store lock was poisoned.
    LockPoisoned,
    /// A builder was handed no entries.
    EmptyInput,
    /// Tree options that cannot be used.
    InvalidOptions(String),
    /// The tree on disk breaks a structural invariant.
    InvariantViolation(String),
    /// Writing the tree dump failed.
    Dump(std::io::Error),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::File(e) => write!(f, "file error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::HeightMismatch {
                worker,
                expected,
                actual,
            } => write!(
                f,
                "worker {worker} built a subtree of height {actual}, expected {expected}"
            ),
            Self::ThreadSpawn(e) => write!(f, "failed to spawn worker thread: {e}"),
            Self::WorkerPanicked { worker } => write!(f, "worker {worker} panicked"),
            Self::LockPoisoned => write!(f, "shared store lock poisoned"),
            Self::EmptyInput => write!(f, "no entries to build from"),
            Self::InvalidOptions(msg) => write!(f, "invalid tree options: {msg}"),
            Self::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            Self::Dump(e) => write!(f, "failed to write tree dump: {e}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::File(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::ThreadSpawn(e) | Self::Dump(e) => Some(e),
            Self::HeightMismatch { .. }
            | Self::WorkerPanicked { .. }
            | Self::LockPoisoned
            | Self::EmptyInput
            | Self::InvalidOptions(_)
            | Self::InvariantViolation(_) => None,
        }
    }
}

impl From<StorageError> for BTreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<FileError> for BTreeError {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

impl From<NodeError> for BTreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}
