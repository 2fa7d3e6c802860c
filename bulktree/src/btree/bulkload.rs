//! Bottom-up bulk loading.
//!
//! A sorted entry slice becomes a tree one level at a time: entries fill the
//! leaves left to right, then each level's nodes are routed to by a new
//! level of index nodes until a single node remains. That node is the root.
//!
//! The same per-level construction runs on the sequential path and inside
//! every parallel worker. Each level records the exact blocks it allocated,
//! so building the next level never assumes a contiguous address range.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::btree::node::{IndexNode, LeafNode, Node, NodeCapacity, NodeError};
use crate::btree::tree::BTreeError;
use crate::entry::Entry;
use crate::storage::{BlockId, BlockStore, BufferPool, StorageError};

/// A block store shared between builders.
///
/// Every call takes the lock for exactly one allocation, read or write.
/// Node encoding and decoding happen outside the lock.
pub struct SharedStore<'a, S: BlockStore> {
    store: Mutex<&'a mut S>,
    pool: Arc<BufferPool>,
}

impl<'a, S: BlockStore> SharedStore<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        let pool = Arc::clone(store.buffer_pool());
        Self {
            store: Mutex::new(store),
            pool,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, &'a mut S>, BTreeError> {
        self.store.lock().map_err(|_| BTreeError::LockPoisoned)
    }

    /// Allocate one block.
    pub fn allocate(&self) -> Result<BlockId, BTreeError> {
        Ok(self.lock()?.allocate_block()?)
    }

    /// Read and decode the node stored in `block`.
    pub fn read_node(&self, block: BlockId) -> Result<Node, BTreeError> {
        let page = self.lock()?.read_block(block)?;
        Ok(Node::from_page(block, &page)?)
    }

    /// Encode `node` and write it to its block.
    pub fn write_node(&self, node: &Node) -> Result<(), BTreeError> {
        let mut page = self
            .pool
            .lease_page_zeroed()
            .ok_or(StorageError::BufferPoolExhausted)?;
        node.write_to_page(&mut page);
        self.lock()?.write_block(node.block(), &page)?;
        Ok(())
    }
}

/// The blocks one builder allocated at one level, in sibling order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelBlocks {
    pub level: u8,
    pub blocks: Vec<BlockId>,
}

impl LevelBlocks {
    /// First block of the level.
    #[must_use]
    pub fn start(&self) -> Option<BlockId> {
        self.blocks.first().copied()
    }

    /// Last block of the level.
    #[must_use]
    pub fn end(&self) -> Option<BlockId> {
        self.blocks.last().copied()
    }
}

/// The subtree one builder produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResult {
    /// One entry per level, leaves first.
    pub levels: Vec<LevelBlocks>,
    /// Top block of the subtree.
    pub root: BlockId,
    /// Number of entries loaded into the leaves.
    pub entries: usize,
}

impl WorkerResult {
    /// Level of the subtree root.
    #[must_use]
    pub fn height(&self) -> u8 {
        self.levels.last().map_or(0, |level| level.level)
    }
}

/// What a finished build hands back to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    pub root: BlockId,
    pub height: u8,
    pub entries: usize,
}

impl From<&WorkerResult> for BuildOutcome {
    fn from(result: &WorkerResult) -> Self {
        Self {
            root: result.root,
            height: result.height(),
            entries: result.entries,
        }
    }
}

/// Fills one level of nodes left to right.
///
/// A successor node is only allocated when an entry arrives for a full
/// node. At that point the full node is linked to its successor, flushed
/// and dropped.
pub struct LevelWriter<'s, 'a, S: BlockStore> {
    shared: &'s SharedStore<'a, S>,
    level: u8,
    capacity: NodeCapacity,
    active: Option<Node>,
    blocks: Vec<BlockId>,
}

impl<'s, 'a, S: BlockStore> LevelWriter<'s, 'a, S> {
    pub const fn new(shared: &'s SharedStore<'a, S>, level: u8, capacity: NodeCapacity) -> Self {
        Self {
            shared,
            level,
            capacity,
            active: None,
            blocks: Vec::new(),
        }
    }

    /// The node that should receive the next entry.
    fn active_node(&mut self) -> Result<&mut Node, BTreeError> {
        if let Some(node) = self.active.take_if(|node| !node.is_full()) {
            return Ok(self.active.insert(node));
        }

        let block = self.shared.allocate()?;
        let mut node = if self.level == 0 {
            Node::Leaf(LeafNode::new(block, self.capacity.leaf))
        } else {
            Node::Index(IndexNode::new(block, self.level, self.capacity.index))
        };

        if let Some(mut full) = self.active.take() {
            full.set_right_sibling(Some(block));
            node.set_left_sibling(Some(full.block()));
            self.shared.write_node(&full)?;
        }

        self.blocks.push(block);
        Ok(self.active.insert(node))
    }

    /// Append a point entry to the level's active leaf.
    pub fn push_entry(&mut self, entry: Entry) -> Result<(), BTreeError> {
        match self.active_node()? {
            Node::Leaf(leaf) => Ok(leaf.push(entry.id, entry.key)?),
            Node::Index(index) => Err(NodeError::WrongNodeType(index.block()).into()),
        }
    }

    /// Append a routing entry to the level's active index node.
    pub fn push_route(&mut self, key: f32, son: BlockId) -> Result<(), BTreeError> {
        match self.active_node()? {
            Node::Index(index) => Ok(index.push(key, son)?),
            Node::Leaf(leaf) => Err(NodeError::WrongNodeType(leaf.block()).into()),
        }
    }

    /// Flush the last node and return the level's blocks.
    pub fn finish(mut self) -> Result<LevelBlocks, BTreeError> {
        if let Some(last) = self.active.take() {
            self.shared.write_node(&last)?;
        }
        Ok(LevelBlocks {
            level: self.level,
            blocks: self.blocks,
        })
    }
}

/// Build one index level over `children`, in order.
///
/// Each child is read back to obtain the key that routes to it.
pub fn build_index_level<S: BlockStore>(
    shared: &SharedStore<'_, S>,
    children: &[BlockId],
    level: u8,
    capacity: NodeCapacity,
) -> Result<LevelBlocks, BTreeError> {
    let mut writer = LevelWriter::new(shared, level, capacity);
    for &child in children {
        let node = shared.read_node(child)?;
        writer.push_route(node.representative_key(), child)?;
    }
    writer.finish()
}

/// Build a complete subtree over `entries`, which must be sorted by key.
pub fn build_subtree<S: BlockStore>(
    shared: &SharedStore<'_, S>,
    entries: &[Entry],
    capacity: NodeCapacity,
) -> Result<WorkerResult, BTreeError> {
    if entries.is_empty() {
        return Err(BTreeError::EmptyInput);
    }

    let mut leaves = LevelWriter::new(shared, 0, capacity);
    for entry in entries {
        leaves.push_entry(*entry)?;
    }
    let mut levels = vec![leaves.finish()?];

    while let Some(below) = levels.last().filter(|level| level.blocks.len() > 1) {
        let level = below.level.checked_add(1).ok_or(NodeError::LevelOverflow)?;
        let built = build_index_level(shared, &below.blocks, level, capacity)?;
        tracing::debug!("level {} built with {} nodes", level, built.blocks.len());
        levels.push(built);
    }

    let root = levels
        .last()
        .and_then(LevelBlocks::start)
        .ok_or(BTreeError::EmptyInput)?;

    Ok(WorkerResult {
        levels,
        root,
        entries: entries.len(),
    })
}

/// Sequential bulk load of sorted `entries` into `store`.
pub fn bulkload<S: BlockStore>(
    store: &mut S,
    entries: &[Entry],
    capacity: NodeCapacity,
) -> Result<BuildOutcome, BTreeError> {
    let shared = SharedStore::new(store);
    let result = build_subtree(&shared, entries, capacity)?;
    Ok(BuildOutcome::from(&result))
}
