//! B-tree node types and serialization.
//!
//! Every node occupies exactly one block:
//! - Leaf nodes: entry ids, with one stored key per bucket of 16 entries
//! - Index nodes: (routing key, child block) pairs
//!
//! Nodes on the same level are doubly linked through their sibling pointers.

#![allow(clippy::cast_possible_truncation)]

use crate::storage::{BlockId, NO_BLOCK, Page, PageError, PageHeader, PageType};

/// Node header layout (after page header):
/// - `level`: 1 byte (0 = leaf)
/// - `num_entries`: 4 bytes
/// - `left_sibling`: 8 bytes (0 if none)
/// - `right_sibling`: 8 bytes (0 if none)
/// - `representative_key`: 4 bytes (largest key in the subtree)
///
/// Total: 25 bytes
const NODE_HEADER_SIZE: usize = 25;

/// Offset where node data starts (after page header + node header).
pub const DATA_OFFSET: usize = PageHeader::SIZE + NODE_HEADER_SIZE;

/// Number of leaf entries that share one stored key.
pub const LEAF_BUCKET_SIZE: usize = 16;

/// Bytes per leaf entry id and per bucket key.
const LEAF_SLOT_SIZE: usize = 4;

/// Bytes used by one full leaf bucket: its key plus 16 ids.
const LEAF_BUCKET_BYTES: usize = LEAF_SLOT_SIZE * (LEAF_BUCKET_SIZE + 1);

/// Index entry size: key (4 bytes) + child block (8 bytes).
const INDEX_ENTRY_SIZE: usize = 12;

/// Smallest usable index fan-out.
pub const MIN_INDEX_CAPACITY: usize = 2;

/// Maximum number of entries a leaf of `block_size` bytes can hold.
///
/// A leaf with `n` entries needs `4 * ceil(n / 16)` bytes of bucket keys and
/// `4 * n` bytes of ids.
#[must_use]
pub const fn max_leaf_capacity(block_size: usize) -> usize {
    let space = block_size.saturating_sub(DATA_OFFSET);
    let full_buckets = space / LEAF_BUCKET_BYTES;
    let rem = space % LEAF_BUCKET_BYTES;

    // A partial bucket needs room for its key and at least one id
    let partial = if rem >= 2 * LEAF_SLOT_SIZE {
        let fit = (rem - LEAF_SLOT_SIZE) / LEAF_SLOT_SIZE;
        if fit < LEAF_BUCKET_SIZE - 1 {
            fit
        } else {
            LEAF_BUCKET_SIZE - 1
        }
    } else {
        0
    };

    full_buckets * LEAF_BUCKET_SIZE + partial
}

/// Maximum number of routing entries an index node of `block_size` bytes can hold.
#[must_use]
pub const fn max_index_capacity(block_size: usize) -> usize {
    block_size.saturating_sub(DATA_OFFSET) / INDEX_ENTRY_SIZE
}

/// Number of bucket keys stored for `num_entries` leaf entries.
#[must_use]
pub const fn bucket_count(num_entries: usize) -> usize {
    num_entries.div_ceil(LEAF_BUCKET_SIZE)
}

/// Per-node entry limits for one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCapacity {
    /// Maximum entries per leaf.
    pub leaf: usize,
    /// Maximum routing entries per index node.
    pub index: usize,
}

impl NodeCapacity {
    /// The largest capacities that fit a block of `block_size` bytes.
    pub fn for_block_size(block_size: usize) -> Result<Self, NodeError> {
        Self::with_overrides(block_size, None, None)
    }

    /// Capacities for `block_size`, optionally lowered.
    ///
    /// Overrides may only lower a capacity; the leaf must hold at least one
    /// entry and an index node at least two.
    pub fn with_overrides(
        block_size: usize,
        leaf: Option<usize>,
        index: Option<usize>,
    ) -> Result<Self, NodeError> {
        let max_leaf = max_leaf_capacity(block_size);
        let max_index = max_index_capacity(block_size);
        let capacity = Self {
            leaf: leaf.unwrap_or(max_leaf),
            index: index.unwrap_or(max_index),
        };

        if capacity.leaf == 0
            || capacity.leaf > max_leaf
            || capacity.index < MIN_INDEX_CAPACITY
            || capacity.index > max_index
        {
            return Err(NodeError::InvalidCapacity {
                leaf: capacity.leaf,
                index: capacity.index,
                block_size,
            });
        }
        Ok(capacity)
    }
}

/// Header information common to leaf and index nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeHeader {
    pub level: u8,
    pub num_entries: u32,
    pub left_sibling: Option<BlockId>,
    pub right_sibling: Option<BlockId>,
    pub representative_key: f32,
}

impl NodeHeader {
    const fn new(level: u8) -> Self {
        Self {
            level,
            num_entries: 0,
            left_sibling: None,
            right_sibling: None,
            representative_key: 0.0,
        }
    }

    /// Read a node header from a page.
    #[must_use]
    pub fn from_page(page: &Page) -> Self {
        let offset = PageHeader::SIZE;
        Self {
            level: page.read_u8(offset),
            num_entries: page.read_u32(offset + 1),
            left_sibling: decode_sibling(page.read_u64(offset + 5)),
            right_sibling: decode_sibling(page.read_u64(offset + 13)),
            representative_key: page.read_f32(offset + 21),
        }
    }

    /// Write a node header to a page.
    pub fn write_to_page(&self, page: &mut Page) {
        let offset = PageHeader::SIZE;
        page.write_u8(offset, self.level);
        page.write_u32(offset + 1, self.num_entries);
        page.write_u64(offset + 5, self.left_sibling.unwrap_or(NO_BLOCK));
        page.write_u64(offset + 13, self.right_sibling.unwrap_or(NO_BLOCK));
        page.write_f32(offset + 21, self.representative_key);
    }
}

const fn decode_sibling(raw: BlockId) -> Option<BlockId> {
    if raw == NO_BLOCK { None } else { Some(raw) }
}

fn write_page_header(page: &mut Page, page_type: PageType) {
    let page_header = PageHeader {
        page_type,
        flags: 0,
        checksum: 0,
    };
    page.write_bytes(0, &page_header.to_bytes());
}

const fn page_error(block: BlockId, e: &PageError) -> NodeError {
    match *e {
        PageError::InvalidPageType(_) => NodeError::InvalidHeader(block),
        PageError::ChecksumMismatch { expected, actual } => NodeError::ChecksumMismatch {
            block,
            expected,
            actual,
        },
    }
}

/// Validate the page header and checksum, returning the page type.
fn check_page(block: BlockId, page: &Page) -> Result<PageType, NodeError> {
    let page_header = PageHeader::from_page(page).map_err(|e| page_error(block, &e))?;
    page.verify_checksum().map_err(|e| page_error(block, &e))?;
    Ok(page_header.page_type)
}

/// A leaf node.
///
/// Entries are stored in the order they were added. Only the first key of
/// every bucket of `LEAF_BUCKET_SIZE` entries is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafNode {
    block: BlockId,
    pub header: NodeHeader,
    /// One key per bucket: `keys.len() == ceil(ids.len() / 16)`.
    keys: Vec<f32>,
    ids: Vec<u32>,
    capacity: usize,
}

impl LeafNode {
    /// Create a new empty leaf for `block`.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::new() is not const-stable
    pub fn new(block: BlockId, capacity: usize) -> Self {
        Self {
            block,
            header: NodeHeader::new(0),
            keys: Vec::new(),
            ids: Vec::new(),
            capacity,
        }
    }

    /// Block address of this node.
    #[must_use]
    pub const fn block(&self) -> BlockId {
        self.block
    }

    /// Number of entries.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn num_entries(&self) -> usize {
        self.ids.len()
    }

    /// Number of stored bucket keys.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    /// Check if the node is full.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn is_full(&self) -> bool {
        self.ids.len() >= self.capacity
    }

    /// Append an entry. Entries must arrive in ascending key order.
    pub fn push(&mut self, id: u32, key: f32) -> Result<(), NodeError> {
        if self.is_full() {
            return Err(NodeError::Overflow {
                block: self.block,
                capacity: self.capacity,
            });
        }
        if self.ids.len().is_multiple_of(LEAF_BUCKET_SIZE) {
            self.keys.push(key);
        }
        self.ids.push(id);
        self.header.num_entries = self.ids.len() as u32;
        self.header.representative_key = key;
        Ok(())
    }

    /// The stored key of bucket `i`.
    #[must_use]
    pub fn key(&self, i: usize) -> Option<f32> {
        self.keys.get(i).copied()
    }

    /// The id of entry `i`.
    #[must_use]
    pub fn entry_id(&self, i: usize) -> Option<u32> {
        self.ids.get(i).copied()
    }

    /// All entry ids in order.
    #[must_use]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// All bucket keys in order.
    #[must_use]
    pub fn bucket_keys(&self) -> &[f32] {
        &self.keys
    }

    /// Read a leaf node from a page.
    pub fn from_page(block: BlockId, page: &Page) -> Result<Self, NodeError> {
        if check_page(block, page)? != PageType::BTreeLeaf {
            return Err(NodeError::WrongNodeType(block));
        }

        let header = NodeHeader::from_page(page);
        let capacity = max_leaf_capacity(page.len());
        let num_entries = header.num_entries as usize;
        if header.level != 0 || num_entries > capacity {
            return Err(NodeError::InvalidHeader(block));
        }

        let num_keys = bucket_count(num_entries);
        let mut offset = DATA_OFFSET;

        let mut keys = Vec::with_capacity(num_keys);
        for _ in 0..num_keys {
            keys.push(page.read_f32(offset));
            offset += LEAF_SLOT_SIZE;
        }

        let mut ids = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            ids.push(page.read_u32(offset));
            offset += LEAF_SLOT_SIZE;
        }

        Ok(Self {
            block,
            header,
            keys,
            ids,
            capacity,
        })
    }

    /// Write a leaf node to a zeroed page and stamp its checksum.
    pub fn write_to_page(&self, page: &mut Page) {
        write_page_header(page, PageType::BTreeLeaf);

        let mut header = self.header;
        header.num_entries = self.ids.len() as u32;
        header.write_to_page(page);

        let mut offset = DATA_OFFSET;
        for key in &self.keys {
            page.write_f32(offset, *key);
            offset += LEAF_SLOT_SIZE;
        }
        for id in &self.ids {
            page.write_u32(offset, *id);
            offset += LEAF_SLOT_SIZE;
        }

        page.stamp_checksum();
    }
}

/// An index node.
///
/// Entry `i` routes to child `sons[i]`, whose representative key is `keys[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexNode {
    block: BlockId,
    pub header: NodeHeader,
    keys: Vec<f32>,
    sons: Vec<BlockId>,
    capacity: usize,
}

impl IndexNode {
    /// Create a new empty index node for `block` at `level` (> 0).
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::new() is not const-stable
    pub fn new(block: BlockId, level: u8, capacity: usize) -> Self {
        Self {
            block,
            header: NodeHeader::new(level),
            keys: Vec::new(),
            sons: Vec::new(),
            capacity,
        }
    }

    /// Block address of this node.
    #[must_use]
    pub const fn block(&self) -> BlockId {
        self.block
    }

    /// Number of routing entries.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn num_entries(&self) -> usize {
        self.sons.len()
    }

    /// Check if the node is full.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn is_full(&self) -> bool {
        self.sons.len() >= self.capacity
    }

    /// Append a routing entry. Keys must arrive in ascending order.
    pub fn push(&mut self, key: f32, son: BlockId) -> Result<(), NodeError> {
        if self.is_full() {
            return Err(NodeError::Overflow {
                block: self.block,
                capacity: self.capacity,
            });
        }
        self.keys.push(key);
        self.sons.push(son);
        self.header.num_entries = self.sons.len() as u32;
        self.header.representative_key = key;
        Ok(())
    }

    /// The routing key of entry `i`.
    #[must_use]
    pub fn key(&self, i: usize) -> Option<f32> {
        self.keys.get(i).copied()
    }

    /// The child block of entry `i`.
    #[must_use]
    pub fn son(&self, i: usize) -> Option<BlockId> {
        self.sons.get(i).copied()
    }

    /// All routing keys in order.
    #[must_use]
    pub fn keys(&self) -> &[f32] {
        &self.keys
    }

    /// All child blocks in order.
    #[must_use]
    pub fn sons(&self) -> &[BlockId] {
        &self.sons
    }

    /// Read an index node from a page.
    pub fn from_page(block: BlockId, page: &Page) -> Result<Self, NodeError> {
        if check_page(block, page)? != PageType::BTreeIndex {
            return Err(NodeError::WrongNodeType(block));
        }

        let header = NodeHeader::from_page(page);
        let capacity = max_index_capacity(page.len());
        let num_entries = header.num_entries as usize;
        if header.level == 0 || num_entries > capacity {
            return Err(NodeError::InvalidHeader(block));
        }

        let mut keys = Vec::with_capacity(num_entries);
        let mut sons = Vec::with_capacity(num_entries);
        let mut offset = DATA_OFFSET;
        for _ in 0..num_entries {
            keys.push(page.read_f32(offset));
            sons.push(page.read_u64(offset + 4));
            offset += INDEX_ENTRY_SIZE;
        }

        Ok(Self {
            block,
            header,
            keys,
            sons,
            capacity,
        })
    }

    /// Write an index node to a zeroed page and stamp its checksum.
    pub fn write_to_page(&self, page: &mut Page) {
        write_page_header(page, PageType::BTreeIndex);

        let mut header = self.header;
        header.num_entries = self.sons.len() as u32;
        header.write_to_page(page);

        let mut offset = DATA_OFFSET;
        for (key, son) in self.keys.iter().zip(&self.sons) {
            page.write_f32(offset, *key);
            page.write_u64(offset + 4, *son);
            offset += INDEX_ENTRY_SIZE;
        }

        page.stamp_checksum();
    }
}

/// A node of either kind, as read back from a block.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(LeafNode),
    Index(IndexNode),
}

impl Node {
    /// Read whichever node kind the page holds.
    pub fn from_page(block: BlockId, page: &Page) -> Result<Self, NodeError> {
        match check_page(block, page)? {
            PageType::BTreeLeaf => LeafNode::from_page(block, page).map(Self::Leaf),
            PageType::BTreeIndex => IndexNode::from_page(block, page).map(Self::Index),
            PageType::Header => Err(NodeError::WrongNodeType(block)),
        }
    }

    /// Write the node to a zeroed page and stamp its checksum.
    pub fn write_to_page(&self, page: &mut Page) {
        match self {
            Self::Leaf(leaf) => leaf.write_to_page(page),
            Self::Index(index) => index.write_to_page(page),
        }
    }

    const fn header(&self) -> &NodeHeader {
        match self {
            Self::Leaf(leaf) => &leaf.header,
            Self::Index(index) => &index.header,
        }
    }

    const fn header_mut(&mut self) -> &mut NodeHeader {
        match self {
            Self::Leaf(leaf) => &mut leaf.header,
            Self::Index(index) => &mut index.header,
        }
    }

    /// Block address of this node.
    #[must_use]
    pub const fn block(&self) -> BlockId {
        match self {
            Self::Leaf(leaf) => leaf.block(),
            Self::Index(index) => index.block(),
        }
    }

    /// Whether this is a leaf.
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Level of the node (0 for leaves).
    #[must_use]
    pub const fn level(&self) -> u8 {
        self.header().level
    }

    /// Number of entries.
    #[must_use]
    pub fn num_entries(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.num_entries(),
            Self::Index(index) => index.num_entries(),
        }
    }

    /// Check if the node is full.
    #[must_use]
    pub fn is_full(&self) -> bool {
        match self {
            Self::Leaf(leaf) => leaf.is_full(),
            Self::Index(index) => index.is_full(),
        }
    }

    /// Number of stored keys: bucket keys for a leaf, routing keys for an index node.
    #[must_use]
    pub fn num_keys(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.num_keys(),
            Self::Index(index) => index.num_entries(),
        }
    }

    /// Stored key `i`: bucket key for a leaf, routing key for an index node.
    #[must_use]
    pub fn key(&self, i: usize) -> Option<f32> {
        match self {
            Self::Leaf(leaf) => leaf.key(i),
            Self::Index(index) => index.key(i),
        }
    }

    /// Child block of routing entry `i`; always `None` for a leaf.
    #[must_use]
    pub fn son(&self, i: usize) -> Option<BlockId> {
        match self {
            Self::Leaf(_) => None,
            Self::Index(index) => index.son(i),
        }
    }

    /// Id of entry `i`; always `None` for an index node.
    #[must_use]
    pub fn entry_id(&self, i: usize) -> Option<u32> {
        match self {
            Self::Leaf(leaf) => leaf.entry_id(i),
            Self::Index(_) => None,
        }
    }

    #[must_use]
    pub const fn left_sibling(&self) -> Option<BlockId> {
        self.header().left_sibling
    }

    #[must_use]
    pub const fn right_sibling(&self) -> Option<BlockId> {
        self.header().right_sibling
    }

    pub const fn set_left_sibling(&mut self, block: Option<BlockId>) {
        self.header_mut().left_sibling = block;
    }

    pub const fn set_right_sibling(&mut self, block: Option<BlockId>) {
        self.header_mut().right_sibling = block;
    }

    /// Largest key in the node's subtree.
    #[must_use]
    pub const fn representative_key(&self) -> f32 {
        self.header().representative_key
    }
}

/// Errors that can occur when working with B-tree nodes.
#[derive(Debug)]
pub enum NodeError {
    /// Invalid node header in the given block.
    InvalidHeader(BlockId),
    /// Block holds a different node type than expected.
    WrongNodeType(BlockId),
    /// Stored checksum does not match the block contents.
    ChecksumMismatch {
        block: BlockId,
        expected: u32,
        actual: u32,
    },
    /// Entry pushed into a full node.
    Overflow { block: BlockId, capacity: usize },
    /// Requested capacities do not fit the block size.
    InvalidCapacity {
        leaf: usize,
        index: usize,
        block_size: usize,
    },
    /// Tree would exceed the deepest encodable level.
    LevelOverflow,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidHeader(block) => write!(f, "invalid node header in block {block}"),
            Self::WrongNodeType(block) => {
                write!(f, "wrong node type for operation in block {block}")
            }
            Self::ChecksumMismatch {
                block,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch in block {block}: expected {expected}, got {actual}"
            ),
            Self::Overflow { block, capacity } => {
                write!(f, "node in block {block} is full ({capacity} entries)")
            }
            Self::InvalidCapacity {
                leaf,
                index,
                block_size,
            } => write!(
                f,
                "capacities leaf={leaf} index={index} do not fit {block_size}-byte blocks"
            ),
            Self::LevelOverflow => write!(f, "tree height exceeds {}", u8::MAX),
        }
    }
}

impl std::error::Error for NodeError {}
