//! Bulk-loaded B+-tree.
//!
//! The tree is built once, bottom-up, from entries sorted by key. It is
//! never modified afterwards.
//!
//! # Structure
//!
//! - Leaf nodes: entry ids, one stored key per bucket of 16 entries
//! - Index nodes: (representative key, child block) routing entries
//! - Every level is a doubly linked sibling chain in ascending key order
//!
//! # Usage
//!
//! ```no_run
//! use bulktree::btree::{BTree, TreeOptions};
//! use bulktree::entry::Entry;
//! use std::path::Path;
//!
//! let entries: Vec<Entry> = (0..1000).map(|i| Entry::new(i, i as f32)).collect();
//!
//! let mut tree = BTree::init(Path::new("./result/B_tree"), &TreeOptions::default())?;
//! tree.bulkload_parallel(&entries, 4)?;
//! let stats = tree.verify()?;
//! assert_eq!(stats.entries, 1000);
//! tree.close()?;
//! # Ok::<(), bulktree::btree::BTreeError>(())
//! ```

mod bulkload;
pub mod dump;
mod node;
mod parallel;
mod tree;
mod verify;

pub use bulkload::{BuildOutcome, LevelBlocks, WorkerResult};
pub use node::{
    IndexNode, LEAF_BUCKET_SIZE, LeafNode, Node, NodeCapacity, NodeError, NodeHeader,
    max_index_capacity, max_leaf_capacity,
};
pub use parallel::partition;
pub use tree::{BTree, BTreeError, LeafCursor, TreeOptions};
pub use verify::TreeStats;
