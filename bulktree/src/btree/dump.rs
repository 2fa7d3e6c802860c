//! Human-readable tree dump.
//!
//! Index levels are printed top-down, each level left to right along its
//! sibling chain, followed by every leaf. Keys are printed truncated to
//! integers. A leaf prints the stored bucket key next to the first entry of
//! each bucket.

#![allow(clippy::cast_possible_truncation)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::btree::node::{LEAF_BUCKET_SIZE, Node};
use crate::btree::tree::{BTree, BTreeError};
use crate::storage::BlockStore;

/// Write the dump of `tree` to `out`.
pub fn write_tree<S: BlockStore, W: Write>(
    tree: &mut BTree<S>,
    out: &mut W,
) -> Result<(), BTreeError> {
    write_index_levels(tree, out)?;
    write_leaves(tree, out)?;
    out.flush().map_err(BTreeError::Dump)
}

/// Write the dump of `tree` to a new file at `path`.
pub fn write_tree_to_path<S: BlockStore>(
    tree: &mut BTree<S>,
    path: &Path,
) -> Result<(), BTreeError> {
    let file = File::create(path).map_err(BTreeError::Dump)?;
    let mut out = BufWriter::new(file);
    write_tree(tree, &mut out)
}

fn write_index_levels<S: BlockStore, W: Write>(
    tree: &mut BTree<S>,
    out: &mut W,
) -> Result<(), BTreeError> {
    let root = tree.root();
    let mut level_start = root;

    loop {
        let mut next = Some(level_start);
        let mut first_son = None;

        while let Some(block) = next {
            let node = tree.read_node(block)?;
            let Node::Index(index) = &node else {
                return Ok(());
            };

            if block == root {
                write!(out, "Root: ").map_err(BTreeError::Dump)?;
            }
            writeln!(out, "Block {block}").map_err(BTreeError::Dump)?;
            writeln!(
                out,
                "\tlevel: {}\tnum_entries: {}",
                node.level(),
                node.num_entries()
            )
            .map_err(BTreeError::Dump)?;
            for (key, son) in index.keys().iter().zip(index.sons()) {
                writeln!(out, "\t\tkey: {}\tson: {son}", *key as i32).map_err(BTreeError::Dump)?;
            }

            if first_son.is_none() {
                first_son = node.son(0);
            }
            next = node.right_sibling();
        }

        level_start = first_son.ok_or_else(|| {
            BTreeError::InvariantViolation(format!(
                "index level starting at block {level_start} has no children"
            ))
        })?;
    }
}

fn write_leaves<S: BlockStore, W: Write>(
    tree: &mut BTree<S>,
    out: &mut W,
) -> Result<(), BTreeError> {
    let mut cursor = tree.leaf_cursor()?;
    while let Some(leaf) = cursor.next_leaf()? {
        writeln!(out, "Leaf Block {}", leaf.block()).map_err(BTreeError::Dump)?;
        writeln!(
            out,
            "\tlevel: {}\tnum_keys: {}\tnum_entries: {}",
            leaf.header.level,
            leaf.num_keys(),
            leaf.num_entries()
        )
        .map_err(BTreeError::Dump)?;

        for (i, id) in leaf.ids().iter().enumerate() {
            let written = if i % LEAF_BUCKET_SIZE == 0 {
                let key = leaf.key(i / LEAF_BUCKET_SIZE).unwrap_or_default();
                writeln!(out, "\t\tentry_id: {id}\tkey: {}", key as i32)
            } else {
                writeln!(out, "\t\tentry_id: {id}")
            };
            written.map_err(BTreeError::Dump)?;
        }
    }
    Ok(())
}
