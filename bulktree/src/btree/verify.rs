//! Structural checks over a built tree.
//!
//! The checker walks the tree top-down one level at a time. At every level
//! the sibling chain must visit exactly the children the level above routes
//! to, in the same order, and every routing key must equal its child's
//! representative key.

use crate::btree::node::Node;
use crate::btree::tree::{BTree, BTreeError};
use crate::storage::{BlockId, BlockStore};

/// Shape of a verified tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStats {
    /// Level of the root.
    pub height: u8,
    /// Number of nodes at each level, leaves first.
    pub nodes_per_level: Vec<usize>,
    /// Number of entries in the leaves.
    pub entries: u64,
}

/// A child the level above routes to, with the key it is routed by.
struct Expected {
    block: BlockId,
    key: Option<f32>,
}

const fn violation(message: String) -> BTreeError {
    BTreeError::InvariantViolation(message)
}

fn is_ascending(keys: &[f32]) -> bool {
    keys.is_sorted_by(|a, b| a.total_cmp(b).is_le())
}

impl<S: BlockStore> BTree<S> {
    /// Check the tree's structural invariants.
    pub fn verify(&mut self) -> Result<TreeStats, BTreeError> {
        let root = self.read_node(self.root())?;
        if u32::from(root.level()) != self.height() {
            return Err(violation(format!(
                "root level {} does not match height {}",
                root.level(),
                self.height()
            )));
        }
        if root.left_sibling().is_some() || root.right_sibling().is_some() {
            return Err(violation(format!("root {} has siblings", root.block())));
        }

        let height = root.level();
        let mut nodes_per_level = vec![0; usize::from(height) + 1];
        let mut expected = vec![Expected {
            block: root.block(),
            key: None,
        }];
        let mut entries = 0u64;

        for level in (0..=height).rev() {
            let chain = self.read_chain(&expected, level)?;
            nodes_per_level[usize::from(level)] = chain.len();

            let mut next = Vec::new();
            let mut last_key = f32::NEG_INFINITY;
            for (node, routed) in chain.iter().zip(&expected) {
                if let Some(key) = routed.key
                    && key.total_cmp(&node.representative_key()).is_ne()
                {
                    return Err(violation(format!(
                        "block {} is routed by key {key} but represents {}",
                        node.block(),
                        node.representative_key()
                    )));
                }

                let keys = match node {
                    Node::Index(index) => index.keys(),
                    Node::Leaf(leaf) => leaf.bucket_keys(),
                };
                if !is_ascending(keys) || keys.first().is_some_and(|k| *k < last_key) {
                    return Err(violation(format!(
                        "keys out of order in block {}",
                        node.block()
                    )));
                }
                if let Some(&last) = keys.last() {
                    last_key = last;
                }

                match node {
                    Node::Index(index) => {
                        let representative = index.keys().last().copied().ok_or_else(|| {
                            violation(format!("index node {} has no children", index.block()))
                        })?;
                        if representative.total_cmp(&node.representative_key()).is_ne() {
                            return Err(violation(format!(
                                "index node {} represents {} but its last key is {representative}",
                                index.block(),
                                node.representative_key()
                            )));
                        }
                        next.extend(index.keys().iter().zip(index.sons()).map(|(&key, &son)| {
                            Expected {
                                block: son,
                                key: Some(key),
                            }
                        }));
                    }
                    Node::Leaf(leaf) => {
                        if leaf.num_entries() > 0 && node.representative_key() < last_key {
                            return Err(violation(format!(
                                "leaf {} represents {} below its stored key {last_key}",
                                leaf.block(),
                                node.representative_key()
                            )));
                        }
                        entries += leaf.num_entries() as u64;
                    }
                }
            }
            expected = next;
        }

        if entries != self.entry_count() {
            return Err(violation(format!(
                "leaves hold {entries} entries, header records {}",
                self.entry_count()
            )));
        }

        Ok(TreeStats {
            height,
            nodes_per_level,
            entries,
        })
    }

    /// Follow the sibling chain of `level`, which must visit exactly `expected`.
    fn read_chain(&mut self, expected: &[Expected], level: u8) -> Result<Vec<Node>, BTreeError> {
        let mut chain = Vec::with_capacity(expected.len());
        let mut prev = None;
        let mut next = expected.first().map(|e| e.block);

        while let Some(block) = next {
            let Some(want) = expected.get(chain.len()) else {
                return Err(violation(format!(
                    "level {level} chain continues past {} nodes to block {block}",
                    expected.len()
                )));
            };
            if want.block != block {
                return Err(violation(format!(
                    "level {level} chain reaches block {block} where block {} is routed to",
                    want.block
                )));
            }

            let node = self.read_node(block)?;
            if node.level() != level {
                return Err(violation(format!(
                    "block {block} has level {}, expected {level}",
                    node.level()
                )));
            }
            if node.left_sibling() != prev {
                return Err(violation(format!(
                    "block {block} has left sibling {:?}, expected {prev:?}",
                    node.left_sibling()
                )));
            }

            prev = Some(block);
            next = node.right_sibling();
            chain.push(node);
        }

        if chain.len() != expected.len() {
            return Err(violation(format!(
                "level {level} chain ends after {} of {} nodes",
                chain.len(),
                expected.len()
            )));
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::tree::TreeOptions;
    use crate::entry::Entry;
    use crate::storage::{MemoryStore, Page};

    #[allow(clippy::cast_precision_loss)]
    fn entries(n: u32) -> Vec<Entry> {
        (0..n).map(|i| Entry::new(i, i as f32)).collect()
    }

    fn built_tree(n: u32) -> BTree<MemoryStore> {
        let options = TreeOptions::default().with_leaf_capacity(16);
        let mut tree = BTree::with_store(MemoryStore::new(512, 1), &options).expect("init");
        tree.bulkload(&entries(n)).expect("bulkload");
        tree
    }

    #[test]
    fn test_verify_sequential_tree() {
        let mut tree = built_tree(40);
        let stats = tree.verify().expect("verify");
        assert_eq!(
            stats,
            TreeStats {
                height: 1,
                nodes_per_level: vec![3, 1],
                entries: 40,
            }
        );
    }

    #[test]
    fn test_verify_empty_tree() {
        let mut tree =
            BTree::with_store(MemoryStore::new(512, 1), &TreeOptions::default()).expect("init");
        let stats = tree.verify().expect("verify");
        assert_eq!(stats.height, 0);
        assert_eq!(stats.nodes_per_level, vec![1]);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_height_formula() {
        // ceil(log_39(ceil(n / 16))) for 512-byte index nodes
        for (n, height) in [(1, 0), (16, 0), (17, 1), (624, 1), (625, 2), (24_336, 2), (24_337, 3)] {
            let mut tree = built_tree(n);
            assert_eq!(tree.verify().expect("verify").height, height, "n={n}");
        }
    }

    #[test]
    fn test_verify_detects_broken_sibling_link() {
        let mut tree = built_tree(40);

        // Leaves are blocks 2-4; cut the chain after the first one
        let mut first = tree.read_node(2).expect("read");
        first.set_right_sibling(None);
        let mut page = Page::new(512);
        first.write_to_page(&mut page);
        tree.store_mut().write_block(2, &page).expect("write");

        let err = tree.verify().expect_err("should fail");
        assert!(matches!(err, BTreeError::InvariantViolation(_)));
    }

    #[test]
    fn test_verify_detects_wrong_routing_key() {
        let mut tree = built_tree(40);

        let Node::Index(root) = tree.read_node(5).expect("read root") else {
            panic!("root should be an index node");
        };
        let mut forged = crate::btree::node::IndexNode::new(5, 1, 39);
        for (i, (&key, &son)) in root.keys().iter().zip(root.sons()).enumerate() {
            let key = if i == 1 { key + 0.5 } else { key };
            forged.push(key, son).expect("push");
        }
        let mut page = Page::new(512);
        forged.write_to_page(&mut page);
        tree.store_mut().write_block(5, &page).expect("write");
        tree.release_root();

        assert!(matches!(
            tree.verify(),
            Err(BTreeError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_verify_detects_wrong_entry_count() {
        let mut tree = built_tree(40);
        tree.store_mut().header_mut().entry_count = 41;
        assert!(matches!(
            tree.verify(),
            Err(BTreeError::InvariantViolation(_))
        ));
    }
}
