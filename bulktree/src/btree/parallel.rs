//! Parallel bulk loading.
//!
//! The sorted input is cut into contiguous ranges, one per worker. Every
//! worker builds a complete subtree over its range while sharing the block
//! allocator with the others, so a worker's blocks are interleaved with
//! everyone else's. Each worker therefore reports the exact blocks it
//! allocated per level.
//!
//! Once all workers are joined, the subtrees are stitched together: every
//! level's sibling chains are linked end to start in worker order, and new
//! index levels are built over the worker roots until one root remains.

use std::ops::Range;
use std::thread;

use crate::btree::bulkload::{
    self, BuildOutcome, SharedStore, WorkerResult, build_index_level, build_subtree,
};
use crate::btree::node::{NodeCapacity, NodeError};
use crate::btree::tree::BTreeError;
use crate::entry::Entry;
use crate::storage::{BlockId, BlockStore};

/// Scratch buffers reserved in the pool for each worker.
pub const PAGES_PER_WORKER: usize = 8;

/// Split `len` entries into at most `workers` contiguous ranges.
///
/// Every range holds `ceil(len / workers)` entries except the last, which
/// holds the remainder. Empty ranges are dropped, so fewer ranges than
/// workers come back when `workers` does not divide the input evenly enough.
#[must_use]
pub fn partition(len: usize, workers: usize) -> Vec<Range<usize>> {
    if len == 0 || workers == 0 {
        return Vec::new();
    }

    let chunk = len.div_ceil(workers);
    (0..workers)
        .map(|i| (i * chunk).min(len)..((i + 1) * chunk).min(len))
        .filter(|range| !range.is_empty())
        .collect()
}

/// Bulk load sorted `entries` into `store` using up to `workers` threads.
pub fn bulkload_parallel<S: BlockStore + Send>(
    store: &mut S,
    entries: &[Entry],
    workers: usize,
    capacity: NodeCapacity,
) -> Result<BuildOutcome, BTreeError> {
    let ranges = partition(entries.len(), workers);
    if ranges.len() <= 1 {
        tracing::debug!("Input fits a single partition, loading sequentially");
        return bulkload::bulkload(store, entries, capacity);
    }

    store
        .buffer_pool()
        .ensure_capacity(ranges.len() * PAGES_PER_WORKER);

    let shared = SharedStore::new(store);
    let results = run_workers(&shared, entries, &ranges, capacity)?;
    tracing::info!("Workers complete");

    merge(&shared, &results, capacity)
}

/// Run one builder thread per range and collect their subtrees in range order.
///
/// Every started worker is joined before any error is returned.
fn run_workers<S: BlockStore + Send>(
    shared: &SharedStore<'_, S>,
    entries: &[Entry],
    ranges: &[Range<usize>],
    capacity: NodeCapacity,
) -> Result<Vec<WorkerResult>, BTreeError> {
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(ranges.len());
        let mut spawn_error = None;

        for (worker, range) in ranges.iter().enumerate() {
            let slice = &entries[range.clone()];
            tracing::debug!(
                "Worker {} loading entries {}..{}",
                worker,
                range.start,
                range.end
            );

            let spawned = thread::Builder::new()
                .name(format!("bulkload-{worker}"))
                .spawn_scoped(scope, move || build_subtree(shared, slice, capacity));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for (worker, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(BTreeError::WorkerPanicked { worker });
                }
            }
        }

        if let Some(e) = spawn_error {
            return Err(BTreeError::ThreadSpawn(e));
        }
        first_error.map_or(Ok(results), Err)
    })
}

/// Stitch the worker subtrees into one tree.
pub fn merge<S: BlockStore>(
    shared: &SharedStore<'_, S>,
    results: &[WorkerResult],
    capacity: NodeCapacity,
) -> Result<BuildOutcome, BTreeError> {
    let height = results.first().ok_or(BTreeError::EmptyInput)?.height();
    for (worker, result) in results.iter().enumerate() {
        if result.height() != height {
            return Err(BTreeError::HeightMismatch {
                worker,
                expected: height,
                actual: result.height(),
            });
        }
    }

    // Every level, worker roots included, becomes one sibling chain
    for (worker, (left, right)) in results.iter().zip(&results[1..]).enumerate() {
        for (left_level, right_level) in left.levels.iter().zip(&right.levels) {
            let missing = || {
                BTreeError::InvariantViolation(format!(
                    "worker {worker} reported an empty level {}",
                    left_level.level
                ))
            };
            let left_end = left_level.end().ok_or_else(missing)?;
            let right_start = right_level.start().ok_or_else(missing)?;
            link(shared, left_end, right_start)?;
        }
    }

    let mut level = height;
    let mut blocks: Vec<BlockId> = results.iter().map(|result| result.root).collect();
    while blocks.len() > 1 {
        level = level.checked_add(1).ok_or(NodeError::LevelOverflow)?;
        blocks = build_index_level(shared, &blocks, level, capacity)?.blocks;
    }

    let root = blocks.first().copied().ok_or(BTreeError::EmptyInput)?;
    Ok(BuildOutcome {
        root,
        height: level,
        entries: results.iter().map(|result| result.entries).sum(),
    })
}

/// Make `right` the right sibling of `left` and vice versa.
fn link<S: BlockStore>(
    shared: &SharedStore<'_, S>,
    left: BlockId,
    right: BlockId,
) -> Result<(), BTreeError> {
    let mut left_node = shared.read_node(left)?;
    left_node.set_right_sibling(Some(right));
    shared.write_node(&left_node)?;

    let mut right_node = shared.read_node(right)?;
    right_node.set_left_sibling(Some(left));
    shared.write_node(&right_node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::bulkload::{LevelBlocks, LevelWriter};
    use crate::btree::tree::{BTree, TreeOptions};
    use crate::storage::{FaultConfig, MemoryStore, StorageError};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[allow(clippy::cast_precision_loss)]
    fn entries(n: u32) -> Vec<Entry> {
        (0..n).map(|i| Entry::new(i, i as f32)).collect()
    }

    fn tree_with_leaves(leaf: usize) -> BTree<MemoryStore> {
        let options = TreeOptions::default().with_leaf_capacity(leaf);
        BTree::with_store(MemoryStore::new(512, 1), &options).expect("init")
    }

    #[test]
    fn test_partition() {
        assert_eq!(partition(40, 2), vec![0..20, 20..40]);
        assert_eq!(partition(10, 3), vec![0..4, 4..8, 8..10]);
        assert_eq!(partition(3, 5), vec![0..1, 1..2, 2..3]);
        // ceil(10 / 4) = 3 leaves the fourth worker with one entry
        assert_eq!(partition(10, 4), vec![0..3, 3..6, 6..9, 9..10]);
        // ceil(9 / 6) = 2 covers the input with five ranges
        assert_eq!(partition(9, 6).len(), 5);
        assert!(partition(0, 4).is_empty());
        assert!(partition(10, 0).is_empty());
    }

    #[test]
    fn test_two_workers_match_sequential() {
        let input = entries(40);

        let mut sequential = tree_with_leaves(16);
        sequential.bulkload(&input).expect("sequential");

        let mut parallel = tree_with_leaves(16);
        parallel.bulkload_parallel(&input, 2).expect("parallel");

        assert_eq!(
            parallel.scan_ids().expect("scan"),
            sequential.scan_ids().expect("scan")
        );
        assert_eq!(parallel.height(), 2);
        assert_eq!(parallel.entry_count(), 40);

        let root = parallel.load_root().expect("root").clone();
        assert_eq!(root.level(), 2);
        assert_eq!(root.num_entries(), 2);
        assert_eq!(root.key(0), Some(19.0));
        assert_eq!(root.key(1), Some(39.0));
    }

    #[test]
    fn test_worker_counts_agree_on_leaf_order() {
        let input = entries(1000);
        let expected: Vec<u32> = input.iter().map(|e| e.id).collect();

        for workers in [0, 1, 2, 5] {
            let mut tree = tree_with_leaves(16);
            tree.bulkload_parallel(&input, workers).expect("bulkload");
            assert_eq!(tree.scan_ids().expect("scan"), expected, "workers={workers}");
            tree.verify().expect("verify");
        }
    }

    #[test]
    fn test_height_mismatch_is_fatal() {
        // 17 entries make two leaves, 16 entries make one
        let mut tree = tree_with_leaves(16);
        let result = tree.bulkload_parallel(&entries(33), 2);
        assert!(matches!(
            result,
            Err(BTreeError::HeightMismatch {
                worker: 1,
                expected: 1,
                actual: 0
            })
        ));
        assert_eq!(tree.root(), 1);
    }

    #[test]
    fn test_merge_links_every_level() {
        let mut store = MemoryStore::new(512, 1);
        let capacity = NodeCapacity::with_overrides(512, Some(4), Some(4)).expect("capacity");
        let input = entries(48);

        let shared = SharedStore::new(&mut store);
        let results: Vec<WorkerResult> = partition(input.len(), 3)
            .into_iter()
            .map(|range| build_subtree(&shared, &input[range], capacity).expect("subtree"))
            .collect();
        let outcome = merge(&shared, &results, capacity).expect("merge");

        // 16 entries per worker: 4 leaves, 1 index node each
        assert!(results.iter().all(|r| r.height() == 1));
        assert_eq!(outcome.height, 2);
        assert_eq!(outcome.entries, 48);

        let worker_roots: Vec<BlockId> = results.iter().map(|r| r.root).collect();
        for pair in worker_roots.windows(2) {
            let left = shared.read_node(pair[0]).expect("read");
            let right = shared.read_node(pair[1]).expect("read");
            assert_eq!(left.right_sibling(), Some(pair[1]));
            assert_eq!(right.left_sibling(), Some(pair[0]));
        }

        let last_leaf_of_first = results[0].levels[0].end().expect("end");
        let first_leaf_of_second = results[1].levels[0].start().expect("start");
        let node = shared.read_node(last_leaf_of_first).expect("read");
        assert_eq!(node.right_sibling(), Some(first_leaf_of_second));
    }

    #[test]
    fn test_merge_over_interleaved_workers() {
        let mut store = MemoryStore::new(512, 1);
        let capacity = NodeCapacity::with_overrides(512, Some(4), Some(4)).expect("capacity");
        let input = entries(32);
        let (left_input, right_input) = input.split_at(16);
        let shared = SharedStore::new(&mut store);

        // Alternate pushes so both workers draw from the allocator in turn
        let mut left = LevelWriter::new(&shared, 0, capacity);
        let mut right = LevelWriter::new(&shared, 0, capacity);
        for (&l, &r) in left_input.iter().zip(right_input) {
            left.push_entry(l).expect("push");
            right.push_entry(r).expect("push");
        }
        let left_leaves = left.finish().expect("finish");
        let right_leaves = right.finish().expect("finish");
        assert_eq!(left_leaves.blocks, vec![1, 3, 5, 7]);
        assert_eq!(right_leaves.blocks, vec![2, 4, 6, 8]);

        let subtree = |leaves: LevelBlocks| {
            let index = build_index_level(&shared, &leaves.blocks, 1, capacity).expect("index");
            let root = index.start().expect("root");
            WorkerResult {
                levels: vec![leaves, index],
                root,
                entries: 16,
            }
        };
        let results = vec![subtree(left_leaves), subtree(right_leaves)];
        let outcome = merge(&shared, &results, capacity).expect("merge");
        assert_eq!(outcome.height, 2);
        assert_eq!(outcome.entries, 32);

        let root = shared.read_node(outcome.root).expect("read root");
        assert_eq!(root.son(0), Some(results[0].root));
        assert_eq!(root.son(1), Some(results[1].root));
        assert_eq!(root.key(0), Some(15.0));
        assert_eq!(root.key(1), Some(31.0));

        let first_index = shared.read_node(results[0].root).expect("read index");
        let sons: Vec<BlockId> = (0..4).filter_map(|i| first_index.son(i)).collect();
        assert_eq!(sons, vec![1, 3, 5, 7]);

        // The merged leaf chain visits worker 0's leaves, then worker 1's
        let mut chain = Vec::new();
        let mut ids = Vec::new();
        let mut next = Some(1);
        while let Some(block) = next {
            let node = shared.read_node(block).expect("read leaf");
            chain.push(block);
            ids.extend((0..node.num_entries()).filter_map(|i| node.entry_id(i)));
            next = node.right_sibling();
        }
        assert_eq!(chain, vec![1, 3, 5, 7, 2, 4, 6, 8]);
        assert_eq!(ids, (0..32).collect::<Vec<u32>>());
    }

    #[test]
    fn test_parallel_build_over_gapped_allocation() {
        let store = MemoryStore::with_config(512, 1, FaultConfig::with_allocation_gap(2));
        let options = TreeOptions::default().with_leaf_capacity(16);
        let mut tree = BTree::with_store(store, &options).expect("init");

        let input = entries(1000);
        tree.bulkload_parallel(&input, 4).expect("bulkload");

        let expected: Vec<u32> = input.iter().map(|e| e.id).collect();
        assert_eq!(tree.scan_ids().expect("scan"), expected);
        let stats = tree.verify().expect("verify");
        assert_eq!(stats.entries, 1000);
        assert_eq!(stats.nodes_per_level[0], 64);
    }

    #[test]
    fn test_many_workers_need_extra_root_levels() {
        // 24 single-leaf workers overflow one index node of fan-out 4
        let options = TreeOptions::default()
            .with_leaf_capacity(4)
            .with_index_capacity(4);
        let mut tree = BTree::with_store(MemoryStore::new(512, 1), &options).expect("init");

        let input = entries(96);
        tree.bulkload_parallel(&input, 24).expect("bulkload");

        // Worker roots at level 0, then 6, 2 and 1 index nodes
        assert_eq!(tree.height(), 3);
        let stats = tree.verify().expect("verify");
        assert_eq!(stats.nodes_per_level, vec![24, 6, 2, 1]);
        assert_eq!(tree.scan_ids().expect("scan").len(), 96);
    }

    #[test]
    fn test_allocation_failure_aborts_build() {
        let store = MemoryStore::with_config(512, 1, FaultConfig::fail_allocation_after(10));
        let options = TreeOptions::default().with_leaf_capacity(16);
        let mut tree = BTree::with_store(store, &options).expect("init");

        let result = tree.bulkload_parallel(&entries(1000), 4);
        assert!(matches!(
            result,
            Err(BTreeError::Storage(StorageError::InjectedFault(_)))
        ));
        assert_eq!(tree.root(), 1);
        assert_eq!(tree.entry_count(), 0);
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn test_random_inputs_match_sequential() {
        let mut rng = StdRng::seed_from_u64(0x5EED);

        for _ in 0..8 {
            let n = rng.random_range(1..2_000u32);
            let workers = rng.random_range(2..9usize);
            let mut input: Vec<Entry> = (0..n)
                .map(|id| Entry::new(id, rng.random_range(-1000.0..1000.0f32)))
                .collect();
            crate::entry::sort_by_key(&mut input);

            let mut sequential = tree_with_leaves(16);
            sequential.bulkload(&input).expect("sequential");
            let expected = sequential.scan_ids().expect("scan");
            assert_eq!(expected.len(), n as usize);

            let mut parallel = tree_with_leaves(16);
            match parallel.bulkload_parallel(&input, workers) {
                Ok(_) => {
                    assert_eq!(parallel.scan_ids().expect("scan"), expected);
                    parallel.verify().expect("verify");
                }
                // Skewed partitions can legitimately build uneven subtrees
                Err(BTreeError::HeightMismatch { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }
}
