// Life of a build:
// 1. Entries sorted by key come in
// 2. Sequential: fill leaves left to right, then build each index level
//    over the one below until a single root remains
//    Parallel: split the entries into contiguous ranges, build one subtree
//    per worker against the shared block store, then link the subtrees
//    level by level and route a new root over the worker roots
// 3. Record root and height in the header block
//
// System components:
//  - Block store (file or in-memory)
//  - Node encoding
//  - Bulk loaders

pub mod btree;
pub mod config;
pub mod entry;
pub mod storage;
