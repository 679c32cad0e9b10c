//! In-memory Merkle tree cache
//!
//! A FIFO cache bounded by the aggregate serialized size of its entries.
//! Entries are evicted strictly in insertion order; lookups never promote.
//! A single entry larger than the bound is admitted and stays the sole
//! resident until the next insert evicts it.

use crate::types::BlockId;
use crate::SharedMerkleTree;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// FIFO cache of decoded Merkle trees
pub struct MerkleTreeCache {
    /// Block ids in insertion order
    queue: VecDeque<BlockId>,
    /// Cached trees and their accounted sizes by block id
    trees: HashMap<BlockId, (SharedMerkleTree, u64)>,
    /// Aggregate serialized size of the cached trees
    size_bytes: u64,
    /// Cap on `size_bytes`
    max_size_bytes: u64,
}

impl MerkleTreeCache {
    /// Create an empty cache bounded to `max_size_bytes`
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            trees: HashMap::new(),
            size_bytes: 0,
            max_size_bytes,
        }
    }

    /// Look up a cached tree without touching the eviction order
    pub fn lookup(&self, block_id: &BlockId) -> Option<SharedMerkleTree> {
        self.trees.get(block_id).map(|(tree, _)| tree.clone())
    }

    /// Insert a tree accounted at `entry_bytes`, evicting oldest entries
    /// until it fits; no-op if the block is already cached
    pub fn insert(&mut self, block_id: BlockId, tree: SharedMerkleTree, entry_bytes: u64) {
        if self.trees.contains_key(&block_id) {
            return;
        }

        while self.size_bytes + entry_bytes > self.max_size_bytes {
            let Some(oldest) = self.queue.pop_front() else {
                break;
            };
            if let Some((_, evicted_bytes)) = self.trees.remove(&oldest) {
                self.size_bytes -= evicted_bytes;
                debug!("Evicted Merkle tree {} from cache", oldest);
            }
        }

        self.queue.push_back(block_id);
        self.trees.insert(block_id, (tree, entry_bytes));
        self.size_bytes += entry_bytes;
    }

    /// Number of cached trees
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Aggregate serialized size of the cached trees
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}
