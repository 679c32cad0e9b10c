//! Merkle Archive - bounded persistent store for per-block Merkle trees
//!
//! Keeps one Merkle tree per block, keyed by the block's 256-bit hash.
//! Serialized trees live in append-oriented data files under a configurable
//! disk budget; their positions are mirrored to a parity-db index so the
//! store comes back after a restart exactly as last committed. Recently
//! requested trees are held in a FIFO memory cache bounded by serialized
//! size.
//!
//! # Architecture
//!
//! ```text
//! MerkleTreeFactory::get_merkle_tree(block)
//!     ├─ memory cache hit ──────────────► shared tree
//!     ├─ disk store hit ──► decode ─► cache ─► shared tree
//!     └─ miss
//!         ├─ fetch transaction hashes (BlockSource)
//!         ├─ compute tree on the worker pool
//!         ├─ store to disk (prunes oldest files if over budget)
//!         └─ cache ─► shared tree
//! ```
//!
//! # Disk layout
//!
//! ```text
//! <store_path>/
//!     mrk00000.dat    # serialized trees, appended back to back
//!     mrk00001.dat    # next file once the preferred size is passed
//!     index/          # parity-db mirror of positions and file infos
//! ```
//!
//! Pruning reclaims whole data files, oldest first, and never touches a file
//! that still holds one of the most recent [`store::MIN_BLOCKS_TO_KEEP`]
//! trees by block height.

pub mod cache;
pub mod error;
pub mod index;
pub mod schema;
pub mod store;
pub mod tree;
pub mod types;

pub use error::{MerkleArchiveError, Result};
pub use store::{LoadOutcome, MerkleTreeStore, MIN_BLOCKS_TO_KEEP};
pub use tree::{verify_proof, MerkleTree};
pub use types::{
    BlockId, DiskPosition, FileInfo, MerkleProof, MerkleStoreConfig, StoreStats, StoreStatus,
    TxHash,
};

use cache::MerkleTreeCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Shared, immutable handle to a cached Merkle tree
pub type SharedMerkleTree = Arc<MerkleTree>;

/// Source of block contents, supplied by the surrounding process
///
/// The factory asks it for the ordered transaction hashes of a block when a
/// tree has to be computed from scratch.
pub trait BlockSource: Send + Sync {
    /// Ordered transaction hashes of the block, or `None` if the block is
    /// not available
    fn transaction_hashes(&self, block_id: &BlockId) -> Result<Option<Vec<TxHash>>>;
}

/// Serves per-block Merkle trees from cache, disk, or fresh computation
///
/// One factory instance owns the disk store, the memory cache, and a worker
/// pool for tree computation. Construct it once and share it by reference;
/// all methods take `&self`.
pub struct MerkleTreeFactory {
    store: MerkleTreeStore,
    cache: Mutex<MerkleTreeCache>,
    /// Blocks with a computation currently running, so concurrent requests
    /// for the same block wait instead of duplicating the work
    in_flight: Mutex<HashMap<BlockId, watch::Receiver<()>>>,
    block_source: Arc<dyn BlockSource>,
    compute_pool: rayon::ThreadPool,
}

impl MerkleTreeFactory {
    /// Create a factory over the store at `config.store_path`
    pub async fn new(
        config: MerkleStoreConfig,
        block_source: Arc<dyn BlockSource>,
    ) -> Result<Self> {
        let store = MerkleTreeStore::open(&config).await?;
        let compute_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.compute_pool_threads)
            .thread_name(|i| format!("merkle-compute-{i}"))
            .build()
            .map_err(|err| MerkleArchiveError::ComputePool(err.to_string()))?;

        info!(
            "Merkle tree factory ready at {} ({} compute thread(s))",
            config.store_path.display(),
            compute_pool.current_num_threads()
        );

        Ok(Self {
            store,
            cache: Mutex::new(MerkleTreeCache::new(config.max_mem_cache_size)),
            in_flight: Mutex::new(HashMap::new()),
            block_source,
            compute_pool,
        })
    }

    /// Get the Merkle tree for a block, computing and persisting it on a miss
    ///
    /// `block_height` is the height of the requested block; `chain_height` is
    /// the current tip, which bounds what pruning may reclaim if the store
    /// has to make room. Returns `None` if the tree is neither stored nor
    /// computable because the block is unavailable.
    pub async fn get_merkle_tree(
        &self,
        block_id: &BlockId,
        block_height: i32,
        chain_height: i32,
    ) -> Option<SharedMerkleTree> {
        let _flight = loop {
            if let Some(tree) = self.cache.lock().lookup(block_id) {
                return Some(tree);
            }

            match self.take_flight_slot(block_id) {
                FlightSlot::Wait(mut running) => {
                    // Resolves once the running computation finishes,
                    // however it finishes; then look at the cache again.
                    let _ = running.changed().await;
                    continue;
                }
                FlightSlot::Owned(completed) => {
                    break FlightGuard {
                        in_flight: &self.in_flight,
                        block_id: *block_id,
                        _completed: completed,
                    };
                }
            }
        };

        // Another caller may have finished between our miss and taking
        // ownership
        if let Some(tree) = self.cache.lock().lookup(block_id) {
            return Some(tree);
        }

        match self.store.get(block_id).await {
            Ok(Some(tree)) => {
                let tree = Arc::new(tree);
                let entry_bytes = tree.serialized_size();
                self.cache.lock().insert(*block_id, tree.clone(), entry_bytes);
                return Some(tree);
            }
            Ok(None) => {}
            Err(err) => {
                warn!("Failed to read Merkle tree {} from disk: {err}", block_id);
            }
        }

        let tx_hashes = match self.block_source.transaction_hashes(block_id) {
            Ok(Some(hashes)) => hashes,
            Ok(None) => {
                debug!("Block {} unavailable, cannot compute its Merkle tree", block_id);
                return None;
            }
            Err(err) => {
                warn!("Failed to read block {}: {err}", block_id);
                return None;
            }
        };

        debug!(
            "Computing Merkle tree {} over {} transaction(s)",
            block_id,
            tx_hashes.len()
        );
        let (result_tx, result_rx) = oneshot::channel();
        self.compute_pool.spawn(move || {
            let _ = result_tx.send(MerkleTree::build(&tx_hashes));
        });
        let tree = match result_rx.await {
            Ok(tree) => Arc::new(tree),
            Err(_) => {
                warn!("Merkle tree computation for block {} was aborted", block_id);
                return None;
            }
        };

        // Persistence is best-effort for this request: the computed tree is
        // returned even if the store is out of room or failing.
        let tree_bytes = tree.to_bytes();
        match self
            .store
            .store(block_id, block_height, &tree_bytes, chain_height)
            .await
        {
            Ok(_) => {}
            Err(MerkleArchiveError::NoSpace(_)) => {
                warn!(
                    "No disk space for Merkle tree {}; serving it from memory only",
                    block_id
                );
            }
            Err(err) => {
                warn!("Failed to persist Merkle tree {}: {err}", block_id);
            }
        }

        self.cache
            .lock()
            .insert(*block_id, tree.clone(), tree_bytes.len() as u64);
        Some(tree)
    }

    /// Claim the in-flight slot for `block_id`, either as the owner who will
    /// compute the tree or as a waiter on the computation already running
    fn take_flight_slot(&self, block_id: &BlockId) -> FlightSlot {
        let mut in_flight = self.in_flight.lock();
        if let Some(running) = in_flight.get(block_id).cloned() {
            return FlightSlot::Wait(running);
        }

        let (completed, running) = watch::channel(());
        in_flight.insert(*block_id, running);
        FlightSlot::Owned(completed)
    }

    /// The underlying disk store, for operational tasks such as
    /// [`MerkleTreeStore::sweep_orphans`] and [`MerkleTreeStore::stats`]
    pub fn store(&self) -> &MerkleTreeStore {
        &self.store
    }

    /// Number of trees currently held in the memory cache
    pub fn cached_trees(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Outcome of claiming a block's in-flight slot: either this caller now owns
/// the computation, or another caller's computation is already running
enum FlightSlot {
    Wait(watch::Receiver<()>),
    Owned(watch::Sender<()>),
}

/// Marks a block's computation as finished when dropped, waking any waiters
///
/// The map entry is removed before the watch sender drops, so a woken waiter
/// that misses the cache re-enters as the new owner instead of spinning.
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<BlockId, watch::Receiver<()>>>,
    block_id: BlockId,
    _completed: watch::Sender<()>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.block_id);
    }
}
