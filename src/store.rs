//! Merkle tree disk store
//!
//! Serialized trees are appended to numbered data files under the store
//! directory; positions and per-file bookkeeping are mirrored to the index
//! database (see [`crate::schema`] for the layout). When the configured disk
//! budget would be exceeded, whole data files are reclaimed oldest-first,
//! skipping any file that still holds one of the most recent
//! [`MIN_BLOCKS_TO_KEEP`] trees by block height.
//!
//! A single lock guards the in-memory bookkeeping and is held across the file
//! append and the index commit, which keeps appends linear and guarantees that
//! a position is only ever published after the bytes it points at are on disk.
//! Reads take the lock just long enough to copy the position; concurrent
//! readers then open their own file handles.
//!
//! All mutations either commit fully (index batch plus in-memory state) or
//! leave the bookkeeping untouched. An append that fails mid-write can leave
//! stray bytes in a data file; nothing references them, and the next store
//! targeting that offset overwrites them.

use crate::error::{MerkleArchiveError, Result};
use crate::index::{IndexBatch, MerkleTreeIndexDb};
use crate::schema;
use crate::tree::MerkleTree;
use crate::types::{BlockId, DiskPosition, FileInfo, MerkleStoreConfig, StoreStats, StoreStatus};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Data files holding one of this many most recent trees (by block height)
/// are never pruned
pub const MIN_BLOCKS_TO_KEEP: i32 = 288;

/// Result of loading the index at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The committed state was reconstructed
    Loaded,
    /// The index was unreadable or inconsistent and was reset to empty
    Reset,
}

/// In-memory bookkeeping, mirrored to the index database
struct StoreState {
    /// Tree positions by block id
    positions: HashMap<BlockId, DiskPosition>,
    /// File infos by file suffix, oldest first
    file_infos: BTreeMap<u32, FileInfo>,
    /// Where the next appended tree will start
    next_position: DiskPosition,
    /// Total bytes across all data files
    disk_usage: u64,
}

impl StoreState {
    fn empty() -> Self {
        Self {
            positions: HashMap::new(),
            file_infos: BTreeMap::new(),
            next_position: DiskPosition::START,
            disk_usage: 0,
        }
    }
}

/// Size-bounded disk store for serialized Merkle trees
pub struct MerkleTreeStore {
    /// Directory holding the data files and the index database
    store_dir: PathBuf,
    /// Soft cap on a data file's size
    preferred_file_size: u64,
    /// Hard cap on the total size of all data files
    max_disk_space: u64,
    /// Bookkeeping guarded by the store lock
    state: Mutex<StoreState>,
    /// Durable mirror of the bookkeeping
    index: MerkleTreeIndexDb,
}

impl MerkleTreeStore {
    /// Open the store, creating the directory and index database as needed
    /// and reloading the committed bookkeeping
    pub async fn open(config: &MerkleStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.store_path)?;

        let index = MerkleTreeIndexDb::open(&config.store_path.join("index"))?;
        let store = Self {
            store_dir: config.store_path.clone(),
            preferred_file_size: config.preferred_file_size,
            max_disk_space: config.max_disk_space,
            state: Mutex::new(StoreState::empty()),
            index,
        };

        store.load_index().await?;
        Ok(store)
    }

    /// Store a serialized tree for the given block
    ///
    /// `chain_height` is the current tip height, used to keep recent trees
    /// out of pruning's reach. Returns [`StoreStatus::AlreadyPresent`]
    /// without writing if a tree for `block_id` is already stored, and
    /// [`MerkleArchiveError::NoSpace`] if pruning could not make room under
    /// the height guard.
    pub async fn store(
        &self,
        block_id: &BlockId,
        block_height: i32,
        tree_bytes: &[u8],
        chain_height: i32,
    ) -> Result<StoreStatus> {
        let mut state = self.state.lock();
        self.store_locked(&mut state, block_id, block_height, tree_bytes, chain_height)
    }

    /// Read back the tree stored for the given block
    pub async fn get(&self, block_id: &BlockId) -> Result<Option<MerkleTree>> {
        let position = { self.state.lock().positions.get(block_id).copied() };
        let Some(position) = position else {
            return Ok(None);
        };

        let file = File::open(self.data_file_path(position.file))?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(position.offset))?;
        let tree = MerkleTree::decode(&mut reader)?;

        debug!(
            "Read Merkle tree {} from file {} offset {}",
            block_id, position.file, position.offset
        );
        Ok(Some(tree))
    }

    /// Whether a tree is stored for the given block
    pub fn contains(&self, block_id: &BlockId) -> bool {
        self.state.lock().positions.contains_key(block_id)
    }

    /// Make room for `additional_bytes` by pruning whole data files
    /// oldest-first, skipping files still under the height guard
    ///
    /// Returns `false` without changing anything if not enough space could
    /// be reclaimed.
    pub async fn prune(&self, additional_bytes: u64, chain_height: i32) -> Result<bool> {
        let mut state = self.state.lock();
        self.prune_locked(&mut state, additional_bytes, chain_height)
    }

    /// Reconstruct the bookkeeping from the index database
    ///
    /// Any malformed or inconsistent index resets the store to empty;
    /// existing data files are left on disk and ignored.
    pub async fn load_index(&self) -> Result<LoadOutcome> {
        let mut state = self.state.lock();
        self.load_locked(&mut state)
    }

    /// Clear the bookkeeping and the durable index
    ///
    /// Data files are not deleted; [`MerkleTreeStore::sweep_orphans`]
    /// removes files left behind by a reset.
    pub async fn reset_state(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.reset_locked(&mut state)
    }

    /// Remove data files in the store directory that no live file info
    /// references; returns the number of files removed
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let state = self.state.lock();

        let mut removed = 0;
        for entry in std::fs::read_dir(&self.store_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(file) = schema::parse_data_file_name(name) else {
                continue;
            };
            if state.file_infos.contains_key(&file) {
                continue;
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    info!("Removed orphan Merkle tree data file {name}");
                    removed += 1;
                }
                Err(err) => warn!("Failed to remove orphan data file {name}: {err}"),
            }
        }

        Ok(removed)
    }

    /// Snapshot of the store's bookkeeping
    pub fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        StoreStats {
            tree_count: state.positions.len(),
            file_count: state.file_infos.len(),
            disk_usage: state.disk_usage,
            next_position: state.next_position,
        }
    }

    fn store_locked(
        &self,
        state: &mut StoreState,
        block_id: &BlockId,
        block_height: i32,
        tree_bytes: &[u8],
        chain_height: i32,
    ) -> Result<StoreStatus> {
        if state.positions.contains_key(block_id) {
            debug!("Merkle tree {} already stored", block_id);
            return Ok(StoreStatus::AlreadyPresent);
        }

        let record_len = tree_bytes.len() as u64;
        if !self.prune_locked(state, record_len, chain_height)? {
            warn!(
                "Cannot store Merkle tree {}: pruning could not free {} bytes",
                block_id, record_len
            );
            return Err(MerkleArchiveError::NoSpace(record_len));
        }

        // Roll over to a fresh file once a write would push the current one
        // past the preferred size; an oversized record starting a file is
        // written whole regardless.
        let mut position = state.next_position;
        if position.offset > 0 && position.offset + record_len > self.preferred_file_size {
            position = DiskPosition {
                file: position.file + 1,
                offset: 0,
            };
        }

        self.write_record(&position, tree_bytes)?;

        let mut info = state.file_infos.get(&position.file).copied().unwrap_or(FileInfo {
            size: 0,
            greatest_height: block_height,
        });
        info.size += record_len;
        info.greatest_height = info.greatest_height.max(block_height);
        let next_position = DiskPosition {
            file: position.file,
            offset: position.offset + record_len,
        };

        // The position is published only after both the bytes and the index
        // batch are durable; a failed commit leaves the bookkeeping untouched.
        let mut batch = IndexBatch::new();
        batch.put_position(block_id, &position);
        batch.put_file_info(position.file, &info);
        batch.put_next_position(&next_position);
        self.index.commit(batch)?;

        state.positions.insert(*block_id, position);
        state.file_infos.insert(position.file, info);
        state.next_position = next_position;
        state.disk_usage += record_len;

        debug!(
            "Stored Merkle tree {} ({} bytes) at file {} offset {}",
            block_id, record_len, position.file, position.offset
        );
        Ok(StoreStatus::Stored)
    }

    fn prune_locked(
        &self,
        state: &mut StoreState,
        additional_bytes: u64,
        chain_height: i32,
    ) -> Result<bool> {
        if state.disk_usage + additional_bytes <= self.max_disk_space {
            return Ok(true);
        }

        // Plan first: pick victims oldest-first under the height guard, and
        // only touch anything once the plan reclaims enough space.
        let height_guard = chain_height.saturating_sub(MIN_BLOCKS_TO_KEEP);
        let mut victims = BTreeSet::new();
        let mut projected_usage = state.disk_usage;
        for (&file, info) in &state.file_infos {
            if projected_usage + additional_bytes <= self.max_disk_space {
                break;
            }
            if info.greatest_height > height_guard {
                continue;
            }
            victims.insert(file);
            projected_usage -= info.size;
        }

        if projected_usage + additional_bytes > self.max_disk_space {
            debug!(
                "Pruning cannot free {} bytes: {} of {} in use, {} file(s) under the height guard",
                additional_bytes,
                state.disk_usage,
                self.max_disk_space,
                state.file_infos.len() - victims.len()
            );
            return Ok(false);
        }

        let removed_positions: Vec<BlockId> = state
            .positions
            .iter()
            .filter(|(_, position)| victims.contains(&position.file))
            .map(|(block_id, _)| *block_id)
            .collect();

        let mut next_position = state.next_position;
        if victims.contains(&next_position.file) {
            // Restart at the smallest suffix that will be free after the purge
            let mut free = 0u32;
            while state.file_infos.contains_key(&free) && !victims.contains(&free) {
                free += 1;
            }
            next_position = DiskPosition {
                file: free,
                offset: 0,
            };
        }

        let mut batch = IndexBatch::new();
        for block_id in &removed_positions {
            batch.delete_position(block_id);
        }
        for &file in &victims {
            batch.delete_file_info(file);
        }
        batch.put_next_position(&next_position);

        // Commit the shrunken index before unlinking: a crash in between
        // leaves orphan files, which are tolerated, never dangling positions.
        self.index.commit(batch)?;

        for block_id in &removed_positions {
            state.positions.remove(block_id);
        }
        for &file in &victims {
            if let Some(info) = state.file_infos.remove(&file) {
                state.disk_usage -= info.size;
            }
            let path = self.data_file_path(file);
            match std::fs::remove_file(&path) {
                Ok(()) => info!("Pruned Merkle tree data file {}", path.display()),
                Err(err) => warn!(
                    "Failed to remove pruned data file {}: {err}",
                    path.display()
                ),
            }
        }
        state.next_position = next_position;

        debug!(
            "Pruned {} tree(s) across {} file(s); {} of {} bytes in use",
            removed_positions.len(),
            victims.len(),
            state.disk_usage,
            self.max_disk_space
        );
        Ok(true)
    }

    fn load_locked(&self, state: &mut StoreState) -> Result<LoadOutcome> {
        let Some(contents) = self.index.load()? else {
            warn!("Merkle tree index is corrupt, resetting to an empty store");
            self.reset_locked(state)?;
            return Ok(LoadOutcome::Reset);
        };

        if !self.validate_contents(&contents) {
            warn!("Merkle tree index is inconsistent, resetting to an empty store");
            self.reset_locked(state)?;
            return Ok(LoadOutcome::Reset);
        }

        state.disk_usage = contents.file_infos.values().map(|info| info.size).sum();
        state.positions = contents.positions;
        state.file_infos = contents.file_infos;
        state.next_position = contents.next_position.unwrap_or(DiskPosition::START);

        info!(
            "Merkle tree index loaded: {} tree(s) in {} data file(s), {} bytes",
            state.positions.len(),
            state.file_infos.len(),
            state.disk_usage
        );
        Ok(LoadOutcome::Loaded)
    }

    /// Cross-checks between the loaded key families; any failure means the
    /// index does not describe a state this store could have committed
    fn validate_contents(&self, contents: &crate::index::IndexContents) -> bool {
        for position in contents.positions.values() {
            let Some(info) = contents.file_infos.get(&position.file) else {
                return false;
            };
            if position.offset >= info.size {
                return false;
            }
        }

        // The next position either sits exactly at the end of a live file or
        // at the start of a file that does not exist yet (a fresh roll-over
        // suffix, or a suffix freed by pruning).
        match (contents.next_position, contents.file_infos.is_empty()) {
            (None, true) => contents.positions.is_empty(),
            (None, false) => false,
            (Some(next), true) => next == DiskPosition::START,
            (Some(next), false) => match contents.file_infos.get(&next.file) {
                Some(info) => next.offset == info.size,
                None => next.offset == 0,
            },
        }
    }

    fn reset_locked(&self, state: &mut StoreState) -> Result<()> {
        self.index.wipe()?;
        *state = StoreState::empty();
        warn!("Merkle tree store state reset; stale data files on disk are ignored");
        Ok(())
    }

    fn write_record(&self, position: &DiskPosition, bytes: &[u8]) -> Result<()> {
        let path = self.data_file_path(position.file);
        let mut file = OpenOptions::new().write(true).create(true).open(&path)?;
        file.seek(SeekFrom::Start(position.offset))?;
        file.write_all(bytes)?;
        file.sync_data()?;
        Ok(())
    }

    fn data_file_path(&self, file: u32) -> PathBuf {
        self.store_dir.join(schema::data_file_name(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxHash;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn test_config(dir: &TempDir) -> MerkleStoreConfig {
        MerkleStoreConfig {
            store_path: dir.path().to_path_buf(),
            ..MerkleStoreConfig::default()
        }
    }

    fn test_id(n: u8) -> BlockId {
        BlockId([n; 32])
    }

    /// Opaque record bytes for size accounting tests
    fn record(len: usize) -> Vec<u8> {
        vec![0xA5; len]
    }

    fn test_hashes(n: usize, salt: u8) -> Vec<TxHash> {
        (0..n)
            .map(|i| *blake3::hash(&[salt, i as u8]).as_bytes())
            .collect()
    }

    async fn fill_store(store: &MerkleTreeStore, count: u8, record_len: usize, chain_height: i32) {
        for n in 1..=count {
            let status = store
                .store(&test_id(n), n as i32, &record(record_len), chain_height)
                .await
                .unwrap();
            assert_eq!(status, StoreStatus::Stored);
        }
    }

    #[tokio::test]
    async fn files_roll_at_preferred_size() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 4 * MIB,
            max_disk_space: 100 * MIB,
            ..test_config(&dir)
        };
        let store = MerkleTreeStore::open(&config).await.unwrap();

        // Ten 1 MiB trees at heights 1..=10 fill files 0..=2 as 4+4+2
        fill_store(&store, 10, MIB as usize, 500).await;

        let stats = store.stats();
        assert_eq!(stats.tree_count, 10);
        assert_eq!(stats.file_count, 3);
        assert_eq!(stats.disk_usage, 10 * MIB);
        assert_eq!(
            stats.next_position,
            DiskPosition {
                file: 2,
                offset: 2 * MIB
            }
        );

        let state = store.state.lock();
        assert_eq!(
            state.file_infos[&0],
            FileInfo {
                size: 4 * MIB,
                greatest_height: 4
            }
        );
        assert_eq!(
            state.file_infos[&1],
            FileInfo {
                size: 4 * MIB,
                greatest_height: 8
            }
        );
        assert_eq!(
            state.file_infos[&2],
            FileInfo {
                size: 2 * MIB,
                greatest_height: 10
            }
        );
        drop(state);

        for file in 0..3u32 {
            let len = std::fs::metadata(store.data_file_path(file)).unwrap().len();
            assert_eq!(len, if file == 2 { 2 * MIB } else { 4 * MIB });
        }
    }

    #[tokio::test]
    async fn prune_removes_oldest_files() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 4 * MIB,
            max_disk_space: 10 * MIB,
            ..test_config(&dir)
        };
        let store = MerkleTreeStore::open(&config).await.unwrap();
        fill_store(&store, 10, MIB as usize, 500).await;

        // An eleventh tree overflows the budget; file 0 (heights 1..=4) is
        // old enough to reclaim, files 1 and 2 stay.
        let status = store
            .store(&test_id(11), 11, &record(MIB as usize), 500)
            .await
            .unwrap();
        assert_eq!(status, StoreStatus::Stored);

        let stats = store.stats();
        assert_eq!(stats.tree_count, 7);
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.disk_usage, 7 * MIB);

        let state = store.state.lock();
        assert!(state.file_infos.contains_key(&1));
        assert_eq!(
            state.file_infos[&2],
            FileInfo {
                size: 3 * MIB,
                greatest_height: 11
            }
        );
        for n in 1..=4u8 {
            assert!(!state.positions.contains_key(&test_id(n)));
        }
        for n in 5..=11u8 {
            assert!(state.positions.contains_key(&test_id(n)));
        }
        // Every live file still holds at least one tree
        for &file in state.file_infos.keys() {
            assert!(state
                .positions
                .values()
                .any(|position| position.file == file));
        }
        drop(state);

        assert!(!store.data_file_path(0).exists());
        assert!(store.data_file_path(1).exists());
    }

    #[tokio::test]
    async fn prune_respects_height_guard() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 4 * MIB,
            max_disk_space: 10 * MIB,
            ..test_config(&dir)
        };
        let store = MerkleTreeStore::open(&config).await.unwrap();
        fill_store(&store, 10, MIB as usize, 500).await;

        // With the tip at height 10, every file holds a recent tree and
        // nothing may be reclaimed.
        let result = store.store(&test_id(11), 11, &record(MIB as usize), 10).await;
        assert!(matches!(result, Err(MerkleArchiveError::NoSpace(_))));

        let stats = store.stats();
        assert_eq!(stats.tree_count, 10);
        assert_eq!(stats.file_count, 3);
        assert_eq!(stats.disk_usage, 10 * MIB);
        assert!(store.data_file_path(0).exists());
    }

    #[tokio::test]
    async fn oversized_record_gets_its_own_file() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 4096,
            max_disk_space: 1024 * 1024,
            ..test_config(&dir)
        };
        let store = MerkleTreeStore::open(&config).await.unwrap();

        // Larger than the preferred size, still written whole into file 0
        store
            .store(&test_id(1), 1, &record(10_000), 500)
            .await
            .unwrap();
        let stats = store.stats();
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.disk_usage, 10_000);
        assert_eq!(
            stats.next_position,
            DiskPosition {
                file: 0,
                offset: 10_000
            }
        );

        // The next record rolls over to file 1
        store
            .store(&test_id(2), 2, &record(1_000), 500)
            .await
            .unwrap();
        let state = store.state.lock();
        assert_eq!(
            state.positions[&test_id(2)],
            DiskPosition { file: 1, offset: 0 }
        );
        assert_eq!(state.file_infos[&1].size, 1_000);
    }

    #[tokio::test]
    async fn record_larger_than_budget_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 4096,
            max_disk_space: 8192,
            ..test_config(&dir)
        };
        let store = MerkleTreeStore::open(&config).await.unwrap();

        let result = store.store(&test_id(1), 1, &record(10_000), 500).await;
        assert!(matches!(result, Err(MerkleArchiveError::NoSpace(10_000))));
        assert_eq!(store.stats().tree_count, 0);
        assert!(!store.data_file_path(0).exists());
    }

    #[tokio::test]
    async fn store_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = MerkleTreeStore::open(&test_config(&dir)).await.unwrap();

        let bytes = record(1_000);
        let first = store.store(&test_id(1), 1, &bytes, 500).await.unwrap();
        let second = store.store(&test_id(1), 1, &bytes, 500).await.unwrap();
        assert_eq!(first, StoreStatus::Stored);
        assert_eq!(second, StoreStatus::AlreadyPresent);

        let stats = store.stats();
        assert_eq!(stats.tree_count, 1);
        assert_eq!(stats.disk_usage, 1_000);
        assert_eq!(
            std::fs::metadata(store.data_file_path(0)).unwrap().len(),
            1_000
        );
    }

    #[tokio::test]
    async fn get_round_trips_trees() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 300,
            ..test_config(&dir)
        };
        let store = MerkleTreeStore::open(&config).await.unwrap();

        let trees: Vec<_> = [5usize, 8, 13]
            .iter()
            .map(|&n| MerkleTree::build(&test_hashes(n, n as u8)))
            .collect();
        for (n, tree) in trees.iter().enumerate() {
            let bytes = tree.to_bytes();
            store
                .store(&test_id(n as u8), n as i32, &bytes, 500)
                .await
                .unwrap();
        }

        for (n, tree) in trees.iter().enumerate() {
            let read = store.get(&test_id(n as u8)).await.unwrap().unwrap();
            assert_eq!(&read, tree);
            assert_eq!(read.to_bytes(), tree.to_bytes());
        }

        assert_eq!(store.get(&test_id(99)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 300,
            ..test_config(&dir)
        };

        let trees: Vec<_> = (0..5u8)
            .map(|n| MerkleTree::build(&test_hashes(4 + n as usize, n)))
            .collect();

        let stats = {
            let store = MerkleTreeStore::open(&config).await.unwrap();
            for (n, tree) in trees.iter().enumerate() {
                store
                    .store(&test_id(n as u8), n as i32, &tree.to_bytes(), 500)
                    .await
                    .unwrap();
            }
            store.stats()
        };

        let store = MerkleTreeStore::open(&config).await.unwrap();
        let reloaded = store.stats();
        assert_eq!(reloaded.tree_count, stats.tree_count);
        assert_eq!(reloaded.file_count, stats.file_count);
        assert_eq!(reloaded.disk_usage, stats.disk_usage);
        assert_eq!(reloaded.next_position, stats.next_position);

        for (n, tree) in trees.iter().enumerate() {
            let read = store.get(&test_id(n as u8)).await.unwrap().unwrap();
            assert_eq!(&read, tree);
        }
    }

    #[tokio::test]
    async fn interrupted_append_is_overwritten_after_reopen() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 100_000,
            ..test_config(&dir)
        };

        let committed_stats = {
            let store = MerkleTreeStore::open(&config).await.unwrap();
            for n in 0..3u8 {
                let tree = MerkleTree::build(&test_hashes(6, n));
                store
                    .store(&test_id(n), n as i32, &tree.to_bytes(), 500)
                    .await
                    .unwrap();
            }
            store.stats()
        };

        // Simulate a crash mid-append: stray bytes past the committed offset
        let data_file = dir.path().join(schema::data_file_name(0));
        let mut file = OpenOptions::new().append(true).open(&data_file).unwrap();
        file.write_all(&[0xEE; 37]).unwrap();
        drop(file);

        let store = MerkleTreeStore::open(&config).await.unwrap();
        let reloaded = store.stats();
        assert_eq!(reloaded.tree_count, committed_stats.tree_count);
        assert_eq!(reloaded.disk_usage, committed_stats.disk_usage);
        assert_eq!(reloaded.next_position, committed_stats.next_position);

        // The next store lands on the committed offset, overwriting the
        // stray bytes, and reads back cleanly.
        let tree = MerkleTree::build(&test_hashes(9, 9));
        store
            .store(&test_id(9), 9, &tree.to_bytes(), 500)
            .await
            .unwrap();
        let position = store.state.lock().positions[&test_id(9)];
        assert_eq!(position, committed_stats.next_position);
        let read = store.get(&test_id(9)).await.unwrap().unwrap();
        assert_eq!(read, tree);
    }

    #[tokio::test]
    async fn prune_restarts_numbering_when_everything_goes() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 100,
            max_disk_space: 500,
            ..test_config(&dir)
        };
        let store = MerkleTreeStore::open(&config).await.unwrap();

        // 150-byte records each roll into their own file
        for n in 1..=3u8 {
            store
                .store(&test_id(n), n as i32, &record(150), 500)
                .await
                .unwrap();
        }
        assert_eq!(store.stats().file_count, 3);

        // A 500-byte record can only fit by pruning all three files,
        // including the one currently being appended to
        store
            .store(&test_id(4), 4, &record(500), 500)
            .await
            .unwrap();

        let state = store.state.lock();
        assert_eq!(state.positions.len(), 1);
        assert_eq!(
            state.positions[&test_id(4)],
            DiskPosition { file: 0, offset: 0 }
        );
        assert_eq!(state.file_infos.len(), 1);
        assert_eq!(state.file_infos[&0].size, 500);
        drop(state);

        assert!(store.data_file_path(0).exists());
        assert!(!store.data_file_path(1).exists());
        assert!(!store.data_file_path(2).exists());
    }

    #[tokio::test]
    async fn prune_skips_guarded_files_and_picks_smallest_free_suffix() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 100,
            max_disk_space: 500,
            ..test_config(&dir)
        };
        let store = MerkleTreeStore::open(&config).await.unwrap();

        // File 0 holds a recent tree; files 1 and 2 hold old ones
        store.store(&test_id(1), 400, &record(150), 500).await.unwrap();
        store.store(&test_id(2), 1, &record(150), 500).await.unwrap();
        store.store(&test_id(3), 2, &record(150), 500).await.unwrap();

        // Fitting 350 more bytes needs both old files gone; pruning skips
        // file 0 and numbering restarts at the smallest freed suffix
        store.store(&test_id(4), 4, &record(350), 500).await.unwrap();

        let state = store.state.lock();
        assert!(state.positions.contains_key(&test_id(1)));
        assert!(!state.positions.contains_key(&test_id(2)));
        assert!(!state.positions.contains_key(&test_id(3)));
        assert_eq!(
            state.positions[&test_id(4)],
            DiskPosition { file: 1, offset: 0 }
        );
        assert_eq!(
            state.file_infos.keys().copied().collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(state.file_infos[&1].size, 350);
    }

    #[tokio::test]
    async fn reopen_after_prune_reset_next_position() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 100,
            max_disk_space: 500,
            ..test_config(&dir)
        };

        {
            let store = MerkleTreeStore::open(&config).await.unwrap();
            store.store(&test_id(1), 400, &record(150), 500).await.unwrap();
            store.store(&test_id(2), 1, &record(150), 500).await.unwrap();
            store.store(&test_id(3), 2, &record(150), 500).await.unwrap();

            // Frees files 1 and 2 and leaves the next position pointing at
            // the freed suffix 1, with no append afterwards
            assert!(store.prune(350, 500).await.unwrap());
            assert_eq!(
                store.stats().next_position,
                DiskPosition { file: 1, offset: 0 }
            );
        }

        let store = MerkleTreeStore::open(&config).await.unwrap();
        let stats = store.stats();
        assert_eq!(stats.tree_count, 1);
        assert_eq!(stats.file_count, 1);
        assert_eq!(
            stats.next_position,
            DiskPosition { file: 1, offset: 0 }
        );
        assert_eq!(store.load_index().await.unwrap(), LoadOutcome::Loaded);
    }

    #[tokio::test]
    async fn prune_is_a_no_op_under_budget() {
        let dir = TempDir::new().unwrap();
        let store = MerkleTreeStore::open(&test_config(&dir)).await.unwrap();
        fill_store(&store, 3, 1_000, 500).await;

        assert!(store.prune(1_000, 500).await.unwrap());
        assert_eq!(store.stats().tree_count, 3);
    }

    #[tokio::test]
    async fn reset_keeps_files_and_sweep_removes_them() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 1_000,
            ..test_config(&dir)
        };
        let store = MerkleTreeStore::open(&config).await.unwrap();
        fill_store(&store, 3, 800, 500).await;
        assert_eq!(store.stats().file_count, 3);

        store.reset_state().await.unwrap();
        let stats = store.stats();
        assert_eq!(stats.tree_count, 0);
        assert_eq!(stats.disk_usage, 0);
        assert_eq!(stats.next_position, DiskPosition::START);

        // The reset leaves the data files behind; the sweep reclaims them
        assert!(store.data_file_path(0).exists());
        assert_eq!(store.sweep_orphans().await.unwrap(), 3);
        assert!(!store.data_file_path(0).exists());

        // And the store keeps working from a clean slate
        store
            .store(&test_id(9), 9, &record(100), 500)
            .await
            .unwrap();
        assert_eq!(
            store.state.lock().positions[&test_id(9)],
            DiskPosition { file: 0, offset: 0 }
        );
    }

    #[tokio::test]
    async fn sweep_keeps_live_files() {
        let dir = TempDir::new().unwrap();
        let config = MerkleStoreConfig {
            preferred_file_size: 1_000,
            ..test_config(&dir)
        };
        let store = MerkleTreeStore::open(&config).await.unwrap();
        fill_store(&store, 2, 800, 500).await;

        // A stray file that was never indexed
        std::fs::write(dir.path().join(schema::data_file_name(7)), b"stale").unwrap();

        assert_eq!(store.sweep_orphans().await.unwrap(), 1);
        assert!(store.data_file_path(0).exists());
        assert!(store.data_file_path(1).exists());
        assert!(!store.data_file_path(7).exists());
    }

    #[tokio::test]
    async fn inconsistent_index_resets_on_load() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        {
            let store = MerkleTreeStore::open(&config).await.unwrap();
            fill_store(&store, 2, 500, 500).await;

            // Sabotage: a position pointing into a file with no info record
            let mut batch = IndexBatch::new();
            batch.put_position(
                &test_id(9),
                &DiskPosition {
                    file: 42,
                    offset: 0,
                },
            );
            store.index.commit(batch).unwrap();
        }

        let store = MerkleTreeStore::open(&config).await.unwrap();
        let stats = store.stats();
        assert_eq!(stats.tree_count, 0);
        assert_eq!(stats.file_count, 0);
        assert_eq!(store.load_index().await.unwrap(), LoadOutcome::Loaded);
    }
}
