//! Durable index of the Merkle tree data files
//!
//! Mirrors the disk store's in-memory bookkeeping (tree positions, file
//! infos, next position) to a parity-db column. Every state change is
//! committed as one atomic batch, so a crash never exposes a partial update;
//! replaying the keyspace at load reconstructs the committed state exactly.

use crate::error::Result;
use crate::schema;
use crate::types::{BlockId, DiskPosition, FileInfo};
use parity_db::{Db, Options};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{info, warn};

/// Column holding all index entries
const COL_INDEX: u8 = 0;

/// Batched delta against the index
///
/// Collects puts and deletes for one state-changing operation; committed
/// atomically by [`MerkleTreeIndexDb::commit`].
#[derive(Default)]
pub struct IndexBatch {
    ops: Vec<(u8, Vec<u8>, Option<Vec<u8>>)>,
}

impl IndexBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tree position
    pub fn put_position(&mut self, block_id: &BlockId, position: &DiskPosition) {
        self.ops.push((
            COL_INDEX,
            schema::position_key(block_id),
            Some(schema::encode_position(position).to_vec()),
        ));
    }

    /// Remove a tree position
    pub fn delete_position(&mut self, block_id: &BlockId) {
        self.ops
            .push((COL_INDEX, schema::position_key(block_id), None));
    }

    /// Record a data file's info
    pub fn put_file_info(&mut self, file: u32, info: &FileInfo) {
        self.ops.push((
            COL_INDEX,
            schema::file_info_key(file),
            Some(schema::encode_file_info(info).to_vec()),
        ));
    }

    /// Remove a data file's info
    pub fn delete_file_info(&mut self, file: u32) {
        self.ops.push((COL_INDEX, schema::file_info_key(file), None));
    }

    /// Record the next append position
    pub fn put_next_position(&mut self, position: &DiskPosition) {
        self.ops.push((
            COL_INDEX,
            schema::NEXT_POSITION_KEY.to_vec(),
            Some(schema::encode_position(position).to_vec()),
        ));
    }

    /// Number of operations collected so far
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// State reconstructed from the index keyspace
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IndexContents {
    /// Tree positions by block id
    pub positions: HashMap<BlockId, DiskPosition>,
    /// File infos by file suffix
    pub file_infos: BTreeMap<u32, FileInfo>,
    /// Next append position, if one was ever committed
    pub next_position: Option<DiskPosition>,
}

/// Handle to the on-disk index database
pub struct MerkleTreeIndexDb {
    db: Db,
}

impl MerkleTreeIndexDb {
    /// Open or create the index database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let mut options = Options::with_columns(path, 1);
        options.columns[COL_INDEX as usize].btree_index = true;

        let db = Db::open_or_create(&options)?;
        info!("Merkle tree index database opened at {}", path.display());

        Ok(Self { db })
    }

    /// Commit a batched delta atomically
    pub fn commit(&self, batch: IndexBatch) -> Result<()> {
        self.db.commit(batch.ops)?;
        Ok(())
    }

    /// Scan the whole keyspace and reconstruct the committed state
    ///
    /// Returns `None` if any key or value is malformed; the caller is
    /// expected to reset to an empty state.
    pub fn load(&self) -> Result<Option<IndexContents>> {
        let mut contents = IndexContents::default();

        let mut iter = self.db.iter(COL_INDEX)?;
        while let Some((key, value)) = iter.next()? {
            match key.first() {
                Some(&schema::POSITION_PREFIX) => {
                    let (Some(block_id), Some(position)) = (
                        schema::parse_position_key(&key),
                        schema::decode_position(&value),
                    ) else {
                        warn!("Malformed tree position entry in index");
                        return Ok(None);
                    };
                    contents.positions.insert(block_id, position);
                }
                Some(&schema::FILE_INFO_PREFIX) => {
                    let (Some(file), Some(file_info)) = (
                        schema::parse_file_info_key(&key),
                        schema::decode_file_info(&value),
                    ) else {
                        warn!("Malformed file info entry in index");
                        return Ok(None);
                    };
                    contents.file_infos.insert(file, file_info);
                }
                _ if key == schema::NEXT_POSITION_KEY => {
                    let Some(position) = schema::decode_position(&value) else {
                        warn!("Malformed next position entry in index");
                        return Ok(None);
                    };
                    contents.next_position = Some(position);
                }
                _ => {
                    warn!("Unknown key in Merkle tree index: {}", hex::encode(&key));
                    return Ok(None);
                }
            }
        }

        Ok(Some(contents))
    }

    /// Delete every entry in a single batch
    pub fn wipe(&self) -> Result<()> {
        let mut deletes = Vec::new();
        let mut iter = self.db.iter(COL_INDEX)?;
        while let Some((key, _)) = iter.next()? {
            deletes.push((COL_INDEX, key, None));
        }

        let count = deletes.len();
        self.db.commit(deletes)?;
        info!("Merkle tree index wiped ({count} entries)");
        Ok(())
    }
}
