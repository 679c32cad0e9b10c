//! Merkle archive types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Transaction hash (Blake3, 32 bytes)
pub type TxHash = [u8; 32];

/// Identifier of the block a Merkle tree was computed from (256-bit block hash)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(
    #[serde(
        serialize_with = "serialize_hash",
        deserialize_with = "deserialize_hash"
    )]
    pub [u8; 32],
);

impl BlockId {
    /// Block id as raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for BlockId {
    fn from(bytes: [u8; 32]) -> Self {
        BlockId(bytes)
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Position of a serialized tree record inside a data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskPosition {
    /// Data file suffix
    pub file: u32,
    /// Byte offset of the record start within the file
    pub offset: u64,
}

impl DiskPosition {
    /// Start of the very first data file
    pub const START: DiskPosition = DiskPosition { file: 0, offset: 0 };
}

/// Bookkeeping kept for every live data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Total bytes written into the file
    pub size: u64,
    /// Greatest block height of any tree stored in the file
    pub greatest_height: i32,
}

/// Outcome of storing a tree that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// The tree was appended and indexed
    Stored,
    /// A tree for this block was already present; nothing was written
    AlreadyPresent,
}

/// Snapshot of the disk store's bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of trees tracked by the position map
    pub tree_count: usize,
    /// Number of live data files
    pub file_count: usize,
    /// Total bytes across all data files
    pub disk_usage: u64,
    /// Position the next appended tree will start at
    pub next_position: DiskPosition,
}

/// Merkle archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleStoreConfig {
    /// Directory holding the data files and the index database
    pub store_path: PathBuf,
    /// Soft cap on a data file's size; a write past it rolls over to a new file
    pub preferred_file_size: u64,
    /// Hard cap on the total size of all data files
    pub max_disk_space: u64,
    /// Hard cap on the aggregate serialized size of cached trees
    pub max_mem_cache_size: u64,
    /// Worker threads for parallel tree computation (0 = one per core)
    pub compute_pool_threads: usize,
}

impl Default for MerkleStoreConfig {
    fn default() -> Self {
        Self {
            store_path: "data/merkle-archive".into(),
            preferred_file_size: 32 * 1024 * 1024,
            max_disk_space: 1024 * 1024 * 1024,
            max_mem_cache_size: 32 * 1024 * 1024,
            compute_pool_threads: 0,
        }
    }
}

/// Merkle proof for transaction inclusion verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Transaction hash the proof is for
    #[serde(
        serialize_with = "serialize_hash",
        deserialize_with = "deserialize_hash"
    )]
    pub tx_hash: TxHash,
    /// Sibling hashes from leaf to root
    #[serde(
        serialize_with = "serialize_hash_vec",
        deserialize_with = "deserialize_hash_vec"
    )]
    pub path: Vec<TxHash>,
    /// Leaf position in the tree
    pub position: u32,
    /// Root hash of the tree
    #[serde(
        serialize_with = "serialize_hash",
        deserialize_with = "deserialize_hash"
    )]
    pub root: TxHash,
}

/// Serialize 32-byte hash as hex string
fn serialize_hash<S>(hash: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&hex::encode(hash))
}

/// Deserialize 32-byte hash from hex string
fn deserialize_hash<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
    if bytes.len() != 32 {
        return Err(serde::de::Error::custom("Invalid hash length"));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

/// Serialize vector of 32-byte hashes as hex strings
fn serialize_hash_vec<S>(hashes: &[TxHash], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let hex_strings: Vec<String> = hashes.iter().map(hex::encode).collect();
    hex_strings.serialize(serializer)
}

/// Deserialize vector of 32-byte hashes from hex strings
fn deserialize_hash_vec<'de, D>(deserializer: D) -> Result<Vec<TxHash>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hex_strings = Vec::<String>::deserialize(deserializer)?;
    let mut hashes = Vec::with_capacity(hex_strings.len());
    for s in hex_strings {
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("Invalid hash length"));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        hashes.push(hash);
    }
    Ok(hashes)
}
