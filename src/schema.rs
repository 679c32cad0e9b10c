//! Merkle archive on-disk schema
//!
//! # Store directory layout
//!
//! ```text
//! <store_path>/
//!     mrk00000.dat          # data files, suffix 0,1,2,...
//!     index/                # parity-db files for the position index
//! ```
//!
//! # Index keyspace
//!
//! A single btree-indexed column holds three key families, distinguished by a
//! one-byte prefix:
//!
//! ## Tree positions
//! - Key: `'p'` + 32-byte block hash
//! - Value: `u32` file suffix (LE) + `u64` offset (LE), 12 bytes
//! - Purpose: locate the serialized tree for a block
//!
//! ## File infos
//! - Key: `'f'` + `u32` file suffix (BE, so files iterate oldest-first)
//! - Value: `u64` file size (LE) + `i32` greatest block height (LE), 12 bytes
//! - Purpose: per-file pruning bookkeeping
//!
//! ## Next position
//! - Key: `'n'`
//! - Value: `u32` file suffix (LE) + `u64` offset (LE), 12 bytes
//! - Purpose: where the next appended tree will start
//!
//! Total disk usage is not stored; it is recomputed at load as the sum of the
//! file-info sizes.

use crate::types::{BlockId, DiskPosition, FileInfo};

/// Prefix of tree position keys
pub const POSITION_PREFIX: u8 = b'p';
/// Prefix of file info keys
pub const FILE_INFO_PREFIX: u8 = b'f';
/// Key of the next-position record
pub const NEXT_POSITION_KEY: &[u8] = b"n";

/// Length of an encoded position or file info value
pub const VALUE_LEN: usize = 12;

const DATA_FILE_PREFIX: &str = "mrk";
const DATA_FILE_EXT: &str = ".dat";

/// Name of the data file with the given suffix
pub fn data_file_name(file: u32) -> String {
    format!("{DATA_FILE_PREFIX}{file:05}{DATA_FILE_EXT}")
}

/// Parse a data file name back into its suffix
pub fn parse_data_file_name(name: &str) -> Option<u32> {
    let digits = name
        .strip_prefix(DATA_FILE_PREFIX)?
        .strip_suffix(DATA_FILE_EXT)?;
    if digits.len() < 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Build a tree position key
pub fn position_key(block_id: &BlockId) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(POSITION_PREFIX);
    key.extend_from_slice(block_id.as_bytes());
    key
}

/// Parse the block id out of a tree position key
pub fn parse_position_key(key: &[u8]) -> Option<BlockId> {
    if key.len() != 33 || key[0] != POSITION_PREFIX {
        return None;
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(&key[1..]);
    Some(BlockId(id))
}

/// Build a file info key
pub fn file_info_key(file: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(FILE_INFO_PREFIX);
    key.extend_from_slice(&file.to_be_bytes());
    key
}

/// Parse the file suffix out of a file info key
pub fn parse_file_info_key(key: &[u8]) -> Option<u32> {
    if key.len() != 5 || key[0] != FILE_INFO_PREFIX {
        return None;
    }
    let mut suffix = [0u8; 4];
    suffix.copy_from_slice(&key[1..]);
    Some(u32::from_be_bytes(suffix))
}

/// Encode a disk position value
pub fn encode_position(position: &DiskPosition) -> [u8; VALUE_LEN] {
    let mut value = [0u8; VALUE_LEN];
    value[..4].copy_from_slice(&position.file.to_le_bytes());
    value[4..].copy_from_slice(&position.offset.to_le_bytes());
    value
}

/// Decode a disk position value
pub fn decode_position(value: &[u8]) -> Option<DiskPosition> {
    if value.len() != VALUE_LEN {
        return None;
    }
    let mut file = [0u8; 4];
    file.copy_from_slice(&value[..4]);
    let mut offset = [0u8; 8];
    offset.copy_from_slice(&value[4..]);
    Some(DiskPosition {
        file: u32::from_le_bytes(file),
        offset: u64::from_le_bytes(offset),
    })
}

/// Encode a file info value
pub fn encode_file_info(info: &FileInfo) -> [u8; VALUE_LEN] {
    let mut value = [0u8; VALUE_LEN];
    value[..8].copy_from_slice(&info.size.to_le_bytes());
    value[8..].copy_from_slice(&info.greatest_height.to_le_bytes());
    value
}

/// Decode a file info value
pub fn decode_file_info(value: &[u8]) -> Option<FileInfo> {
    if value.len() != VALUE_LEN {
        return None;
    }
    let mut size = [0u8; 8];
    size.copy_from_slice(&value[..8]);
    let mut height = [0u8; 4];
    height.copy_from_slice(&value[8..]);
    Some(FileInfo {
        size: u64::from_le_bytes(size),
        greatest_height: i32::from_le_bytes(height),
    })
}
