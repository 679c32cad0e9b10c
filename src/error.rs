//! Merkle archive error types

use thiserror::Error;

/// Merkle archive result type
pub type Result<T> = std::result::Result<T, MerkleArchiveError>;

/// Merkle archive errors
#[derive(Error, Debug)]
pub enum MerkleArchiveError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Index database error: {0}")]
    IndexDbError(String),

    #[error("Insufficient disk space for {0} additional bytes")]
    NoSpace(u64),

    #[error("Corrupt tree record: {0}")]
    CorruptRecord(String),

    #[error("Compute pool error: {0}")]
    ComputePool(String),
}

impl From<parity_db::Error> for MerkleArchiveError {
    fn from(err: parity_db::Error) -> Self {
        MerkleArchiveError::IndexDbError(err.to_string())
    }
}
