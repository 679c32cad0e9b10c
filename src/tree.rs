//! Per-block Merkle trees
//!
//! A tree is built bottom-up over the ordered transaction hashes of a block.
//! Parent nodes hash the concatenation of their children with Blake3; a level
//! with an odd node count duplicates its last node. The serialized form is
//! self-delimiting (leaf count followed by the raw leaves), so a reader
//! positioned at a record inside a data file can recover the record length
//! from the bytes themselves. Interior levels are recomputed on decode.

use crate::error::{MerkleArchiveError, Result};
use crate::types::{MerkleProof, TxHash};
use std::io::Read;

/// Merkle tree computed from a block's transaction hashes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    /// Tree nodes by level, leaves first
    levels: Vec<Vec<TxHash>>,
    /// Number of leaves
    leaf_count: usize,
}

impl MerkleTree {
    /// Build a Merkle tree from ordered transaction hashes
    pub fn build(tx_hashes: &[TxHash]) -> Self {
        if tx_hashes.is_empty() {
            return Self {
                levels: vec![vec![]],
                leaf_count: 0,
            };
        }

        let mut levels = vec![tx_hashes.to_vec()];
        let mut current_level = tx_hashes.to_vec();

        while current_level.len() > 1 {
            let mut next_level = Vec::with_capacity(current_level.len().div_ceil(2));

            for i in (0..current_level.len()).step_by(2) {
                let left = current_level[i];
                let right = if i + 1 < current_level.len() {
                    current_level[i + 1]
                } else {
                    left // Duplicate if odd number
                };

                next_level.push(hash_pair(&left, &right));
            }

            levels.push(next_level.clone());
            current_level = next_level;
        }

        Self {
            levels,
            leaf_count: tx_hashes.len(),
        }
    }

    /// Root hash of the tree (zero for an empty tree)
    pub fn root(&self) -> TxHash {
        match self.levels.last() {
            Some(top) if !top.is_empty() => top[0],
            _ => [0u8; 32],
        }
    }

    /// Number of levels, leaves included
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Number of leaves
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Leaf hashes in block order
    pub fn leaves(&self) -> &[TxHash] {
        &self.levels[0]
    }

    /// Generate an inclusion proof for the leaf at `index`
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count {
            return None;
        }

        let tx_hash = self.levels[0][index];
        let mut path = Vec::with_capacity(self.levels.len());
        let mut current_index = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = if current_index & 1 == 0 {
                current_index + 1
            } else {
                current_index - 1
            };

            // The last odd node is its own sibling
            let sibling = if sibling_index < level.len() {
                level[sibling_index]
            } else {
                level[current_index]
            };
            path.push(sibling);

            current_index >>= 1;
        }

        Some(MerkleProof {
            tx_hash,
            path,
            position: index as u32,
            root: self.root(),
        })
    }

    /// Verify an inclusion proof against this tree's root
    pub fn verify_proof(&self, proof: &MerkleProof) -> bool {
        proof.root == self.root() && verify_proof(proof)
    }

    /// Exact length of the serialized form in bytes
    pub fn serialized_size(&self) -> u64 {
        4 + 32 * self.leaf_count as u64
    }

    /// Append the self-delimiting serialized form to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.reserve(self.serialized_size() as usize);
        out.extend_from_slice(&(self.leaf_count as u32).to_le_bytes());
        for leaf in &self.levels[0] {
            out.extend_from_slice(leaf);
        }
    }

    /// Serialized form as a fresh buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Decode a tree from a reader positioned at a record start
    ///
    /// Consumes exactly the bytes produced by [`MerkleTree::encode`] and
    /// rebuilds the interior levels.
    pub fn decode(reader: &mut impl Read) -> Result<Self> {
        let mut count_bytes = [0u8; 4];
        reader.read_exact(&mut count_bytes)?;
        let leaf_count = u32::from_le_bytes(count_bytes) as usize;

        let mut leaves = Vec::new();
        for _ in 0..leaf_count {
            let mut leaf = [0u8; 32];
            reader.read_exact(&mut leaf)?;
            leaves.push(leaf);
        }

        Ok(Self::build(&leaves))
    }
}

/// Verify a Merkle proof against the root it carries
pub fn verify_proof(proof: &MerkleProof) -> bool {
    let mut current = proof.tx_hash;
    let mut position = proof.position;

    for sibling in &proof.path {
        current = if position & 1 == 0 {
            hash_pair(&current, sibling)
        } else {
            hash_pair(sibling, &current)
        };
        position >>= 1;
    }

    current == proof.root
}

/// Hash two nodes together using Blake3
fn hash_pair(left: &TxHash, right: &TxHash) -> TxHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Sanity-check that `bytes` holds exactly one serialized tree
pub fn decode_record(bytes: &[u8]) -> Result<MerkleTree> {
    let mut cursor = std::io::Cursor::new(bytes);
    let tree = MerkleTree::decode(&mut cursor)?;
    if cursor.position() != bytes.len() as u64 {
        return Err(MerkleArchiveError::CorruptRecord(format!(
            "trailing bytes after tree record ({} of {})",
            cursor.position(),
            bytes.len()
        )));
    }
    Ok(tree)
}
