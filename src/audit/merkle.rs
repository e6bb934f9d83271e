//! Merkle Tree for Checkpoints
//!
//! Builds a binary hash tree over the ordered event hashes of a checkpoint
//! and produces inclusion proofs for single events.
//!
//! Leaves are hashed as `SHA-256(0x00 || leaf)` and internal nodes as
//! `SHA-256(0x01 || left || right)`, so a leaf can never be passed off as an
//! internal node. A level with an odd number of nodes duplicates its last one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::crypto::hashes_equal;
use crate::error::LedgerError;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

type Node = [u8; 32];

fn hash_leaf(leaf: &Node) -> Node {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf);
    hasher.finalize().into()
}

fn hash_node(left: &Node, right: &Node) -> Node {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn decode_hash(value: &str) -> Result<Node, LedgerError> {
    let bytes = hex::decode(value)
        .map_err(|e| LedgerError::Merkle(format!("Invalid hash hex '{}': {}", value, e)))?;
    bytes
        .try_into()
        .map_err(|_| LedgerError::Merkle(format!("Hash '{}' is not 32 bytes", value)))
}

/// Which side of the path node the sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiblingPosition {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: String,
    pub position: SiblingPosition,
}

/// Inclusion proof for one leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    pub leaf_index: u64,
    /// The event hash, before leaf hashing.
    pub leaf_hash: String,
    pub siblings: Vec<ProofStep>,
}

impl MerkleProof {
    /// Root implied by this proof.
    pub fn compute_root(&self) -> Result<String, LedgerError> {
        let mut current = hash_leaf(&decode_hash(&self.leaf_hash)?);
        for step in &self.siblings {
            let sibling = decode_hash(&step.hash)?;
            current = match step.position {
                SiblingPosition::Left => hash_node(&sibling, &current),
                SiblingPosition::Right => hash_node(&current, &sibling),
            };
        }
        Ok(hex::encode(current))
    }

    pub fn size(&self) -> usize {
        self.siblings.len()
    }
}

/// Recompute the path and compare it to `expected_root` in constant time.
pub fn verify_proof(proof: &MerkleProof, expected_root: &str) -> bool {
    match proof.compute_root() {
        Ok(root) => hashes_equal(&root, expected_root),
        Err(e) => {
            debug!("Rejecting malformed Merkle proof: {}", e);
            false
        }
    }
}

/// A fully materialized Merkle tree.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    leaves: Vec<String>,
    /// `levels[0]` holds leaf nodes, the last level holds the root.
    levels: Vec<Vec<Node>>,
}

impl MerkleTree {
    /// Build a tree over hex-encoded leaf hashes in the given order.
    pub fn build(ordered_leaf_hashes: &[String]) -> Result<Self, LedgerError> {
        if ordered_leaf_hashes.is_empty() {
            return Err(LedgerError::Merkle(
                "Cannot build Merkle tree from empty leaves".to_string(),
            ));
        }

        let mut level = Vec::with_capacity(ordered_leaf_hashes.len());
        for leaf in ordered_leaf_hashes {
            level.push(hash_leaf(&decode_hash(leaf)?));
        }

        let mut levels = vec![level];
        while levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let next: Vec<Node> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_node(left, right),
                    [last] => hash_node(last, last),
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            levels.push(next);
        }

        let tree = Self {
            leaves: ordered_leaf_hashes.to_vec(),
            levels,
        };
        debug!(
            "Built Merkle tree over {} leaves, root: {}",
            tree.leaf_count(),
            tree.root()
        );
        Ok(tree)
    }

    pub fn root(&self) -> String {
        hex::encode(self.levels[self.levels.len() - 1][0])
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn generate_proof(&self, leaf_index: usize) -> Result<MerkleProof, LedgerError> {
        if leaf_index >= self.leaf_count() {
            return Err(LedgerError::Merkle(format!(
                "Leaf index {} out of range for {} leaves",
                leaf_index,
                self.leaf_count()
            )));
        }

        let mut siblings = Vec::with_capacity(self.depth());
        let mut index = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let step = if index % 2 == 0 {
                // the last node of an odd level is paired with itself
                let sibling = level.get(index + 1).unwrap_or(&level[index]);
                ProofStep {
                    hash: hex::encode(sibling),
                    position: SiblingPosition::Right,
                }
            } else {
                ProofStep {
                    hash: hex::encode(level[index - 1]),
                    position: SiblingPosition::Left,
                }
            };
            siblings.push(step);
            index /= 2;
        }

        Ok(MerkleProof {
            leaf_index: leaf_index as u64,
            leaf_hash: self.leaves[leaf_index].clone(),
            siblings,
        })
    }

    pub fn proofs(&self) -> Result<Vec<MerkleProof>, LedgerError> {
        (0..self.leaf_count()).map(|i| self.generate_proof(i)).collect()
    }
}

/// Merkle root over `leaf_hashes`.
pub fn merkle_root(leaf_hashes: &[String]) -> Result<String, LedgerError> {
    Ok(MerkleTree::build(leaf_hashes)?.root())
}

/// Whether `leaf_hashes` reproduce `claimed_root`.
pub fn verify_merkle_root(leaf_hashes: &[String], claimed_root: &str) -> Result<bool, LedgerError> {
    Ok(hashes_equal(&merkle_root(leaf_hashes)?, claimed_root))
}
