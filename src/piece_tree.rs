use std::io::Read;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bag::BagId;

const LEAF_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;
const ZERO_NODE: [u8; 32] = [0u8; 32];

/// Merkle authentication path for one piece: sibling hashes from the leaf
/// up to (but not including) the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceProof {
    pub siblings: Vec<[u8; 32]>,
}

/// Binary Merkle tree over the pieces of a bag's content. The leaf layer is
/// padded to the next power of two with zero nodes so every proof of a bag
/// has the same length, `tree_depth(leaf_count)`.
#[derive(Debug, Clone)]
pub struct PieceTree {
    /// `levels[0]` is the padded leaf layer, the last level holds the root.
    levels: Vec<Vec<[u8; 32]>>,
    leaf_count: u32,
}

fn leaf_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_TAG]);
    hasher.update(data);
    hasher.finalize().into()
}

fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([NODE_TAG]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Proof length for a bag of `leaf_count` pieces.
pub fn tree_depth(leaf_count: u32) -> usize {
    if leaf_count <= 1 {
        0
    } else {
        leaf_count.next_power_of_two().trailing_zeros() as usize
    }
}

impl PieceTree {
    /// Hashes the reader's content in `piece_size` chunks and builds the
    /// tree. Deterministic: identical bytes and piece size always produce
    /// the same root.
    pub fn from_reader<R: Read>(mut reader: R, piece_size: u32) -> std::io::Result<Self> {
        let mut leaves = Vec::new();
        let mut buf = vec![0u8; piece_size as usize];
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = reader.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            leaves.push(leaf_hash(&buf[..filled]));
            if filled < buf.len() {
                break;
            }
        }
        if leaves.is_empty() {
            leaves.push(leaf_hash(&[]));
        }
        Ok(Self::from_leaves(leaves))
    }

    fn from_leaves(mut leaves: Vec<[u8; 32]>) -> Self {
        let leaf_count = leaves.len() as u32;
        leaves.resize(leaves.len().next_power_of_two(), ZERO_NODE);

        let mut levels = vec![leaves];
        while levels.last().map(Vec::len) > Some(1) {
            let below = levels.last().unwrap();
            let above = below
                .chunks_exact(2)
                .map(|pair| node_hash(&pair[0], &pair[1]))
                .collect();
            levels.push(above);
        }
        Self { levels, leaf_count }
    }

    pub fn bag_id(&self) -> BagId {
        BagId(self.levels[self.levels.len() - 1][0])
    }

    /// Number of real (unpadded) pieces.
    pub fn leaf_count(&self) -> u32 {
        self.leaf_count
    }

    /// Proof for piece `index`, or `None` if the index is out of range.
    pub fn proof(&self, index: u32) -> Option<PieceProof> {
        if index >= self.leaf_count {
            return None;
        }
        let mut siblings = Vec::with_capacity(self.levels.len() - 1);
        let mut pos = index as usize;
        for level in &self.levels[..self.levels.len() - 1] {
            siblings.push(level[pos ^ 1]);
            pos >>= 1;
        }
        Some(PieceProof { siblings })
    }
}

/// Checks that `data` is piece `index` of the bag identified by `bag_id`.
/// Returns `false` on any mismatch, including an index that does not fit
/// the proof's depth.
pub fn verify_piece(bag_id: &BagId, index: u32, data: &[u8], proof: &PieceProof) -> bool {
    if proof.siblings.len() < 32 && (index as u64) >> proof.siblings.len() != 0 {
        return false;
    }
    let mut acc = leaf_hash(data);
    let mut pos = index;
    for sibling in &proof.siblings {
        acc = if pos & 1 == 0 {
            node_hash(&acc, sibling)
        } else {
            node_hash(sibling, &acc)
        };
        pos >>= 1;
    }
    *bag_id == BagId(acc)
}
