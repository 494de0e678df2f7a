//! Deterministic binary Merkle tree over `(address, amount)` entries.
//!
//! Leaves are `keccak256(address || amount)` with the amount big endian in 32
//! bytes, sorted ascending before the tree is built so equal entry sets
//! always produce equal roots. Internal nodes hash their children in sorted
//! order, which makes proofs direction agnostic; odd nodes are paired with
//! themselves.

use primitive_types::{H160, H256, U256};
use web3::signing::keccak256;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MerkleProof {
    pub leaf: H256,
    pub proof: Vec<H256>,
    pub root: H256,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[error("entry is not part of the tree")]
pub struct NotInTree;

#[derive(Clone, Debug, Default)]
pub struct MerkleTree {
    /// Bottom-up layers; `layers[0]` are the sorted leaves, the last layer
    /// is the root.
    layers: Vec<Vec<H256>>,
}

pub fn leaf_hash(address: H160, amount: U256) -> H256 {
    let mut data = [0u8; 52];
    data[..20].copy_from_slice(address.as_bytes());
    amount.to_big_endian(&mut data[20..]);
    H256(keccak256(&data))
}

fn hash_pair(left: H256, right: H256) -> H256 {
    let (low, high) = if left <= right { (left, right) } else { (right, left) };
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(low.as_bytes());
    data[32..].copy_from_slice(high.as_bytes());
    H256(keccak256(&data))
}

impl MerkleTree {
    pub fn new(entries: impl IntoIterator<Item = (H160, U256)>) -> Self {
        let mut leaves: Vec<H256> = entries
            .into_iter()
            .map(|(address, amount)| leaf_hash(address, amount))
            .collect();
        if leaves.is_empty() {
            return Self::default();
        }
        leaves.sort();
        let mut layers = vec![leaves];
        while layers.last().expect("at least one layer").len() > 1 {
            let previous = layers.last().expect("at least one layer");
            let next = previous
                .chunks(2)
                .map(|pair| hash_pair(pair[0], *pair.last().expect("chunks are not empty")))
                .collect();
            layers.push(next);
        }
        Self { layers }
    }

    /// The root, or zero for an empty tree.
    pub fn root(&self) -> H256 {
        self.layers
            .last()
            .and_then(|layer| layer.first())
            .copied()
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The inclusion proof for an entry. Fails if the exact
    /// `(address, amount)` pair is not a leaf.
    pub fn proof(&self, address: H160, amount: U256) -> Result<MerkleProof, NotInTree> {
        let leaf = leaf_hash(address, amount);
        let leaves = self.layers.first().ok_or(NotInTree)?;
        let mut index = leaves.binary_search(&leaf).map_err(|_| NotInTree)?;
        let mut proof = Vec::with_capacity(self.layers.len());
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling = if index % 2 == 0 {
                // Odd nodes at the end duplicate themselves.
                *layer.get(index + 1).unwrap_or(&layer[index])
            } else {
                layer[index - 1]
            };
            proof.push(sibling);
            index /= 2;
        }
        Ok(MerkleProof { leaf, proof, root: self.root() })
    }

    /// Folds the proof into the leaf under the same sorted pair rule and
    /// compares with the root.
    pub fn verify(proof: &[H256], root: H256, leaf: H256) -> bool {
        let computed = proof.iter().fold(leaf, |node, sibling| hash_pair(node, *sibling));
        computed == root
    }
}
