//! Settled epochs and their lifecycle.

use crate::merkle::{MerkleProof, MerkleTree};
use chrono::{DateTime, Utc};
use model::trade::Trade;
use primitive_types::{H160, H256, U256};
use std::collections::{BTreeMap, HashSet};

/// `Building → Committed → Settled` on the happy path; `Failed` is terminal
/// and left for operator intervention. Epoch ids are monotonic and never
/// reused, including for failed batches.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatchStatus {
    Building,
    Committed,
    Settled,
    Failed,
}

#[derive(Clone, Debug)]
pub struct Batch {
    pub epoch_id: u64,
    pub trades: Vec<Trade>,
    pub merkle_root: H256,
    /// Net positive collateral deltas of the epoch, keyed by address. The
    /// map order doubles as the deterministic entry order.
    pub entries: BTreeMap<H160, U256>,
    pub total_amount: U256,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    /// Hashes of the commit and execution transactions, in submission order.
    pub tx_hashes: Vec<H256>,
    /// Addresses whose claim for this epoch was observed on chain.
    pub claimed: HashSet<H160>,
    tree: MerkleTree,
}

impl Batch {
    pub fn new(
        epoch_id: u64,
        trades: Vec<Trade>,
        entries: BTreeMap<H160, U256>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let tree = MerkleTree::new(entries.iter().map(|(address, amount)| (*address, *amount)));
        let total_amount = entries
            .values()
            .fold(U256::zero(), |acc, amount| acc.saturating_add(*amount));
        Self {
            epoch_id,
            trades,
            merkle_root: tree.root(),
            entries,
            total_amount,
            status: BatchStatus::Building,
            created_at,
            tx_hashes: Vec::new(),
            claimed: HashSet::new(),
            tree,
        }
    }

    /// Inclusion proof for an entry of this epoch.
    pub fn proof(&self, address: H160) -> Option<MerkleProof> {
        let amount = self.entries.get(&address)?;
        self.tree.proof(address, *amount).ok()
    }

    pub fn is_unclaimed_by(&self, address: H160) -> bool {
        matches!(self.status, BatchStatus::Committed | BatchStatus::Settled)
            && self.entries.contains_key(&address)
            && !self.claimed.contains(&address)
    }
}
