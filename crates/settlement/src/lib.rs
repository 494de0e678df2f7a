//! Epoch settlement: batches pending trades into Merkle rooted epochs,
//! commits them on chain and executes the individual trade legs.

pub mod batch;
pub mod merkle;
pub mod service;

pub use batch::{Batch, BatchStatus};
pub use merkle::{MerkleProof, MerkleTree};
pub use service::{SettlementContract, SettlementService};
