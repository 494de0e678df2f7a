//! The settlement cycle: drain pending trades, net them into per-address
//! collateral deltas, build the epoch's Merkle tree, commit the root on
//! chain and execute the individual trade legs.

use crate::{
    batch::{Batch, BatchStatus},
    merkle::MerkleProof,
};
use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use model::{order::OrderUid, trade::Trade};
use num::{BigInt, Signed as _, Zero as _};
use number_conversions::{big_int_to_u256, u256_to_big_int};
use orderbook::{events::Event, Orderbook};
use primitive_types::{H160, H256, U256};
use prometheus::IntCounterVec;
use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

/// The on-chain settlement surface. Implemented over the vault and exchange
/// contracts by the keeper; mocked in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait SettlementContract: Send + Sync {
    async fn commit_epoch(
        &self,
        epoch_id: u64,
        merkle_root: H256,
        total_amount: U256,
    ) -> Result<H256>;

    async fn execute_trade(&self, trade: &Trade) -> Result<H256>;
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Settlement batches by final status.
    #[metric(labels("status"))]
    settlement_batches: IntCounterVec,
    /// Individual executed trade legs by result.
    #[metric(labels("result"))]
    settlement_trade_legs: IntCounterVec,
}

pub struct SettlementService<C> {
    orderbook: Arc<Mutex<Orderbook>>,
    contract: C,
    batches: BTreeMap<u64, Batch>,
    next_epoch_id: u64,
    max_attempts: usize,
    retry_backoff: Duration,
    metrics: &'static Metrics,
}

impl<C: SettlementContract> SettlementService<C> {
    pub fn new(
        orderbook: Arc<Mutex<Orderbook>>,
        contract: C,
        max_attempts: usize,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            orderbook,
            contract,
            batches: BTreeMap::new(),
            next_epoch_id: 0,
            max_attempts: max_attempts.max(1),
            retry_backoff,
            metrics: Metrics::instance(shared::metrics::get_metric_storage_registry()).unwrap(),
        }
    }

    /// Runs one full settlement cycle. Returns the settled epoch id, or
    /// `None` when there was nothing to settle.
    pub async fn run(&mut self, now: DateTime<Utc>) -> Result<Option<u64>> {
        let Some(epoch_id) = self.create_batch(now) else {
            return Ok(None);
        };
        self.commit_batch(epoch_id).await?;
        self.execute_settlement(epoch_id).await?;
        Ok(Some(epoch_id))
    }

    /// Drains the engine's pending trades into a new `Building` batch.
    /// Trades of orders that were cancelled in the meantime are dropped.
    pub fn create_batch(&mut self, now: DateTime<Utc>) -> Option<u64> {
        let (trades, cancelled) = {
            let mut orderbook = self.orderbook.lock().unwrap();
            (orderbook.drain_pending_trades(), orderbook.cancelled_snapshot())
        };
        let (trades, entries) = net_trades(trades, &cancelled);
        if trades.is_empty() {
            return None;
        }
        let epoch_id = self.next_epoch_id;
        self.next_epoch_id += 1;
        let batch = Batch::new(epoch_id, trades, entries, now);
        tracing::info!(
            epoch_id,
            trades = batch.trades.len(),
            entries = batch.entries.len(),
            root = ?batch.merkle_root,
            "created settlement batch",
        );
        self.batches.insert(epoch_id, batch);
        Some(epoch_id)
    }

    /// Commits the epoch root on chain with bounded retries. A batch whose
    /// commit ultimately fails is left in `Failed` for the operator.
    pub async fn commit_batch(&mut self, epoch_id: u64) -> Result<()> {
        let (merkle_root, total_amount) = {
            let batch = self.batch_in_status(epoch_id, BatchStatus::Building)?;
            (batch.merkle_root, batch.total_amount)
        };
        let result = with_retries(self.max_attempts, self.retry_backoff, "commit_epoch", || {
            self.contract.commit_epoch(epoch_id, merkle_root, total_amount)
        })
        .await;
        let batch = self.batches.get_mut(&epoch_id).expect("checked above");
        match result {
            Ok(tx_hash) => {
                batch.status = BatchStatus::Committed;
                batch.tx_hashes.push(tx_hash);
                self.metrics
                    .settlement_batches
                    .with_label_values(&["committed"])
                    .inc();
                self.orderbook.lock().unwrap().events().publish(Event::EpochCommitted {
                    epoch_id,
                    merkle_root,
                });
                Ok(())
            }
            Err(err) => {
                batch.status = BatchStatus::Failed;
                self.metrics
                    .settlement_batches
                    .with_label_values(&["failed"])
                    .inc();
                Err(err).with_context(|| format!("committing epoch {epoch_id}"))
            }
        }
    }

    /// Executes the trade legs of a committed epoch in arrival order.
    /// Already executed legs are never rolled back; a persistent failure
    /// marks the batch `Failed` with the partial progress recorded.
    pub async fn execute_settlement(&mut self, epoch_id: u64) -> Result<()> {
        let trades = self.batch_in_status(epoch_id, BatchStatus::Committed)?.trades.clone();
        for (index, trade) in trades.iter().enumerate() {
            let result =
                with_retries(self.max_attempts, self.retry_backoff, "execute_trade", || {
                    self.contract.execute_trade(trade)
                })
                .await;
            let batch = self.batches.get_mut(&epoch_id).expect("checked above");
            match result {
                Ok(tx_hash) => {
                    batch.tx_hashes.push(tx_hash);
                    self.metrics
                        .settlement_trade_legs
                        .with_label_values(&["ok"])
                        .inc();
                }
                Err(err) => {
                    batch.status = BatchStatus::Failed;
                    self.metrics
                        .settlement_trade_legs
                        .with_label_values(&["failed"])
                        .inc();
                    self.metrics
                        .settlement_batches
                        .with_label_values(&["failed"])
                        .inc();
                    return Err(err).with_context(|| {
                        format!(
                            "executing trade {index} of {} in epoch {epoch_id}",
                            trades.len(),
                        )
                    });
                }
            }
        }
        let batch = self.batches.get_mut(&epoch_id).expect("checked above");
        batch.status = BatchStatus::Settled;
        self.metrics
            .settlement_batches
            .with_label_values(&["settled"])
            .inc();
        self.orderbook.lock().unwrap().events().publish(Event::EpochSettled { epoch_id });
        tracing::info!(epoch_id, "settled epoch");
        Ok(())
    }

    fn batch_in_status(&self, epoch_id: u64, status: BatchStatus) -> Result<&Batch> {
        let batch = self
            .batches
            .get(&epoch_id)
            .with_context(|| format!("unknown epoch {epoch_id}"))?;
        anyhow::ensure!(
            batch.status == status,
            "epoch {epoch_id} is {:?}, expected {status:?}",
            batch.status,
        );
        Ok(batch)
    }

    pub fn batch(&self, epoch_id: u64) -> Option<&Batch> {
        self.batches.get(&epoch_id)
    }

    pub fn get_proof(&self, epoch_id: u64, address: H160) -> Option<MerkleProof> {
        self.batches.get(&epoch_id)?.proof(address)
    }

    /// Epochs with an entry for `address` whose claim has not been observed
    /// on chain yet.
    pub fn unclaimed_epochs(&self, address: H160) -> Vec<u64> {
        self.batches
            .values()
            .filter(|batch| batch.is_unclaimed_by(address))
            .map(|batch| batch.epoch_id)
            .collect()
    }

    /// Records a `Claimed` event observed by the indexer.
    pub fn mark_claimed(&mut self, epoch_id: u64, address: H160) {
        if let Some(batch) = self.batches.get_mut(&epoch_id) {
            batch.claimed.insert(address);
        }
    }

    /// Reconciles an `EpochCommitted` event against our own record. A root
    /// mismatch means off-chain and on-chain state diverged.
    pub fn observe_committed(&mut self, epoch_id: u64, merkle_root: H256) {
        match self.batches.get_mut(&epoch_id) {
            Some(batch) if batch.merkle_root == merkle_root => {
                if batch.status == BatchStatus::Building {
                    batch.status = BatchStatus::Committed;
                }
            }
            Some(batch) => {
                tracing::error!(
                    epoch_id,
                    ours = ?batch.merkle_root,
                    onchain = ?merkle_root,
                    "committed epoch root differs from our record",
                );
            }
            None => {
                tracing::warn!(epoch_id, "observed commit for unknown epoch");
            }
        }
    }
}

/// Retries an on-chain call with exponential backoff, returning the last
/// error once the attempts are exhausted.
async fn with_retries<T, F, Fut>(
    attempts: usize,
    backoff: Duration,
    what: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff;
    let mut last_error = None;
    for attempt in 1..=attempts {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!(?err, attempt, what, "on-chain call failed");
                last_error = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last_error.expect("at least one attempt was made"))
}

/// Drops trades of cancelled orders and nets the rest into per-address
/// collateral deltas; the positive side of the netting becomes the epoch's
/// Merkle entries.
fn net_trades(
    trades: Vec<Trade>,
    cancelled: &HashSet<OrderUid>,
) -> (Vec<Trade>, BTreeMap<H160, U256>) {
    let trades: Vec<_> = trades
        .into_iter()
        .filter(|trade| {
            let dropped = cancelled.contains(&trade.taker_order)
                || cancelled.contains(&trade.maker_order);
            if dropped {
                tracing::debug!(id = trade.id, "dropping trade of cancelled order");
            }
            !dropped
        })
        .collect();

    let mut deltas = BTreeMap::<H160, BigInt>::new();
    for trade in &trades {
        let Some(cost) = trade.cost() else {
            tracing::error!(id = trade.id, "trade cost overflows, skipping");
            continue;
        };
        let cost = u256_to_big_int(&cost);
        *deltas.entry(trade.maker).or_default() -= &cost;
        *deltas.entry(trade.taker).or_default() += cost;
    }
    // Every trade debits and credits the same amount, so the deltas must
    // cancel out exactly; anything else would corrupt the vault accounting.
    let sum: BigInt = deltas.values().sum();
    assert!(sum.is_zero(), "trade deltas do not conserve: {sum}");

    let entries = deltas
        .into_iter()
        .filter(|(_, delta)| delta.is_positive())
        .map(|(address, delta)| {
            let amount = big_int_to_u256(&delta).expect("positive delta fits");
            (address, amount)
        })
        .collect();
    (trades, entries)
}
