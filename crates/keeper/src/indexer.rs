//! Keeps the off-chain state consistent with the chain: deposits, claims,
//! on-chain cancellations, epoch commits and nonces, with confirmation
//! tracking and reorg recovery.
//!
//! Events are fetched before any lock is taken and applied in one
//! synchronous pass. Every side effect is keyed by `(txHash, logIndex)` so
//! replays across overlapping ranges and reorgs are harmless.

use crate::{
    contracts::ChainEvent,
    monitor::{Monitor, Severity},
};
use anyhow::Result;
use orderbook::{events::Event, Orderbook};
use primitive_types::{H160, H256, U256};
use settlement::{SettlementContract, SettlementService};
use shared::current_block::BlockInfo;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

/// How many processed block observations are kept for finding a reorg's
/// common ancestor.
const BLOCK_HISTORY: usize = 128;
/// Bound on the replay protection set.
const SEEN_EVENTS: usize = 16_384;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ChainData: Send + Sync {
    async fn head_block(&self) -> Result<u64>;
    async fn block_hash(&self, number: u64) -> Result<Option<H256>>;
    /// Decoded vault and exchange events in `[from, to]`, ordered by
    /// `(block, log index)`.
    async fn events(&self, from: u64, to: u64) -> Result<Vec<ChainEvent>>;
    async fn nonce(&self, owner: H160) -> Result<U256>;
}

/// A deposit seen within the confirmation horizon, not credited yet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingDeposit {
    pub tx_hash: H256,
    pub log_index: u64,
    pub user: H160,
    pub amount: U256,
    pub block_number: u64,
    pub confirmations: u64,
}

/// Append-only with a sliding capacity; inserting an already seen key
/// returns false.
#[derive(Debug, Default)]
struct SeenEvents {
    set: HashSet<(H256, u64)>,
    order: VecDeque<(H256, u64)>,
}

impl SeenEvents {
    fn insert(&mut self, key: (H256, u64)) -> bool {
        if !self.set.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > SEEN_EVENTS {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    fn contains(&self, key: &(H256, u64)) -> bool {
        self.set.contains(key)
    }
}

pub struct Indexer<C, S> {
    chain: C,
    orderbook: Arc<Mutex<Orderbook>>,
    settlement: Arc<tokio::sync::Mutex<SettlementService<S>>>,
    monitor: Monitor,
    confirmations: u64,
    last_processed: Option<BlockInfo>,
    /// Recently processed blocks, oldest first; the walk-back set for
    /// reorg recovery.
    recent_blocks: VecDeque<BlockInfo>,
    pending_deposits: HashMap<(H256, u64), PendingDeposit>,
    seen: SeenEvents,
}

impl<C, S> Indexer<C, S>
where
    C: ChainData,
    S: SettlementContract,
{
    pub fn new(
        chain: C,
        orderbook: Arc<Mutex<Orderbook>>,
        settlement: Arc<tokio::sync::Mutex<SettlementService<S>>>,
        monitor: Monitor,
        confirmations: u64,
    ) -> Self {
        Self {
            chain,
            orderbook,
            settlement,
            monitor,
            confirmations,
            last_processed: None,
            recent_blocks: VecDeque::new(),
            pending_deposits: HashMap::new(),
            seen: SeenEvents::default(),
        }
    }

    /// One full indexing cycle.
    pub async fn run_once(&mut self) -> Result<()> {
        let head = self.chain.head_block().await?;
        self.check_reorg().await?;
        let safe = head.saturating_sub(self.confirmations);

        let from = match self.last_processed {
            Some(last) => last.number + 1,
            // First run: skip history, start at the confirmation horizon.
            None => safe + 1,
        };
        if from <= safe {
            let events = self.chain.events(from, safe).await?;
            self.apply_events(&events).await;
        }
        if let Some(hash) = self.chain.block_hash(safe).await? {
            self.record_processed(BlockInfo { number: safe, hash });
        }

        self.track_pending_deposits(safe, head).await?;
        self.sync_nonces().await?;

        self.monitor.metrics.last_processed_block.set(safe as i64);
        self.monitor
            .metrics
            .pending_deposits
            .set(self.pending_deposits.len() as i64);
        Ok(())
    }

    pub fn last_processed(&self) -> Option<BlockInfo> {
        self.last_processed
    }

    pub fn pending_deposits(&self) -> Vec<PendingDeposit> {
        self.pending_deposits.values().cloned().collect()
    }

    /// Verifies that the last processed block is still canonical and walks
    /// back to the newest recorded ancestor that is when it is not.
    /// Deposits pending above the ancestor are evicted; credits past the
    /// confirmation horizon are never reverted.
    async fn check_reorg(&mut self) -> Result<()> {
        let Some(last) = self.last_processed else {
            return Ok(());
        };
        if self.chain.block_hash(last.number).await? == Some(last.hash) {
            return Ok(());
        }

        let mut ancestor = None;
        for block in self.recent_blocks.iter().rev() {
            if self.chain.block_hash(block.number).await? == Some(block.hash) {
                ancestor = Some(*block);
                break;
            }
        }
        let depth = last.number - ancestor.map(|block| block.number).unwrap_or(0);
        tracing::warn!(?ancestor, depth, "chain reorganization detected");
        self.monitor.metrics.reorgs.inc();
        self.monitor.alert(
            Severity::Warning,
            "indexer",
            format!("reorg of depth {depth} detected"),
        );

        let cutoff = ancestor.map(|block| block.number);
        self.pending_deposits
            .retain(|_, deposit| cutoff.is_some_and(|ancestor| deposit.block_number <= ancestor));
        self.last_processed = ancestor;
        if let Some(ancestor) = ancestor {
            while self
                .recent_blocks
                .back()
                .is_some_and(|block| block.number > ancestor.number)
            {
                self.recent_blocks.pop_back();
            }
        } else {
            self.recent_blocks.clear();
        }
        self.orderbook.lock().unwrap().events().publish(Event::Reorg {
            common_ancestor: cutoff.unwrap_or(0),
        });
        Ok(())
    }

    fn record_processed(&mut self, block: BlockInfo) {
        if self.recent_blocks.back().map(|last| last.number) == Some(block.number) {
            return;
        }
        self.recent_blocks.push_back(block);
        while self.recent_blocks.len() > BLOCK_HISTORY {
            self.recent_blocks.pop_front();
        }
        self.last_processed = Some(block);
    }

    /// Applies confirmed events. All effects are idempotent by
    /// `(txHash, logIndex)`.
    async fn apply_events(&mut self, events: &[ChainEvent]) {
        for event in events {
            let meta = *event.meta();
            if !self.seen.insert((meta.tx_hash, meta.log_index)) {
                continue;
            }
            match event {
                ChainEvent::Deposit { user, amount, .. } => {
                    self.credit_deposit(*user, *amount, meta.block_number);
                }
                ChainEvent::Claimed { user, epoch_id, amount, .. } => {
                    let over_limit = {
                        let mut orderbook = self.orderbook.lock().unwrap();
                        if let Err(err) = orderbook.apply_claim(*user, *amount) {
                            // The vault paid out more than we account for;
                            // reconciliation will catch the divergence, but
                            // flag it immediately.
                            tracing::error!(?err, ?user, "claim exceeds off-chain balance");
                            self.monitor.alert(
                                Severity::Critical,
                                "indexer",
                                format!("claim of {amount} by {user:?} exceeds off-chain balance"),
                            );
                        }
                        orderbook.record_withdrawal(*user, *amount)
                    };
                    if over_limit {
                        self.monitor.alert(
                            Severity::Warning,
                            "indexer",
                            format!("{user:?} exceeded the daily withdrawal limit"),
                        );
                    }
                    self.settlement.lock().await.mark_claimed(*epoch_id, *user);
                }
                ChainEvent::EpochCommitted { epoch_id, merkle_root, .. } => {
                    self.settlement
                        .lock()
                        .await
                        .observe_committed(*epoch_id, *merkle_root);
                }
                ChainEvent::OrderCancelled { order_hash, .. } => {
                    let uid = model::order::OrderUid(*order_hash);
                    if let Err(err) = self.orderbook.lock().unwrap().cancel(uid) {
                        tracing::warn!(?err, %uid, "failed to apply on-chain cancellation");
                    }
                }
            }
        }
    }

    fn credit_deposit(&mut self, user: H160, amount: U256, block_number: u64) {
        match self.orderbook.lock().unwrap().apply_deposit(user, amount) {
            Ok(()) => {
                tracing::debug!(?user, %amount, block_number, "credited deposit");
            }
            Err(err) => tracing::warn!(?err, ?user, "ignoring unusable deposit"),
        }
    }

    /// Tracks deposits inside the confirmation window `(safe, head]` and
    /// promotes them to ledger credits once they reach the required depth.
    ///
    /// The window is rebuilt from the chain every cycle, so deposits whose
    /// log disappeared in a shallow reorg drop out without special casing.
    async fn track_pending_deposits(&mut self, safe: u64, head: u64) -> Result<()> {
        let mut pending = HashMap::new();
        if safe < head {
            let events = self.chain.events(safe + 1, head).await?;
            for event in events {
                let ChainEvent::Deposit { user, amount, meta } = event else {
                    continue;
                };
                let key = (meta.tx_hash, meta.log_index);
                if self.seen.contains(&key) {
                    continue;
                }
                pending.insert(
                    key,
                    PendingDeposit {
                        tx_hash: meta.tx_hash,
                        log_index: meta.log_index,
                        user,
                        amount,
                        block_number: meta.block_number,
                        confirmations: head.saturating_sub(meta.block_number) + 1,
                    },
                );
            }
        }
        self.pending_deposits = pending;

        let promoted: Vec<_> = self
            .pending_deposits
            .iter()
            .filter(|(_, deposit)| deposit.confirmations >= self.confirmations)
            .map(|(key, _)| *key)
            .collect();
        for key in promoted {
            let deposit = self.pending_deposits.remove(&key).expect("just collected");
            // The safe range scan will see this log again later; the seen
            // set keeps the credit single.
            if self.seen.insert(key) {
                self.credit_deposit(deposit.user, deposit.amount, deposit.block_number);
            }
        }
        Ok(())
    }

    /// Refreshes the ledger nonce of every account with open orders to
    /// `max(offChain, onChain)`, evicting orders made stale by an on-chain
    /// advance.
    async fn sync_nonces(&mut self) -> Result<()> {
        let owners = self.orderbook.lock().unwrap().open_owners();
        let mut nonces = Vec::with_capacity(owners.len());
        for owner in owners {
            nonces.push((owner, self.chain.nonce(owner).await?));
        }
        let mut orderbook = self.orderbook.lock().unwrap();
        for (owner, nonce) in nonces {
            let evicted = orderbook.sync_nonce(owner, nonce);
            if !evicted.is_empty() {
                tracing::info!(?owner, count = evicted.len(), "evicted stale orders");
            }
        }
        Ok(())
    }
}
