//! Drives the full off-chain pipeline against fake chain infrastructure:
//! deposits are indexed with confirmation tracking, signed orders flow
//! through validation into the matching engine, the resulting trades are
//! settled into a Merkle rooted epoch, claims flow back through the indexer
//! and reconciliation confirms that the books balance against the vault.

use anyhow::Result;
use chrono::Utc;
use keeper::{
    api::OrderApi,
    contracts::{ChainEvent, EventMeta},
    indexer::{ChainData, Indexer},
    monitor::Monitor,
    reconciliation::{Reconciler, VaultReading},
};
use model::{
    market::{OutcomePair, OutcomeRegistry},
    order::{Order, OrderBuilder, Side},
    signature::SigningScheme,
    trade::{MatchType, Trade},
    DomainSeparator, COLLATERAL, ONE,
};
use orderbook::{risk::RiskLimits, Orderbook, OrderValidator};
use primitive_types::{H160, H256, U256};
use settlement::{BatchStatus, MerkleTree, SettlementContract, SettlementService};
use shared::signature_validator::MockSignatureValidating;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

const CONFIRMATIONS: u64 = 3;

#[derive(Default)]
struct ChainState {
    blocks: Vec<H256>,
    events: Vec<ChainEvent>,
    nonces: HashMap<H160, U256>,
    total_deposits: U256,
    balances: HashMap<H160, U256>,
    next_log_index: u64,
}

/// A programmable chain shared between the indexer view and the vault view.
#[derive(Clone, Default)]
struct FakeChain(Arc<Mutex<ChainState>>);

impl FakeChain {
    fn mine_to(&self, height: u64) {
        let mut state = self.0.lock().unwrap();
        while state.blocks.len() <= height as usize {
            let number = state.blocks.len() as u64;
            state.blocks.push(H256::from_low_u64_be(number + 1));
        }
    }

    fn head(&self) -> u64 {
        self.0.lock().unwrap().blocks.len() as u64 - 1
    }

    fn meta(state: &mut ChainState, block: u64) -> EventMeta {
        state.next_log_index += 1;
        EventMeta {
            block_number: block,
            tx_hash: H256::from_low_u64_be(1_000_000 + state.next_log_index),
            log_index: state.next_log_index,
        }
    }

    fn deposit(&self, block: u64, user: H160, amount: U256) {
        let mut state = self.0.lock().unwrap();
        let meta = Self::meta(&mut state, block);
        state.events.push(ChainEvent::Deposit { user, amount, meta });
        state.total_deposits += amount;
        *state.balances.entry(user).or_default() += amount;
    }

    fn claim(&self, block: u64, user: H160, epoch_id: u64, amount: U256) {
        let mut state = self.0.lock().unwrap();
        let meta = Self::meta(&mut state, block);
        state.events.push(ChainEvent::Claimed { user, epoch_id, amount, meta });
        state.total_deposits -= amount;
        let balance = state.balances.entry(user).or_default();
        *balance -= amount;
    }

    fn epoch_committed(&self, block: u64, epoch_id: u64, merkle_root: H256, total: U256) {
        let mut state = self.0.lock().unwrap();
        let meta = Self::meta(&mut state, block);
        state.events.push(ChainEvent::EpochCommitted {
            epoch_id,
            merkle_root,
            total_amount: total,
            meta,
        });
    }
}

#[async_trait::async_trait]
impl ChainData for FakeChain {
    async fn head_block(&self) -> Result<u64> {
        Ok(self.head())
    }

    async fn block_hash(&self, number: u64) -> Result<Option<H256>> {
        Ok(self.0.lock().unwrap().blocks.get(number as usize).copied())
    }

    async fn events(&self, from: u64, to: u64) -> Result<Vec<ChainEvent>> {
        let mut events: Vec<_> = self
            .0
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|event| (from..=to).contains(&event.meta().block_number))
            .cloned()
            .collect();
        events.sort_by_key(|event| (event.meta().block_number, event.meta().log_index));
        Ok(events)
    }

    async fn nonce(&self, owner: H160) -> Result<U256> {
        Ok(self.0.lock().unwrap().nonces.get(&owner).copied().unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl VaultReading for FakeChain {
    async fn total_deposits(&self) -> Result<U256> {
        Ok(self.0.lock().unwrap().total_deposits)
    }

    async fn balance_of(&self, user: H160) -> Result<U256> {
        Ok(self.0.lock().unwrap().balances.get(&user).copied().unwrap_or_default())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Submitted {
    Commit { epoch_id: u64, merkle_root: H256, total_amount: U256 },
    Trade { id: u64 },
}

/// Records what the settlement service submits on chain.
#[derive(Clone, Default)]
struct FakeSettlement(Arc<Mutex<Vec<Submitted>>>);

#[async_trait::async_trait]
impl SettlementContract for FakeSettlement {
    async fn commit_epoch(
        &self,
        epoch_id: u64,
        merkle_root: H256,
        total_amount: U256,
    ) -> Result<H256> {
        self.0.lock().unwrap().push(Submitted::Commit { epoch_id, merkle_root, total_amount });
        Ok(H256::from_low_u64_be(0xc0))
    }

    async fn execute_trade(&self, trade: &Trade) -> Result<H256> {
        self.0.lock().unwrap().push(Submitted::Trade { id: trade.id });
        Ok(H256::from_low_u64_be(0xe0))
    }
}

fn market_id() -> H256 {
    H256::repeat_byte(0xaa)
}

fn order_api(orderbook: Arc<Mutex<Orderbook>>) -> OrderApi {
    // Contract signatures; the signing contracts approve everything here.
    let mut validator = MockSignatureValidating::new();
    validator.expect_validate_signature().returning(|_| Ok(()));
    OrderApi::new(
        orderbook,
        OrderValidator::new(DomainSeparator::default(), Arc::new(validator)),
    )
}

fn buy_order(maker: H160, token: u64, size: U256, price_pct: u64, salt: u64) -> Order {
    let cost = ONE * price_pct / 100 * size / ONE;
    OrderBuilder::default()
        .with_salt(salt.into())
        .with_maker(maker)
        .with_market(market_id())
        .with_token(token.into())
        .with_side(Side::Buy)
        .with_amounts(cost, size)
        .with_signature_type(SigningScheme::Contract)
        .build()
}

#[tokio::test]
async fn deposits_orders_settlement_claims_and_reconciliation() {
    let chain = FakeChain::default();
    let orderbook = Arc::new(Mutex::new(Orderbook::new(
        DomainSeparator::default(),
        OutcomeRegistry::new([OutcomePair { market_id: market_id(), yes: 1.into(), no: 2.into() }]),
        RiskLimits::default(),
    )));
    let api = order_api(orderbook.clone());
    let submissions = FakeSettlement::default();
    let settlement = Arc::new(tokio::sync::Mutex::new(SettlementService::new(
        orderbook.clone(),
        submissions.clone(),
        3,
        Duration::from_millis(1),
    )));
    let monitor = Monitor::new();
    let mut indexer = Indexer::new(
        chain.clone(),
        orderbook.clone(),
        settlement.clone(),
        monitor.clone(),
        CONFIRMATIONS,
    );
    let mut reconciler = Reconciler::new(
        chain.clone(),
        orderbook.clone(),
        monitor.clone(),
        100,
        1000,
    );

    let alice = H160::repeat_byte(0x0a);
    let bob = H160::repeat_byte(0x0b);

    // Both traders deposit collateral; the deposits confirm once they are
    // `CONFIRMATIONS` deep.
    chain.mine_to(10);
    indexer.run_once().await.unwrap();
    chain.deposit(11, alice, ONE * 1000);
    chain.deposit(11, bob, ONE * 1000);
    chain.mine_to(20);
    indexer.run_once().await.unwrap();
    assert_eq!(api.balance(alice, COLLATERAL).available, ONE * 1000);
    assert_eq!(api.balance(bob, COLLATERAL).available, ONE * 1000);

    // Alice bids for YES at 0.60, Bob for NO at 0.50. The two buys cover a
    // complete set, so the engine mints one: 100 YES to Alice for 60, 100
    // NO to Bob for 40 (the complement of Alice's price).
    let mut events = api.subscribe_market(market_id());
    api.submit_order(buy_order(alice, 1, ONE * 100, 60, 1)).await.unwrap();
    api.submit_order(buy_order(bob, 2, ONE * 100, 50, 2)).await.unwrap();
    assert!(std::iter::from_fn(|| events.try_recv().ok()).any(|event| {
        matches!(
            event,
            orderbook::events::Event::TradeExecuted(Trade { match_type: MatchType::Mint, .. })
        )
    }));
    assert_eq!(api.balance(alice, 1.into()).available, ONE * 100);
    assert_eq!(api.balance(bob, 2.into()).available, ONE * 100);

    // The settlement cycle drains the trade into epoch 0 and submits it.
    let epoch_id = settlement.lock().await.run(Utc::now()).await.unwrap().unwrap();
    assert_eq!(epoch_id, 0);
    let (merkle_root, total_amount, proof) = {
        let settlement = settlement.lock().await;
        let batch = settlement.batch(epoch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::Settled);
        // Netting the mint trade at the maker price: Alice -60, Bob +60.
        assert_eq!(batch.entries[&bob], ONE * 60);
        (batch.merkle_root, batch.total_amount, batch.proof(bob).unwrap())
    };
    assert!(MerkleTree::verify(&proof.proof, merkle_root, proof.leaf));
    assert_eq!(
        submissions.0.lock().unwrap().first(),
        Some(&Submitted::Commit { epoch_id, merkle_root, total_amount }),
    );

    // The chain confirms the commit and Bob claims his entry; the indexer
    // reflects both.
    chain.epoch_committed(21, epoch_id, merkle_root, total_amount);
    chain.claim(22, bob, epoch_id, ONE * 60);
    chain.mine_to(30);
    indexer.run_once().await.unwrap();
    assert!(settlement.lock().await.unclaimed_epochs(bob).is_empty());

    // After the full round trip the books still balance against the vault.
    let result = reconciler.run_once(Utc::now()).await.unwrap();
    assert!(result.healthy, "discrepancy: {result:?}");
    assert!(!orderbook.lock().unwrap().is_paused());
}

#[tokio::test]
async fn invalid_contract_signature_rejects_the_order() {
    let orderbook = Arc::new(Mutex::new(Orderbook::new(
        DomainSeparator::default(),
        OutcomeRegistry::default(),
        RiskLimits::default(),
    )));
    orderbook
        .lock()
        .unwrap()
        .ledger_mut()
        .credit(H160::repeat_byte(0x0a), COLLATERAL, ONE * 1000)
        .unwrap();

    // Fail closed: an unreachable signing contract rejects the order.
    let mut validator = MockSignatureValidating::new();
    validator.expect_validate_signature().returning(|_| {
        Err(shared::signature_validator::SignatureValidationError::UnableToVerify(
            anyhow::anyhow!("node unreachable"),
        ))
    });
    let api = OrderApi::new(
        orderbook,
        OrderValidator::new(DomainSeparator::default(), Arc::new(validator)),
    );

    let result = api
        .submit_order(buy_order(H160::repeat_byte(0x0a), 1, ONE * 100, 50, 1))
        .await;
    assert!(matches!(result, Err(orderbook::OrderError::InvalidSignature(_))));
}
