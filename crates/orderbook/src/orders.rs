//! The order service: validation pipeline, submission, cancellation and the
//! shared state every other service reads from.
//!
//! [`Orderbook`] is the single writer over ledger, risk counters and books.
//! All of its methods are synchronous and must be called under one lock;
//! anything that needs network I/O (signature checks against contracts,
//! nonce lookups) happens before the lock is taken.

use crate::{
    book::{Books, Depth, Entry, OrderStatus},
    events::{Event, EventBus},
    ledger::{Balance, Ledger, LedgerError},
    matching::{self, SelfMatch, DUST},
    risk::{RiskEngine, RiskError, RiskLimits},
};
use chrono::{DateTime, Utc};
use model::{
    market::OutcomeRegistry,
    order::{Order, OrderUid},
    signature::SigningScheme,
    trade::Trade,
    DomainSeparator, COLLATERAL, ONE,
};
use primitive_types::{H160, H256, U256};
use prometheus::{IntCounterVec, IntGauge};
use shared::signature_validator::{SignatureCheck, SignatureValidating};
use std::{
    collections::HashSet,
    sync::Arc,
    time::Instant,
};

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("malformed order: {0}")]
    BadRequest(&'static str),
    #[error("invalid signature for order {0}")]
    InvalidSignature(OrderUid),
    #[error("order {0} is expired")]
    Expired(OrderUid),
    #[error("stale nonce for order {uid}: got {got}, ledger at {current}")]
    StaleNonce { uid: OrderUid, got: U256, current: U256 },
    #[error("duplicate order {0}")]
    Duplicate(OrderUid),
    #[error("order {0} would self match")]
    SelfMatch(OrderUid),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Risk(#[from] RiskError),
    #[error("the exchange is paused")]
    MarketPaused,
}

impl OrderError {
    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::Expired(_) => "expired",
            Self::StaleNonce { .. } => "stale_nonce",
            Self::Duplicate(_) => "duplicate",
            Self::SelfMatch(_) => "self_match",
            Self::Ledger(LedgerError::InsufficientBalance { .. }) => "insufficient_balance",
            Self::Ledger(_) => "ledger",
            Self::Risk(RiskError::RateLimited(_)) => "rate_limited",
            Self::Risk(RiskError::SizeExceeded(_)) => "size_exceeded",
            Self::Risk(RiskError::ExposureExceeded(_)) => "exposure_exceeded",
            Self::MarketPaused => "paused",
        }
    }
}

/// Checks everything about an order that does not require the exchange
/// state: structure and signature. Contract signatures go out to the chain,
/// so this runs before the exchange lock is taken. When the signing contract
/// cannot be reached the order is rejected; orders are never accepted
/// unverified.
pub struct OrderValidator {
    domain_separator: DomainSeparator,
    signature_validator: Arc<dyn SignatureValidating>,
}

impl OrderValidator {
    pub fn new(
        domain_separator: DomainSeparator,
        signature_validator: Arc<dyn SignatureValidating>,
    ) -> Self {
        Self { domain_separator, signature_validator }
    }

    pub async fn validate(&self, order: &Order) -> Result<OrderUid, OrderError> {
        structural_checks(order)?;
        let uid = order.uid(&self.domain_separator);
        match order.signature_type {
            SigningScheme::Eoa => {
                let recovered = order
                    .signature
                    .recover(&self.domain_separator, &order.struct_hash())
                    .ok_or(OrderError::InvalidSignature(uid))?;
                if recovered != order.signer || order.signer != order.maker {
                    return Err(OrderError::InvalidSignature(uid));
                }
            }
            SigningScheme::Contract | SigningScheme::GnosisSafe => {
                self.signature_validator
                    .validate_signature(SignatureCheck {
                        contract: order.maker,
                        hash: uid.0 .0,
                        signature: order.signature.to_bytes().to_vec(),
                    })
                    .await
                    .map_err(|_| OrderError::InvalidSignature(uid))?;
            }
        }
        Ok(uid)
    }
}

fn structural_checks(order: &Order) -> Result<(), OrderError> {
    if order.maker.is_zero() {
        return Err(OrderError::BadRequest("maker must not be zero"));
    }
    if order.maker_amount.is_zero() || order.taker_amount.is_zero() {
        return Err(OrderError::BadRequest("amounts must be greater than zero"));
    }
    let price = order
        .price()
        .ok_or(OrderError::BadRequest("order has no valid price"))?;
    if price.is_zero() || price > ONE {
        return Err(OrderError::BadRequest("price must be within (0, 1]"));
    }
    if order.size_in_tokens().unwrap_or_default().is_zero() {
        return Err(OrderError::BadRequest("order size rounds to zero"));
    }
    Ok(())
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Order submissions by outcome.
    #[metric(labels("result"))]
    orders: IntCounterVec,
    /// Trades produced by the matching engine, by match type.
    #[metric(labels("kind"))]
    trades: IntCounterVec,
    /// Currently open orders across all books.
    open_orders: IntGauge,
}

/// The authoritative off-chain exchange state. One instance lives behind a
/// mutex; every mutation goes through `&mut self` so invariants hold without
/// further synchronization.
pub struct Orderbook {
    domain_separator: DomainSeparator,
    registry: OutcomeRegistry,
    ledger: Ledger,
    risk: RiskEngine,
    books: Books,
    events: EventBus,
    pending_trades: Vec<Trade>,
    cancelled: HashSet<OrderUid>,
    next_trade_id: u64,
    paused: bool,
    metrics: &'static Metrics,
}

impl Orderbook {
    pub fn new(
        domain_separator: DomainSeparator,
        registry: OutcomeRegistry,
        risk_limits: RiskLimits,
    ) -> Self {
        Self {
            domain_separator,
            registry,
            ledger: Ledger::default(),
            risk: RiskEngine::new(risk_limits),
            books: Books::default(),
            events: EventBus::default(),
            pending_trades: Vec::new(),
            cancelled: HashSet::new(),
            next_trade_id: 0,
            paused: false,
            metrics: Metrics::instance(shared::metrics::get_metric_storage_registry()).unwrap(),
        }
    }

    pub fn domain_separator(&self) -> &DomainSeparator {
        &self.domain_separator
    }

    /// Submits a structurally valid, signature checked order: locks the
    /// maker's funds, reserves risk exposure, matches it against the books
    /// and rests any remainder. On any failure all side effects of this
    /// order are unwound.
    pub fn submit(&mut self, order: Order, now: DateTime<Utc>) -> Result<OrderUid, OrderError> {
        let result = self.submit_inner(order, now);
        let label = match &result {
            Ok(_) => "accepted",
            Err(err) => err.kind(),
        };
        self.metrics.orders.with_label_values(&[label]).inc();
        self.update_open_orders_gauge();
        result
    }

    fn submit_inner(&mut self, order: Order, now: DateTime<Utc>) -> Result<OrderUid, OrderError> {
        if self.paused {
            return Err(OrderError::MarketPaused);
        }
        structural_checks(&order)?;
        let uid = order.uid(&self.domain_separator);
        let now_secs = now.timestamp().max(0) as u64;
        if order.is_expired(now_secs) {
            return Err(OrderError::Expired(uid));
        }
        let current_nonce = self.ledger.nonce(order.maker);
        if order.nonce < current_nonce {
            return Err(OrderError::StaleNonce { uid, got: order.nonce, current: current_nonce });
        }
        if self.books.contains(&uid) || self.cancelled.contains(&uid) {
            return Err(OrderError::Duplicate(uid));
        }
        self.risk.check_order(order.maker, order.maker_amount, Instant::now())?;

        let price = order.price().expect("checked structurally");
        let size = order.size_in_tokens().expect("checked structurally");
        let (lock_token, lock_amount) = order.required_lock().expect("checked structurally");

        // From here on every failure must unwind the steps taken so far.
        self.ledger.lock(order.maker, lock_token, lock_amount)?;
        self.risk
            .reserve_order(uid, order.maker, order.maker_amount, Instant::now());

        let mut entry = Entry {
            uid,
            order,
            remaining: size,
            locked: (lock_token, lock_amount),
            status: OrderStatus::Open,
            timestamp: now,
            sequence: self.books.next_sequence(),
            price,
        };

        let plan = match matching::plan_fills(
            &self.books,
            &self.ledger,
            &self.registry,
            &entry,
            now_secs,
        ) {
            Ok(plan) => plan,
            Err(SelfMatch) => {
                self.release_entry_funds(&entry);
                return Err(OrderError::SelfMatch(uid));
            }
        };

        // The order is accepted once the plan exists; its own fills follow.
        self.events.publish(Event::OrderAccepted {
            uid,
            owner: entry.order.maker,
            market: entry.order.market_id,
        });

        let trades = matching::execute_plan(
            &mut self.books,
            &mut self.ledger,
            &mut self.risk,
            &mut self.events,
            &mut entry,
            plan,
            &mut self.next_trade_id,
            now,
        );
        for trade in &trades {
            let kind = match trade.match_type {
                model::trade::MatchType::Complementary => "complementary",
                model::trade::MatchType::Mint => "mint",
                model::trade::MatchType::Merge => "merge",
            };
            self.metrics.trades.with_label_values(&[kind]).inc();
        }
        let filled = !trades.is_empty();
        self.pending_trades.extend(trades);

        let owner = entry.order.maker;
        let market = entry.order.market_id;
        if entry.remaining < DUST {
            self.release_entry_funds(&entry);
            entry.status = OrderStatus::Filled;
            self.books.insert_closed(entry);
            self.events.publish(Event::OrderFilled { uid, owner, market });
        } else {
            entry.status = if filled { OrderStatus::Partial } else { OrderStatus::Open };
            self.books.insert(entry);
        }
        tracing::debug!(%uid, "order accepted");
        Ok(uid)
    }

    /// Unlocks whatever an entry still has locked and releases its risk
    /// reservation.
    fn release_entry_funds(&mut self, entry: &Entry) {
        if !entry.locked.1.is_zero() {
            if let Err(err) = self.ledger.unlock(entry.order.maker, entry.locked.0, entry.locked.1)
            {
                panic!("ledger invariant violated while releasing order funds: {err}");
            }
        }
        self.risk.release_order(&entry.uid);
    }

    /// Cancels an open order, releasing its funds, and records the hash so
    /// settlement excludes its trades. Cancelling an order that is already
    /// closed (or was never seen) is idempotent.
    pub fn cancel(&mut self, uid: OrderUid) -> Result<(), OrderError> {
        if let Some(entry) = self.books.close(&uid, OrderStatus::Cancelled) {
            self.release_entry_funds(&entry);
            self.cancelled.insert(uid);
            self.metrics.orders.with_label_values(&["cancelled"]).inc();
            self.update_open_orders_gauge();
            self.events.publish(Event::OrderCancelled {
                uid,
                owner: entry.order.maker,
                market: entry.order.market_id,
            });
            tracing::debug!(%uid, "order cancelled");
            return Ok(());
        }
        match self.books.closed_entry(&uid).map(|entry| entry.status) {
            // Fills stand; cancelling afterwards is a no-op.
            Some(OrderStatus::Filled) => (),
            // Unknown or already closed otherwise: remember the hash so any
            // pending trades are excluded from settlement.
            _ => {
                self.cancelled.insert(uid);
            }
        }
        Ok(())
    }

    /// Evicts expired resting orders. Returns how many were evicted.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let now_secs = now.timestamp().max(0) as u64;
        let expired: Vec<_> = self
            .books
            .open_orders()
            .into_iter()
            .filter(|uid| {
                self.books
                    .entry(uid)
                    .is_some_and(|entry| entry.order.is_expired(now_secs))
            })
            .collect();
        for uid in &expired {
            matching::expire_entry(
                &mut self.books,
                &mut self.ledger,
                &mut self.risk,
                &mut self.events,
                uid,
            );
        }
        self.update_open_orders_gauge();
        expired.len()
    }

    /// Raises the maker's ledger nonce to `max(current, nonce)` and evicts
    /// every open order made stale by it. Returns the evicted uids.
    pub fn sync_nonce(&mut self, owner: H160, nonce: U256) -> Vec<OrderUid> {
        self.ledger.set_nonce(owner, nonce);
        let nonce = self.ledger.nonce(owner);
        let stale: Vec<_> = self
            .books
            .open_orders()
            .into_iter()
            .filter(|uid| {
                self.books.entry(uid).is_some_and(|entry| {
                    entry.order.maker == owner && entry.order.nonce < nonce
                })
            })
            .collect();
        for uid in &stale {
            if let Some(entry) = self.books.close(uid, OrderStatus::Cancelled) {
                self.release_entry_funds(&entry);
                self.cancelled.insert(*uid);
                self.events.publish(Event::OrderCancelled {
                    uid: *uid,
                    owner,
                    market: entry.order.market_id,
                });
            }
        }
        if !stale.is_empty() {
            tracing::info!(?owner, %nonce, evicted = stale.len(), "nonce advanced on chain");
            self.update_open_orders_gauge();
        }
        stale
    }

    /// Credits a confirmed on-chain deposit.
    pub fn apply_deposit(&mut self, user: H160, amount: U256) -> Result<(), LedgerError> {
        self.ledger.credit(user, COLLATERAL, amount)
    }

    /// Debits a claimed withdrawal observed on chain.
    pub fn apply_claim(&mut self, user: H160, amount: U256) -> Result<(), LedgerError> {
        self.ledger.debit(user, COLLATERAL, amount)
    }

    /// Records a claim in the risk engine's daily withdrawal window;
    /// returns whether the account exceeded its limit.
    pub fn record_withdrawal(&mut self, user: H160, amount: U256) -> bool {
        self.risk.record_withdrawal(user, amount, Instant::now())
    }

    pub fn drain_pending_trades(&mut self) -> Vec<Trade> {
        std::mem::take(&mut self.pending_trades)
    }

    pub fn pending_trades(&self) -> &[Trade] {
        &self.pending_trades
    }

    pub fn cancelled_snapshot(&self) -> HashSet<OrderUid> {
        self.cancelled.clone()
    }

    pub fn pause(&mut self, reason: &str) {
        if !self.paused {
            tracing::error!(reason, "pausing the exchange");
            self.paused = true;
            self.events.publish(Event::Paused { reason: reason.to_string() });
        }
    }

    /// Resuming is an explicit operator action, never automatic.
    pub fn resume(&mut self) {
        if self.paused {
            tracing::info!("resuming the exchange");
            self.paused = false;
            self.events.publish(Event::Resumed);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn balance(&self, owner: H160, token: U256) -> Balance {
        self.ledger.balance(owner, token)
    }

    pub fn total_balance(&self, token: U256) -> U256 {
        self.ledger.total_balance(token)
    }

    pub fn accounts(&self, token: U256) -> Vec<(H160, Balance)> {
        self.ledger.accounts(token)
    }

    pub fn nonce(&self, owner: H160) -> U256 {
        self.ledger.nonce(owner)
    }

    pub fn order_status(&self, uid: &OrderUid) -> Option<OrderStatus> {
        self.books
            .entry(uid)
            .or_else(|| self.books.closed_entry(uid))
            .map(|entry| entry.status)
    }

    pub fn remaining(&self, uid: &OrderUid) -> Option<U256> {
        self.books
            .entry(uid)
            .or_else(|| self.books.closed_entry(uid))
            .map(|entry| entry.remaining)
    }

    pub fn mid_price(&self, market_id: H256, token_id: U256) -> Option<U256> {
        self.books.mid_price(market_id, token_id)
    }

    pub fn best_price(&self, market_id: H256, token_id: U256, side: model::order::Side) -> Option<U256> {
        self.books.best_price(market_id, token_id, side)
    }

    pub fn depth(&self, market_id: H256, token_id: U256, levels: usize) -> Depth {
        self.books.depth(market_id, token_id, levels)
    }

    pub fn open_owners(&self) -> Vec<H160> {
        self.books.open_owners()
    }

    pub fn events(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The indexer writes deposits, claims and nonces straight to the
    /// ledger; everything else goes through the typed methods above.
    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    pub fn exposure(&self, owner: H160) -> U256 {
        self.risk.exposure(owner)
    }

    fn update_open_orders_gauge(&self) {
        self.metrics.open_orders.set(self.books.open_orders().len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RESERVE;
    use model::{
        market::OutcomePair,
        order::{OrderBuilder, Side},
        trade::MatchType,
    };
    use number_conversions::U256Ext;

    const YES: u64 = 1;
    const NO: u64 = 2;

    fn market() -> H256 {
        H256::repeat_byte(0xaa)
    }

    fn account(byte: u8) -> H160 {
        H160::repeat_byte(byte)
    }

    fn orderbook() -> Orderbook {
        Orderbook::new(
            DomainSeparator::default(),
            OutcomeRegistry::new([OutcomePair {
                market_id: market(),
                yes: YES.into(),
                no: NO.into(),
            }]),
            RiskLimits {
                max_order_size: ONE * 1_000_000,
                max_exposure: ONE * 10_000_000,
                max_orders_per_minute: 1_000,
                max_withdrawal_per_day: ONE * 1_000_000,
            },
        )
    }

    fn price_pct(pct: u64) -> U256 {
        ONE * pct / 100
    }

    /// A buy of `size` tokens at `pct`/100 collateral per token.
    fn buy(maker: H160, token: u64, size: U256, pct: u64, salt: u64) -> Order {
        let cost = price_pct(pct).checked_mul_div_floor(&size, &ONE).unwrap();
        OrderBuilder::default()
            .with_salt(salt.into())
            .with_maker(maker)
            .with_market(market())
            .with_token(token.into())
            .with_side(Side::Buy)
            .with_amounts(cost, size)
            .build()
    }

    /// A sell of `size` tokens at `pct`/100. The quoted amounts follow the
    /// sell convention: `makerAmount` is the collateral value of the
    /// inventory, `takerAmount` prices it.
    fn sell(maker: H160, token: u64, size: U256, pct: u64, salt: u64) -> Order {
        let maker_amount = price_pct(pct).checked_mul_div_floor(&size, &ONE).unwrap();
        let taker_amount = price_pct(pct)
            .checked_mul_div_floor(&maker_amount, &ONE)
            .unwrap();
        OrderBuilder::default()
            .with_salt(salt.into())
            .with_maker(maker)
            .with_market(market())
            .with_token(token.into())
            .with_side(Side::Sell)
            .with_amounts(maker_amount, taker_amount)
            .build()
    }

    fn fund_collateral(orderbook: &mut Orderbook, user: H160, amount: U256) {
        orderbook.ledger_mut().credit(user, COLLATERAL, amount).unwrap();
    }

    fn fund_tokens(orderbook: &mut Orderbook, user: H160, token: u64, amount: U256) {
        orderbook.ledger_mut().credit(user, token.into(), amount).unwrap();
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn basic_match() {
        // A buys 100 tokens at 0.6, B then sells inventory quoted 50/25
        // (price 0.5, size 100). One trade at the maker's price.
        let mut ob = orderbook();
        let a = account(0xa1);
        let b = account(0xb1);
        fund_collateral(&mut ob, a, ONE * 1000);
        fund_tokens(&mut ob, b, YES, ONE * 100);

        ob.submit(buy(a, YES, ONE * 100, 60, 1), now()).unwrap();
        let sell_order = OrderBuilder::default()
            .with_salt(2.into())
            .with_maker(b)
            .with_market(market())
            .with_token(YES.into())
            .with_side(Side::Sell)
            .with_amounts(ONE * 50, ONE * 25)
            .build();
        ob.submit(sell_order, now()).unwrap();

        let trades = ob.drain_pending_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].amount, ONE * 100);
        assert_eq!(trades[0].price, price_pct(60));
        assert_eq!(trades[0].match_type, MatchType::Complementary);
        assert_eq!(trades[0].maker, a);
        assert_eq!(trades[0].taker, b);

        let a_collateral = ob.balance(a, COLLATERAL);
        assert_eq!(a_collateral.available, ONE * 940);
        assert_eq!(a_collateral.locked, U256::zero());
        assert_eq!(ob.balance(a, YES.into()).available, ONE * 100);
        assert_eq!(ob.balance(b, COLLATERAL).available, ONE * 60);
        assert_eq!(ob.balance(b, YES.into()).total(), U256::zero());
    }

    #[test]
    fn price_time_priority_across_prices() {
        // Bids at 0.50, 0.60, 0.55; best bid is 0.60 and an incoming sell
        // at 0.55 hits it, not the equal-priced 0.55 bid.
        let mut ob = orderbook();
        let makers = [account(0x01), account(0x02), account(0x03)];
        for maker in makers {
            fund_collateral(&mut ob, maker, ONE * 1000);
        }
        let taker = account(0x04);
        fund_tokens(&mut ob, taker, YES, ONE * 100);

        ob.submit(buy(makers[0], YES, ONE * 100, 50, 1), now()).unwrap();
        ob.submit(buy(makers[1], YES, ONE * 100, 60, 2), now()).unwrap();
        ob.submit(buy(makers[2], YES, ONE * 100, 55, 3), now()).unwrap();
        assert_eq!(
            ob.best_price(market(), YES.into(), Side::Buy),
            Some(price_pct(60)),
        );

        ob.submit(sell(taker, YES, ONE * 100, 55, 4), now()).unwrap();
        let trades = ob.drain_pending_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].maker, makers[1]);
        assert_eq!(trades[0].price, price_pct(60));
    }

    #[test]
    fn price_time_priority_within_level() {
        let mut ob = orderbook();
        let first = account(0x01);
        let second = account(0x02);
        fund_collateral(&mut ob, first, ONE * 1000);
        fund_collateral(&mut ob, second, ONE * 1000);
        let taker = account(0x03);
        fund_tokens(&mut ob, taker, YES, ONE * 50);

        ob.submit(buy(first, YES, ONE * 100, 60, 1), now()).unwrap();
        ob.submit(buy(second, YES, ONE * 100, 60, 2), now()).unwrap();
        ob.submit(sell(taker, YES, ONE * 50, 50, 3), now()).unwrap();

        let trades = ob.drain_pending_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].maker, first);
    }

    #[test]
    fn cancel_restores_funds_and_exposure() {
        let mut ob = orderbook();
        let a = account(0xa1);
        fund_collateral(&mut ob, a, ONE * 1000);
        let uid = ob.submit(buy(a, YES, ONE * 100, 50, 1), now()).unwrap();
        assert_eq!(ob.balance(a, COLLATERAL).locked, ONE * 50);
        assert!(!ob.exposure(a).is_zero());

        ob.cancel(uid).unwrap();
        let balance = ob.balance(a, COLLATERAL);
        assert_eq!(balance.available, ONE * 1000);
        assert_eq!(balance.locked, U256::zero());
        assert_eq!(ob.exposure(a), U256::zero());
        assert_eq!(ob.order_status(&uid), Some(OrderStatus::Cancelled));
        // Cancelling again is a no-op.
        ob.cancel(uid).unwrap();
    }

    #[test]
    fn insufficient_balance_leaves_state_unchanged() {
        let mut ob = orderbook();
        let a = account(0xa1);
        fund_collateral(&mut ob, a, ONE * 10);
        let result = ob.submit(buy(a, YES, ONE * 100, 20, 1), now());
        assert!(matches!(
            result,
            Err(OrderError::Ledger(LedgerError::InsufficientBalance { .. })),
        ));
        assert_eq!(ob.balance(a, COLLATERAL).available, ONE * 10);
        assert_eq!(ob.balance(a, COLLATERAL).locked, U256::zero());
        assert_eq!(ob.best_price(market(), YES.into(), Side::Buy), None);
        assert_eq!(ob.exposure(a), U256::zero());
    }

    #[test]
    fn partial_fill_rests_remainder() {
        let mut ob = orderbook();
        let a = account(0xa1);
        let b = account(0xb1);
        fund_collateral(&mut ob, a, ONE * 1000);
        fund_tokens(&mut ob, b, YES, ONE * 40);

        let uid = ob.submit(buy(a, YES, ONE * 100, 60, 1), now()).unwrap();
        ob.submit(sell(b, YES, ONE * 40, 50, 2), now()).unwrap();

        let trades = ob.drain_pending_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].amount, ONE * 40);
        assert_eq!(ob.order_status(&uid), Some(OrderStatus::Partial));
        assert_eq!(ob.remaining(&uid), Some(ONE * 60));
        // 40 tokens at 0.6 cost 24; the rest stays locked for the resting
        // remainder.
        assert_eq!(ob.balance(a, COLLATERAL).locked, ONE * 36);
        assert_eq!(ob.balance(a, YES.into()).available, ONE * 40);
    }

    #[test]
    fn taker_surplus_is_unlocked_on_full_fill() {
        // Taker buys at 0.6 but executes at the resting ask of 0.5; the
        // unspent 10 go back to available.
        let mut ob = orderbook();
        let a = account(0xa1);
        let b = account(0xb1);
        fund_tokens(&mut ob, a, YES, ONE * 100);
        fund_collateral(&mut ob, b, ONE * 100);

        ob.submit(sell(a, YES, ONE * 100, 50, 1), now()).unwrap();
        ob.submit(buy(b, YES, ONE * 100, 60, 2), now()).unwrap();

        let trades = ob.drain_pending_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, price_pct(50));
        let balance = ob.balance(b, COLLATERAL);
        assert_eq!(balance.available, ONE * 50);
        assert_eq!(balance.locked, U256::zero());
        assert_eq!(ob.balance(b, YES.into()).available, ONE * 100);
    }

    #[test]
    fn mint_complete_set_from_two_buys() {
        let mut ob = orderbook();
        let a = account(0xa1);
        let b = account(0xb1);
        fund_collateral(&mut ob, a, ONE * 100);
        fund_collateral(&mut ob, b, ONE * 100);

        ob.submit(buy(a, YES, ONE * 100, 60, 1), now()).unwrap();
        ob.submit(buy(b, NO, ONE * 100, 50, 2), now()).unwrap();

        let trades = ob.drain_pending_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].match_type, MatchType::Mint);
        assert_eq!(trades[0].amount, ONE * 100);

        // The maker pays its price (0.6), the taker the complement (0.4).
        assert_eq!(ob.balance(a, COLLATERAL).available, ONE * 40);
        assert_eq!(ob.balance(a, YES.into()).available, ONE * 100);
        let b_balance = ob.balance(b, COLLATERAL);
        assert_eq!(b_balance.available, ONE * 60);
        assert_eq!(b_balance.locked, U256::zero());
        assert_eq!(ob.balance(b, NO.into()).available, ONE * 100);
        // The set's backing sits in the reserve; collateral is conserved.
        assert_eq!(ob.balance(RESERVE, COLLATERAL).available, ONE * 100);
        assert_eq!(ob.total_balance(COLLATERAL), ONE * 200);
    }

    #[test]
    fn merge_complete_set_from_two_sells() {
        let mut ob = orderbook();
        let a = account(0xa1);
        let b = account(0xb1);
        // Seed holdings and the reserve through a mint.
        fund_collateral(&mut ob, a, ONE * 100);
        fund_collateral(&mut ob, b, ONE * 100);
        ob.submit(buy(a, YES, ONE * 100, 60, 1), now()).unwrap();
        ob.submit(buy(b, NO, ONE * 100, 50, 2), now()).unwrap();
        ob.drain_pending_trades();

        ob.submit(sell(a, YES, ONE * 100, 30, 3), now()).unwrap();
        ob.submit(sell(b, NO, ONE * 100, 40, 4), now()).unwrap();

        let trades = ob.drain_pending_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].match_type, MatchType::Merge);
        assert_eq!(trades[0].amount, ONE * 100);

        // Maker (A) receives its ask of 0.3, taker (B) the complement 0.7.
        assert_eq!(ob.balance(a, COLLATERAL).available, ONE * 70);
        assert_eq!(ob.balance(b, COLLATERAL).available, ONE * 130);
        assert_eq!(ob.balance(a, YES.into()).total(), U256::zero());
        assert_eq!(ob.balance(b, NO.into()).total(), U256::zero());
        assert_eq!(ob.balance(RESERVE, COLLATERAL).total(), U256::zero());
        assert_eq!(ob.total_balance(COLLATERAL), ONE * 200);
    }

    #[test]
    fn merge_without_reserve_backing_is_not_matched() {
        let mut ob = orderbook();
        let a = account(0xa1);
        let b = account(0xb1);
        // Token holdings that did not come from a mint, so the reserve is
        // empty and cannot pay out a redeemed set.
        fund_tokens(&mut ob, a, YES, ONE * 100);
        fund_tokens(&mut ob, b, NO, ONE * 100);

        ob.submit(sell(a, YES, ONE * 100, 30, 1), now()).unwrap();
        ob.submit(sell(b, NO, ONE * 100, 40, 2), now()).unwrap();

        assert!(ob.drain_pending_trades().is_empty());
        assert_eq!(
            ob.best_price(market(), YES.into(), Side::Sell),
            Some(price_pct(30)),
        );
        assert_eq!(
            ob.best_price(market(), NO.into(), Side::Sell),
            Some(price_pct(40)),
        );
    }

    #[test]
    fn self_match_is_rejected_without_side_effects() {
        let mut ob = orderbook();
        let a = account(0xa1);
        fund_collateral(&mut ob, a, ONE * 1000);
        fund_tokens(&mut ob, a, YES, ONE * 100);

        ob.submit(buy(a, YES, ONE * 100, 60, 1), now()).unwrap();
        let before = ob.balance(a, YES.into());
        let result = ob.submit(sell(a, YES, ONE * 100, 50, 2), now());
        assert!(matches!(result, Err(OrderError::SelfMatch(_))));
        assert_eq!(ob.balance(a, YES.into()), before);
        // The resting buy is untouched.
        assert_eq!(
            ob.best_price(market(), YES.into(), Side::Buy),
            Some(price_pct(60)),
        );
        assert!(ob.drain_pending_trades().is_empty());
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let mut ob = orderbook();
        let a = account(0xa1);
        fund_collateral(&mut ob, a, ONE * 1000);
        let order = buy(a, YES, ONE * 100, 50, 1);
        ob.submit(order.clone(), now()).unwrap();
        assert!(matches!(
            ob.submit(order, now()),
            Err(OrderError::Duplicate(_)),
        ));
    }

    #[test]
    fn stale_nonce_is_rejected_and_sync_evicts() {
        let mut ob = orderbook();
        let a = account(0xa1);
        fund_collateral(&mut ob, a, ONE * 1000);
        let mut order = buy(a, YES, ONE * 100, 50, 1);
        order.nonce = 1.into();
        let uid = ob.submit(order, now()).unwrap();

        // The on-chain nonce advances past the open order.
        let evicted = ob.sync_nonce(a, 2.into());
        assert_eq!(evicted, vec![uid]);
        assert_eq!(ob.order_status(&uid), Some(OrderStatus::Cancelled));
        assert_eq!(ob.balance(a, COLLATERAL).locked, U256::zero());
        assert_eq!(ob.nonce(a), 2.into());

        let mut stale = buy(a, YES, ONE * 100, 50, 2);
        stale.nonce = 1.into();
        assert!(matches!(
            ob.submit(stale, now()),
            Err(OrderError::StaleNonce { .. }),
        ));
    }

    #[test]
    fn expired_orders_are_rejected_and_swept() {
        let mut ob = orderbook();
        let a = account(0xa1);
        fund_collateral(&mut ob, a, ONE * 1000);

        let mut expired = buy(a, YES, ONE * 100, 50, 1);
        expired.expiration = 1.into();
        assert!(matches!(
            ob.submit(expired, now()),
            Err(OrderError::Expired(_)),
        ));

        let mut expiring = buy(a, YES, ONE * 100, 50, 2);
        expiring.expiration = (now().timestamp() as u64 + 60).into();
        let uid = ob.submit(expiring, now()).unwrap();
        assert_eq!(ob.sweep_expired(now()), 0);
        let later = now() + chrono::Duration::seconds(120);
        assert_eq!(ob.sweep_expired(later), 1);
        assert_eq!(ob.order_status(&uid), Some(OrderStatus::Expired));
        assert_eq!(ob.balance(a, COLLATERAL).locked, U256::zero());
    }

    #[test]
    fn expired_maker_is_evicted_lazily_on_match() {
        let mut ob = orderbook();
        let a = account(0xa1);
        let b = account(0xb1);
        let c = account(0xc1);
        fund_collateral(&mut ob, a, ONE * 1000);
        fund_collateral(&mut ob, b, ONE * 1000);
        fund_tokens(&mut ob, c, YES, ONE * 100);

        let mut expiring = buy(a, YES, ONE * 100, 60, 1);
        expiring.expiration = (now().timestamp() as u64 + 60).into();
        let expired_uid = ob.submit(expiring, now()).unwrap();
        ob.submit(buy(b, YES, ONE * 100, 55, 2), now()).unwrap();

        let later = now() + chrono::Duration::seconds(120);
        ob.submit(sell(c, YES, ONE * 100, 50, 3), later).unwrap();

        let trades = ob.drain_pending_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].maker, b);
        assert_eq!(trades[0].price, price_pct(55));
        assert_eq!(ob.order_status(&expired_uid), Some(OrderStatus::Expired));
        assert_eq!(ob.balance(a, COLLATERAL).locked, U256::zero());
    }

    #[test]
    fn dust_remainder_is_marked_filled() {
        let mut ob = orderbook();
        let a = account(0xa1);
        let b = account(0xb1);
        fund_collateral(&mut ob, a, ONE * 1000);
        fund_tokens(&mut ob, b, YES, ONE * 1000);

        // The resting buy's remainder after the fill is 100 sub-units,
        // below dust, so it closes as filled instead of lingering.
        let size = ONE * 100 + U256::from(100);
        let uid = ob.submit(buy(a, YES, size, 50, 1), now()).unwrap();
        ob.submit(sell(b, YES, ONE * 100, 50, 2), now()).unwrap();

        assert_eq!(ob.order_status(&uid), Some(OrderStatus::Filled));
        assert_eq!(ob.balance(a, COLLATERAL).locked, U256::zero());
    }

    #[test]
    fn paused_exchange_rejects_submissions_but_allows_cancels() {
        let mut ob = orderbook();
        let a = account(0xa1);
        fund_collateral(&mut ob, a, ONE * 1000);
        let uid = ob.submit(buy(a, YES, ONE * 100, 50, 1), now()).unwrap();

        ob.pause("critical discrepancy");
        assert!(ob.is_paused());
        assert!(matches!(
            ob.submit(buy(a, YES, ONE * 100, 50, 2), now()),
            Err(OrderError::MarketPaused),
        ));
        ob.cancel(uid).unwrap();
        assert_eq!(ob.order_status(&uid), Some(OrderStatus::Cancelled));

        ob.resume();
        assert!(!ob.is_paused());
        ob.submit(buy(a, YES, ONE * 100, 50, 3), now()).unwrap();
    }

    #[test]
    fn collateral_is_conserved_across_matching() {
        let mut ob = orderbook();
        let users: Vec<_> = (1..=4u8).map(account).collect();
        for user in &users {
            fund_collateral(&mut ob, *user, ONE * 1000);
        }
        fund_tokens(&mut ob, users[3], YES, ONE * 500);
        let total = ob.total_balance(COLLATERAL);

        ob.submit(buy(users[0], YES, ONE * 100, 60, 1), now()).unwrap();
        ob.submit(buy(users[1], NO, ONE * 80, 50, 2), now()).unwrap();
        ob.submit(sell(users[3], YES, ONE * 150, 55, 3), now()).unwrap();
        ob.submit(buy(users[2], YES, ONE * 70, 62, 4), now()).unwrap();
        ob.submit(buy(users[1], YES, ONE * 30, 45, 5), now()).unwrap();

        assert_eq!(ob.total_balance(COLLATERAL), total);
    }

    #[test]
    fn mid_price_lies_between_best_bid_and_ask() {
        let mut ob = orderbook();
        let a = account(0xa1);
        let b = account(0xb1);
        fund_collateral(&mut ob, a, ONE * 1000);
        fund_tokens(&mut ob, b, YES, ONE * 1000);

        ob.submit(buy(a, YES, ONE * 100, 40, 1), now()).unwrap();
        ob.submit(sell(b, YES, ONE * 100, 60, 2), now()).unwrap();

        let bid = ob.best_price(market(), YES.into(), Side::Buy).unwrap();
        let ask = ob.best_price(market(), YES.into(), Side::Sell).unwrap();
        let mid = ob.mid_price(market(), YES.into()).unwrap();
        assert_eq!(mid, (bid + ask) / 2);
        assert!(bid <= mid && mid <= ask);
    }

    #[test]
    fn private_orders_only_match_their_designated_taker() {
        let mut ob = orderbook();
        let a = account(0xa1);
        let b = account(0xb1);
        let c = account(0xc1);
        fund_collateral(&mut ob, a, ONE * 1000);
        fund_tokens(&mut ob, b, YES, ONE * 100);

        // A's bid is reserved for C, so B's crossing sell rests instead.
        let mut reserved = buy(a, YES, ONE * 100, 60, 1);
        reserved.taker = c;
        ob.submit(reserved, now()).unwrap();
        ob.submit(sell(b, YES, ONE * 100, 50, 2), now()).unwrap();

        assert!(ob.drain_pending_trades().is_empty());
        assert_eq!(
            ob.best_price(market(), YES.into(), Side::Sell),
            Some(price_pct(50)),
        );
    }

    #[test]
    fn structural_validation() {
        let mut ob = orderbook();
        let a = account(0xa1);
        fund_collateral(&mut ob, a, ONE * 1000);

        let zero_maker = OrderBuilder::default()
            .with_market(market())
            .with_token(YES.into())
            .with_amounts(ONE, ONE)
            .build();
        assert!(matches!(
            ob.submit(zero_maker, now()),
            Err(OrderError::BadRequest(_)),
        ));

        // Price above one unit of collateral per token.
        let overpriced = OrderBuilder::default()
            .with_maker(a)
            .with_market(market())
            .with_token(YES.into())
            .with_side(Side::Buy)
            .with_amounts(ONE * 2, ONE)
            .build();
        assert!(matches!(
            ob.submit(overpriced, now()),
            Err(OrderError::BadRequest(_)),
        ));
    }
}
