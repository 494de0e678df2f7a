//! The matching loop.
//!
//! Matching is split into a read-only planning pass and a mutating apply
//! pass. The plan walks the candidate queues in price-time priority and
//! decides every fill up front; validation failures such as a self match
//! therefore reject an order before any state has changed. The apply pass
//! then moves funds and updates entries without any further decision making,
//! which keeps the critical section free of suspension points.
//!
//! Besides direct fills on the same token, a buy can match a resting buy of
//! the complementary outcome token when the two prices cover a complete set
//! (MINT), and a sell can match a complementary sell when the two asks leave
//! redemption value on the table (MERGE). Minted sets move their collateral
//! into the reserve account; merges redeem against it.

use crate::{
    book::{Books, Entry, OrderStatus},
    events::{Event, EventBus},
    ledger::{Ledger, LedgerError, RESERVE},
    risk::RiskEngine,
};
use chrono::{DateTime, Utc};
use model::{
    market::OutcomeRegistry,
    order::{OrderUid, Side},
    trade::{MatchType, Trade},
    COLLATERAL, ONE,
};
use number_conversions::U256Ext;
use primitive_types::{H160, U256};
use std::collections::HashMap;

/// Entries left with less than this many token sub-units are marked filled
/// instead of resting as worthless stubs.
pub const DUST: U256 = U256([1_000, 0, 0, 0]);

/// The incoming order would trade against another order of the same maker.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[error("order would match against its own maker")]
pub struct SelfMatch;

#[derive(Debug)]
pub(crate) struct PlannedFill {
    maker_uid: OrderUid,
    maker_owner: H160,
    /// The maker's outcome token; equals the taker's for direct fills and
    /// the complement for mint and merge.
    maker_token: U256,
    match_type: MatchType,
    /// Fill size in token sub-units.
    amount: U256,
    /// Price the maker executes at, `ONE` fixed point.
    maker_price: U256,
    /// Price the taker executes at; `ONE - maker_price` for mint and merge.
    taker_price: U256,
}

#[derive(Debug, Default)]
pub(crate) struct Plan {
    fills: Vec<PlannedFill>,
    /// Resting orders found expired while scanning; evicted before fills
    /// are applied.
    expired: Vec<OrderUid>,
}

/// Walks both candidate books and decides every fill for the incoming
/// `taker` entry. Does not mutate anything.
pub(crate) fn plan_fills(
    books: &Books,
    ledger: &Ledger,
    registry: &OutcomeRegistry,
    taker: &Entry,
    now: u64,
) -> Result<Plan, SelfMatch> {
    let market = taker.order.market_id;
    let token = taker.order.token_id;
    let complement = registry.complement(&market, &token);

    let mut plan = Plan::default();
    let mut consumed = HashMap::<OrderUid, U256>::new();
    let mut remaining = taker.remaining;
    // Collateral the reserve can still pay out for merges in this plan.
    let mut reserve_available = ledger.balance(RESERVE, COLLATERAL).available;

    // Direct candidates: opposite side of the same token. Synthetic
    // candidates: same side of the complementary token.
    let mut direct = books.iter_side(market, token, taker.order.side.opposite());
    let mut synthetic: Box<dyn Iterator<Item = &Entry> + '_> = match complement {
        Some(complement) => books.iter_side(market, complement, taker.order.side),
        None => Box::new(std::iter::empty()),
    };
    let mut direct_head = direct.next();
    let mut synthetic_head = synthetic.next();

    while !remaining.is_zero() {
        advance(&mut direct_head, direct.as_mut(), &mut plan.expired, &consumed, taker, now);
        advance(&mut synthetic_head, synthetic.as_mut(), &mut plan.expired, &consumed, taker, now);

        // Price of the taker if it filled against each candidate, `None`
        // when the candidate does not cross.
        let direct_price = direct_head.and_then(|maker| {
            let crosses = match taker.order.side {
                Side::Buy => maker.price <= taker.price,
                Side::Sell => maker.price >= taker.price,
            };
            crosses.then_some(maker.price)
        });
        let synthetic_price = synthetic_head.and_then(|maker| {
            match taker.order.side {
                // Mint: the two buy prices must cover a complete set.
                Side::Buy => (maker.price.saturating_add(taker.price) >= ONE)
                    .then(|| ONE - maker.price),
                // Merge: the two asks must leave redemption value, and the
                // reserve must be able to pay the set out.
                Side::Sell => (maker.price.saturating_add(taker.price) <= ONE
                    && reserve_available >= remaining.min(maker.remaining))
                    .then(|| ONE - maker.price),
            }
        });

        // Prefer the better execution for the taker; a tie goes to the
        // direct book.
        let use_direct = match (direct_price, synthetic_price) {
            (None, None) => break,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(direct), Some(synthetic)) => match taker.order.side {
                Side::Buy => direct <= synthetic,
                Side::Sell => direct >= synthetic,
            },
        };
        let (maker, match_type, taker_price) = if use_direct {
            (
                direct_head.expect("crossing candidate exists"),
                MatchType::Complementary,
                direct_price.expect("crossing candidate exists"),
            )
        } else {
            let match_type = match taker.order.side {
                Side::Buy => MatchType::Mint,
                Side::Sell => MatchType::Merge,
            };
            (
                synthetic_head.expect("crossing candidate exists"),
                match_type,
                synthetic_price.expect("crossing candidate exists"),
            )
        };

        if maker.order.maker == taker.order.maker {
            return Err(SelfMatch);
        }

        let maker_consumed = consumed.entry(maker.uid).or_default();
        let maker_remaining = maker.remaining - *maker_consumed;
        let amount = remaining.min(maker_remaining);
        if match_type == MatchType::Merge {
            let payout = set_payout(maker.price, taker_price, amount);
            reserve_available = reserve_available.saturating_sub(payout);
        }
        plan.fills.push(PlannedFill {
            maker_uid: maker.uid,
            maker_owner: maker.order.maker,
            maker_token: maker.order.token_id,
            match_type,
            amount,
            maker_price: maker.price,
            taker_price,
        });
        *maker_consumed += amount;
        remaining -= amount;
    }

    Ok(plan)
}

/// Advances a candidate cursor past entries that are expired (collecting
/// them for eviction), restricted to a different counterparty, or already
/// fully consumed by the plan.
fn advance<'a>(
    head: &mut Option<&'a Entry>,
    iter: &mut (dyn Iterator<Item = &'a Entry> + 'a),
    expired: &mut Vec<OrderUid>,
    consumed: &HashMap<OrderUid, U256>,
    taker: &Entry,
    now: u64,
) {
    while let Some(entry) = *head {
        if entry.order.is_expired(now) {
            if !expired.contains(&entry.uid) {
                expired.push(entry.uid);
            }
        } else if counterparties_allowed(&taker.order, &entry.order)
            && consumed.get(&entry.uid).copied().unwrap_or_default() < entry.remaining
        {
            break;
        }
        *head = iter.next();
    }
}

/// Orders with a non-zero `taker` field are only fillable by that account.
fn counterparties_allowed(taker: &model::order::Order, maker: &model::order::Order) -> bool {
    (maker.taker.is_zero() || maker.taker == taker.maker)
        && (taker.taker.is_zero() || taker.taker == maker.maker)
}

/// Total collateral released when `amount` of a complete set is redeemed at
/// the two leg prices.
fn set_payout(maker_price: U256, taker_price: U256, amount: U256) -> U256 {
    let maker_leg = mul_price(maker_price, amount);
    let taker_leg = mul_price(taker_price, amount);
    maker_leg.saturating_add(taker_leg)
}

/// `price * amount / ONE`, rounded down.
fn mul_price(price: U256, amount: U256) -> U256 {
    price
        .checked_mul_div_floor(&amount, &ONE)
        .expect("price arithmetic cannot overflow 256 bits")
}

/// Applies a plan: evicts expired makers, moves funds for every fill and
/// updates both sides' entries. Returns the produced trades in fill order.
pub(crate) fn execute_plan(
    books: &mut Books,
    ledger: &mut Ledger,
    risk: &mut RiskEngine,
    events: &mut EventBus,
    taker: &mut Entry,
    plan: Plan,
    next_trade_id: &mut u64,
    now: DateTime<Utc>,
) -> Vec<Trade> {
    for uid in plan.expired {
        expire_entry(books, ledger, risk, events, &uid);
    }

    let mut trades = Vec::with_capacity(plan.fills.len());
    for fill in plan.fills {
        apply_fill(books, ledger, risk, events, taker, &fill);

        let cost = mul_price(fill.maker_price, fill.amount);
        let fee = cost
            .checked_mul_div_floor(&taker.order.fee_rate_bps, &U256::from(10_000))
            .unwrap_or_default();
        let trade = Trade {
            id: *next_trade_id,
            taker_order: taker.uid,
            maker_order: fill.maker_uid,
            maker: fill.maker_owner,
            taker: taker.order.maker,
            market_id: taker.order.market_id,
            token_id: taker.order.token_id,
            amount: fill.amount,
            price: fill.maker_price,
            match_type: fill.match_type,
            timestamp: now,
            fee,
            fee_rate_bps: taker.order.fee_rate_bps,
        };
        *next_trade_id += 1;
        events.publish(Event::TradeExecuted(trade.clone()));
        trades.push(trade);
    }
    trades
}

fn apply_fill(
    books: &mut Books,
    ledger: &mut Ledger,
    risk: &mut RiskEngine,
    events: &mut EventBus,
    taker: &mut Entry,
    fill: &PlannedFill,
) {
    let amount = fill.amount;
    let taker_owner = taker.order.maker;
    let token = taker.order.token_id;

    match fill.match_type {
        MatchType::Complementary => {
            let cost = mul_price(fill.maker_price, amount);
            let (buyer, seller) = match taker.order.side {
                Side::Buy => (taker_owner, fill.maker_owner),
                Side::Sell => (fill.maker_owner, taker_owner),
            };
            settle(ledger.settle_locked(buyer, seller, COLLATERAL, cost));
            settle(ledger.settle_locked(seller, buyer, token, amount));
            let (taker_spent, maker_spent) = match taker.order.side {
                Side::Buy => (cost, amount),
                Side::Sell => (amount, cost),
            };
            consume_locked(taker, taker_spent);
            update_maker(books, ledger, risk, events, &fill.maker_uid, amount, maker_spent);
        }
        MatchType::Mint => {
            // Both buys; collateral moves into the reserve, a complete set
            // is minted out to the two buyers.
            let taker_pays = mul_price(fill.taker_price, amount);
            let maker_pays = mul_price(fill.maker_price, amount);
            settle(ledger.settle_locked(taker_owner, RESERVE, COLLATERAL, taker_pays));
            settle(ledger.settle_locked(fill.maker_owner, RESERVE, COLLATERAL, maker_pays));
            settle(ledger.mint(taker_owner, token, amount));
            settle(ledger.mint(fill.maker_owner, fill.maker_token, amount));
            consume_locked(taker, taker_pays);
            update_maker(books, ledger, risk, events, &fill.maker_uid, amount, maker_pays);
        }
        MatchType::Merge => {
            // Both sells; the set is burned and redeemed from the reserve.
            let taker_receives = mul_price(fill.taker_price, amount);
            let maker_receives = mul_price(fill.maker_price, amount);
            settle(ledger.burn_locked(taker_owner, token, amount));
            settle(ledger.burn_locked(fill.maker_owner, fill.maker_token, amount));
            settle(ledger.debit(RESERVE, COLLATERAL, taker_receives.saturating_add(maker_receives)));
            settle(ledger.mint(taker_owner, COLLATERAL, taker_receives));
            settle(ledger.mint(fill.maker_owner, COLLATERAL, maker_receives));
            consume_locked(taker, amount);
            update_maker(books, ledger, risk, events, &fill.maker_uid, amount, amount);
        }
    }
    taker.remaining -= amount;
}

/// Reduces the taker entry's locked accounting by what a fill consumed.
fn consume_locked(taker: &mut Entry, spent: U256) {
    taker.locked.1 = taker
        .locked
        .1
        .checked_sub(spent)
        .expect("fill consumed more than the order had locked");
}

/// Updates a maker entry after a fill: reduces remaining and locked funds,
/// and closes the entry when it is (dust) filled.
fn update_maker(
    books: &mut Books,
    ledger: &mut Ledger,
    risk: &mut RiskEngine,
    events: &mut EventBus,
    uid: &OrderUid,
    amount: U256,
    spent: U256,
) {
    let entry = books.entry_mut(uid).expect("planned maker is in the book");
    entry.remaining = entry
        .remaining
        .checked_sub(amount)
        .expect("fill larger than maker remaining");
    entry.locked.1 = entry
        .locked
        .1
        .checked_sub(spent)
        .expect("fill consumed more than the order had locked");
    entry.status = OrderStatus::Partial;

    if entry.remaining < DUST {
        let entry = books.close(uid, OrderStatus::Filled).expect("entry exists");
        if !entry.locked.1.is_zero() {
            // Residual locked funds below the fill resolution go back to
            // the maker rather than being conjured into the fill.
            settle(ledger.unlock(entry.order.maker, entry.locked.0, entry.locked.1));
        }
        risk.release_order(uid);
        events.publish(Event::OrderFilled {
            uid: *uid,
            owner: entry.order.maker,
            market: entry.order.market_id,
        });
    }
}

/// Evicts an expired resting order, releasing its locked funds and risk
/// reservation.
pub(crate) fn expire_entry(
    books: &mut Books,
    ledger: &mut Ledger,
    risk: &mut RiskEngine,
    events: &mut EventBus,
    uid: &OrderUid,
) {
    let Some(entry) = books.close(uid, OrderStatus::Expired) else {
        return;
    };
    if !entry.locked.1.is_zero() {
        settle(ledger.unlock(entry.order.maker, entry.locked.0, entry.locked.1));
    }
    risk.release_order(uid);
    tracing::debug!(%uid, "evicted expired order");
    events.publish(Event::OrderExpired {
        uid: *uid,
        owner: entry.order.maker,
        market: entry.order.market_id,
    });
}

/// Funds for every planned leg were locked when the orders were accepted; a
/// failure here means books and ledger disagree and continuing would corrupt
/// balances, so the process halts.
fn settle(result: Result<(), LedgerError>) {
    if let Err(err) = result {
        panic!("ledger invariant violated during settlement: {err}");
    }
}
