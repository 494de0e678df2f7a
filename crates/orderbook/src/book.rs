//! Price-time priority books.
//!
//! Each `(market, token)` pair has two price-indexed sides. A side is a
//! sorted map from price to a FIFO queue of order uids so that the best
//! price is a peek, inserts are logarithmic and time priority within a level
//! is the queue order. Entries live in a separate store keyed by uid, which
//! also gives cancellation by hash.

use chrono::{DateTime, Utc};
use model::order::{Order, OrderUid, Side};
use primitive_types::{H256, U256};
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OrderStatus {
    Open,
    Partial,
    Filled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Expired)
    }
}

/// A resting order together with its execution state.
#[derive(Clone, Debug)]
pub struct Entry {
    pub uid: OrderUid,
    pub order: Order,
    /// Unfilled size in outcome token sub-units.
    pub remaining: U256,
    /// Funds still locked in the ledger for this order as
    /// `(token id, amount)`. Decreases with every settled fill; whatever is
    /// left when the order closes is unlocked back to the maker.
    pub locked: (U256, U256),
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
    /// Monotonic insertion sequence; authoritative order for entries with
    /// equal timestamps.
    pub sequence: u64,
    /// Limit price in `ONE` fixed point.
    pub price: U256,
}

impl Entry {
    fn book_key(&self) -> (H256, U256) {
        (self.order.market_id, self.order.token_id)
    }
}

#[derive(Debug, Default)]
struct BookSide {
    levels: BTreeMap<U256, VecDeque<OrderUid>>,
}

impl BookSide {
    fn insert(&mut self, price: U256, uid: OrderUid) {
        self.levels.entry(price).or_default().push_back(uid);
    }

    fn remove(&mut self, price: U256, uid: &OrderUid) {
        if let Some(queue) = self.levels.get_mut(&price) {
            queue.retain(|candidate| candidate != uid);
            if queue.is_empty() {
                self.levels.remove(&price);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

#[derive(Debug, Default)]
struct Book {
    bids: BookSide,
    asks: BookSide,
}

impl Book {
    fn side_mut(&mut self, side: Side) -> &mut BookSide {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Best entry of a side: front of the highest bid level or of the lowest
    /// ask level.
    fn best(&self, side: Side) -> Option<OrderUid> {
        match side {
            Side::Buy => self.bids.levels.iter().next_back(),
            Side::Sell => self.asks.levels.iter().next(),
        }
        .and_then(|(_, queue)| queue.front().copied())
    }
}

/// Aggregated open interest of the top levels of a book, for display.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Depth {
    /// `(price, total token amount)` per level, best first.
    pub bids: Vec<(U256, U256)>,
    pub asks: Vec<(U256, U256)>,
}

#[derive(Debug, Default)]
pub struct Books {
    books: HashMap<(H256, U256), Book>,
    entries: HashMap<OrderUid, Entry>,
    /// Closed entries are kept for duplicate detection and status queries.
    closed: HashMap<OrderUid, Entry>,
    next_sequence: u64,
}

impl Books {
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub fn insert(&mut self, entry: Entry) {
        debug_assert!(!entry.status.is_closed());
        let key = entry.book_key();
        self.books
            .entry(key)
            .or_default()
            .side_mut(entry.order.side)
            .insert(entry.price, entry.uid);
        self.entries.insert(entry.uid, entry);
    }

    /// Records an order that never rested, for example because it was
    /// completely filled on arrival.
    pub fn insert_closed(&mut self, entry: Entry) {
        debug_assert!(entry.status.is_closed());
        self.closed.insert(entry.uid, entry);
    }

    pub fn entry(&self, uid: &OrderUid) -> Option<&Entry> {
        self.entries.get(uid)
    }

    pub fn entry_mut(&mut self, uid: &OrderUid) -> Option<&mut Entry> {
        self.entries.get_mut(uid)
    }

    pub fn closed_entry(&self, uid: &OrderUid) -> Option<&Entry> {
        self.closed.get(uid)
    }

    pub fn contains(&self, uid: &OrderUid) -> bool {
        self.entries.contains_key(uid) || self.closed.contains_key(uid)
    }

    /// Removes an open entry from its book, marks it with `status` and moves
    /// it to the closed store. Returns the final entry.
    pub fn close(&mut self, uid: &OrderUid, status: OrderStatus) -> Option<Entry> {
        let mut entry = self.entries.remove(uid)?;
        let key = entry.book_key();
        if let Some(book) = self.books.get_mut(&key) {
            book.side_mut(entry.order.side).remove(entry.price, uid);
            if book.bids.is_empty() && book.asks.is_empty() {
                self.books.remove(&key);
            }
        }
        entry.status = status;
        let result = entry.clone();
        self.closed.insert(*uid, entry);
        Some(result)
    }

    pub fn best(&self, market_id: H256, token_id: U256, side: Side) -> Option<&Entry> {
        let uid = self.books.get(&(market_id, token_id))?.best(side)?;
        self.entries.get(&uid)
    }

    pub fn best_price(&self, market_id: H256, token_id: U256, side: Side) -> Option<U256> {
        self.best(market_id, token_id, side).map(|entry| entry.price)
    }

    /// Midpoint between best bid and best ask; requires both to exist.
    pub fn mid_price(&self, market_id: H256, token_id: U256) -> Option<U256> {
        let bid = self.best_price(market_id, token_id, Side::Buy)?;
        let ask = self.best_price(market_id, token_id, Side::Sell)?;
        Some((bid + ask) / 2)
    }

    pub fn depth(&self, market_id: H256, token_id: U256, levels: usize) -> Depth {
        let Some(book) = self.books.get(&(market_id, token_id)) else {
            return Depth::default();
        };
        let aggregate = |queue: &VecDeque<OrderUid>| {
            queue
                .iter()
                .filter_map(|uid| self.entries.get(uid))
                .fold(U256::zero(), |acc, entry| acc.saturating_add(entry.remaining))
        };
        Depth {
            bids: book
                .bids
                .levels
                .iter()
                .rev()
                .take(levels)
                .map(|(price, queue)| (*price, aggregate(queue)))
                .collect(),
            asks: book
                .asks
                .levels
                .iter()
                .take(levels)
                .map(|(price, queue)| (*price, aggregate(queue)))
                .collect(),
        }
    }

    /// Open entries of one side in match priority order: best price first,
    /// oldest first within a level.
    pub fn iter_side(
        &self,
        market_id: H256,
        token_id: U256,
        side: Side,
    ) -> Box<dyn Iterator<Item = &Entry> + '_> {
        let Some(book) = self.books.get(&(market_id, token_id)) else {
            return Box::new(std::iter::empty());
        };
        let levels: Box<dyn Iterator<Item = &VecDeque<OrderUid>> + '_> = match side {
            Side::Buy => Box::new(book.bids.levels.values().rev()),
            Side::Sell => Box::new(book.asks.levels.values()),
        };
        Box::new(
            levels
                .flatten()
                .filter_map(move |uid| self.entries.get(uid)),
        )
    }

    /// Uids of all open entries, in insertion order.
    pub fn open_orders(&self) -> Vec<OrderUid> {
        let mut uids: Vec<_> = self.entries.values().map(|entry| (entry.sequence, entry.uid)).collect();
        uids.sort_unstable();
        uids.into_iter().map(|(_, uid)| uid).collect()
    }

    /// Owners with at least one open order.
    pub fn open_owners(&self) -> Vec<primitive_types::H160> {
        let mut owners: Vec<_> = self.entries.values().map(|entry| entry.order.maker).collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }
}
