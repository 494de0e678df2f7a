//! Fan-out of exchange events to subscribers, keyed by market and by user.
//!
//! Subscribers get their own broadcast receiver; slow consumers lag and drop
//! messages instead of backpressuring the engine, which is acceptable for
//! the UI streams these feed.

use model::{order::OrderUid, trade::Trade};
use primitive_types::{H160, H256};
use std::collections::HashMap;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub enum Event {
    OrderAccepted { uid: OrderUid, owner: H160, market: H256 },
    OrderFilled { uid: OrderUid, owner: H160, market: H256 },
    OrderCancelled { uid: OrderUid, owner: H160, market: H256 },
    OrderExpired { uid: OrderUid, owner: H160, market: H256 },
    TradeExecuted(Trade),
    EpochCommitted { epoch_id: u64, merkle_root: H256 },
    EpochSettled { epoch_id: u64 },
    Reorg { common_ancestor: u64 },
    Paused { reason: String },
    Resumed,
}

impl Event {
    fn market(&self) -> Option<H256> {
        match self {
            Self::OrderAccepted { market, .. }
            | Self::OrderFilled { market, .. }
            | Self::OrderCancelled { market, .. }
            | Self::OrderExpired { market, .. } => Some(*market),
            Self::TradeExecuted(trade) => Some(trade.market_id),
            _ => None,
        }
    }

    fn users(&self) -> Vec<H160> {
        match self {
            Self::OrderAccepted { owner, .. }
            | Self::OrderFilled { owner, .. }
            | Self::OrderCancelled { owner, .. }
            | Self::OrderExpired { owner, .. } => vec![*owner],
            Self::TradeExecuted(trade) => vec![trade.maker, trade.taker],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct EventBus {
    all: broadcast::Sender<Event>,
    markets: HashMap<H256, broadcast::Sender<Event>>,
    users: HashMap<H160, broadcast::Sender<Event>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            markets: HashMap::new(),
            users: HashMap::new(),
        }
    }
}

impl EventBus {
    /// Publishes to the global channel and to the market and user channels
    /// the event belongs to. Send errors mean nobody is listening and are
    /// ignored.
    pub fn publish(&self, event: Event) {
        if let Some(market) = event.market() {
            if let Some(sender) = self.markets.get(&market) {
                let _ = sender.send(event.clone());
            }
        }
        for user in event.users() {
            if let Some(sender) = self.users.get(&user) {
                let _ = sender.send(event.clone());
            }
        }
        let _ = self.all.send(event);
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    pub fn subscribe_market(&mut self, market: H256) -> broadcast::Receiver<Event> {
        self.markets
            .entry(market)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_user(&mut self, user: H160) -> broadcast::Receiver<Event> {
        self.users
            .entry(user)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_market_and_user() {
        let mut bus = EventBus::default();
        let market = H256::repeat_byte(0x01);
        let owner = H160::repeat_byte(0x02);
        let mut all = bus.subscribe_all();
        let mut by_market = bus.subscribe_market(market);
        let mut by_user = bus.subscribe_user(owner);
        let mut other_market = bus.subscribe_market(H256::repeat_byte(0x03));

        bus.publish(Event::OrderAccepted { uid: Default::default(), owner, market });

        assert!(matches!(all.try_recv().unwrap(), Event::OrderAccepted { .. }));
        assert!(matches!(by_market.try_recv().unwrap(), Event::OrderAccepted { .. }));
        assert!(matches!(by_user.try_recv().unwrap(), Event::OrderAccepted { .. }));
        assert!(other_market.try_recv().is_err());
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(Event::Resumed);
    }
}
