//! The entry point an order transport (HTTP, gateway, tests) drives. Runs
//! the asynchronous validation steps outside the exchange lock, then the
//! synchronous submission under it.

use chrono::Utc;
use model::order::{Order, OrderUid};
use orderbook::{
    book::{Depth, OrderStatus},
    events::Event,
    ledger::Balance,
    OrderError, Orderbook, OrderValidator,
};
use primitive_types::{H160, H256, U256};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub struct OrderApi {
    orderbook: Arc<Mutex<Orderbook>>,
    validator: OrderValidator,
}

impl OrderApi {
    pub fn new(orderbook: Arc<Mutex<Orderbook>>, validator: OrderValidator) -> Self {
        Self { orderbook, validator }
    }

    pub async fn submit_order(&self, order: Order) -> Result<OrderUid, OrderError> {
        self.validator.validate(&order).await?;
        self.orderbook.lock().unwrap().submit(order, Utc::now())
    }

    pub fn cancel_order(&self, uid: OrderUid) -> Result<(), OrderError> {
        self.orderbook.lock().unwrap().cancel(uid)
    }

    pub fn order_status(&self, uid: &OrderUid) -> Option<OrderStatus> {
        self.orderbook.lock().unwrap().order_status(uid)
    }

    pub fn balance(&self, owner: H160, token: U256) -> Balance {
        self.orderbook.lock().unwrap().balance(owner, token)
    }

    pub fn depth(&self, market_id: H256, token_id: U256, levels: usize) -> Depth {
        self.orderbook.lock().unwrap().depth(market_id, token_id, levels)
    }

    pub fn mid_price(&self, market_id: H256, token_id: U256) -> Option<U256> {
        self.orderbook.lock().unwrap().mid_price(market_id, token_id)
    }

    pub fn subscribe_market(&self, market_id: H256) -> broadcast::Receiver<Event> {
        self.orderbook.lock().unwrap().events().subscribe_market(market_id)
    }

    pub fn subscribe_user(&self, user: H160) -> broadcast::Receiver<Event> {
        self.orderbook.lock().unwrap().events().subscribe_user(user)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.orderbook.lock().unwrap().events().subscribe_all()
    }
}
