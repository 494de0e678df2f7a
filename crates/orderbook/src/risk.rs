//! Pre-trade risk checks: order size, open exposure, order rate and daily
//! withdrawal volume per account.

use model::{order::OrderUid, ONE};
use primitive_types::{H160, U256};
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

const RATE_WINDOW: Duration = Duration::from_secs(60);
const WITHDRAWAL_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Limits applied to one account. The defaults form the standard tier;
/// individual accounts can be overridden to a higher tier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RiskLimits {
    /// Largest single order, in collateral sub-units.
    pub max_order_size: U256,
    /// Largest sum of open order values, in collateral sub-units.
    pub max_exposure: U256,
    pub max_orders_per_minute: usize,
    pub max_withdrawal_per_day: U256,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_order_size: ONE * 10_000,
            max_exposure: ONE * 100_000,
            max_orders_per_minute: 60,
            max_withdrawal_per_day: ONE * 50_000,
        }
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum RiskError {
    #[error("order rate limit exceeded for {0:?}")]
    RateLimited(H160),
    #[error("order size above limit for {0:?}")]
    SizeExceeded(H160),
    #[error("exposure limit exceeded for {0:?}")]
    ExposureExceeded(H160),
}

#[derive(Debug, Default)]
pub struct RiskEngine {
    default_limits: RiskLimits,
    overrides: HashMap<H160, RiskLimits>,
    exposure: HashMap<H160, U256>,
    reservations: HashMap<OrderUid, (H160, U256)>,
    order_times: HashMap<H160, VecDeque<Instant>>,
    withdrawals: HashMap<H160, VecDeque<(Instant, U256)>>,
}

impl RiskEngine {
    pub fn new(default_limits: RiskLimits) -> Self {
        Self { default_limits, ..Default::default() }
    }

    pub fn limits(&self, owner: H160) -> RiskLimits {
        self.overrides.get(&owner).copied().unwrap_or(self.default_limits)
    }

    pub fn set_limits(&mut self, owner: H160, limits: RiskLimits) {
        self.overrides.insert(owner, limits);
    }

    pub fn exposure(&self, owner: H160) -> U256 {
        self.exposure.get(&owner).copied().unwrap_or_default()
    }

    /// Checks an order of `size` collateral sub-units without reserving
    /// anything.
    pub fn check_order(&self, owner: H160, size: U256, now: Instant) -> Result<(), RiskError> {
        let limits = self.limits(owner);
        if size > limits.max_order_size {
            return Err(RiskError::SizeExceeded(owner));
        }
        let recent = self
            .order_times
            .get(&owner)
            .map(|times| times.iter().filter(|at| now.duration_since(**at) < RATE_WINDOW).count())
            .unwrap_or(0);
        if recent >= limits.max_orders_per_minute {
            return Err(RiskError::RateLimited(owner));
        }
        if self.exposure(owner).saturating_add(size) > limits.max_exposure {
            return Err(RiskError::ExposureExceeded(owner));
        }
        Ok(())
    }

    /// Reserves the exposure of an accepted order and records it in the
    /// rolling rate window.
    pub fn reserve_order(&mut self, id: OrderUid, owner: H160, size: U256, now: Instant) {
        self.reservations.insert(id, (owner, size));
        let exposure = self.exposure.entry(owner).or_default();
        *exposure = exposure.saturating_add(size);
        let times = self.order_times.entry(owner).or_default();
        times.push_back(now);
        while times.front().is_some_and(|at| now.duration_since(*at) >= RATE_WINDOW) {
            times.pop_front();
        }
    }

    /// Releases a reservation when the order is cancelled, expired or fully
    /// filled. Idempotent.
    pub fn release_order(&mut self, id: &OrderUid) {
        let Some((owner, size)) = self.reservations.remove(id) else {
            return;
        };
        let exposure = self.exposure.entry(owner).or_default();
        *exposure = exposure.saturating_sub(size);
    }

    /// Records an on-chain claim and reports whether the account is now over
    /// its daily withdrawal limit.
    pub fn record_withdrawal(&mut self, owner: H160, amount: U256, now: Instant) -> bool {
        let window = self.withdrawals.entry(owner).or_default();
        while window
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) >= WITHDRAWAL_WINDOW)
        {
            window.pop_front();
        }
        window.push_back((now, amount));
        let total = window
            .iter()
            .fold(U256::zero(), |acc, (_, amount)| acc.saturating_add(*amount));
        total > self.limits(owner).max_withdrawal_per_day
    }
}
