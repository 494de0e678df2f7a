//! Periodically compares the off-chain collateral totals with the vault and
//! escalates divergence: a warning above the configured threshold, a pause
//! of the exchange at the critical threshold.

use crate::monitor::{Monitor, Severity};
use anyhow::Result;
use chrono::{DateTime, Utc};
use model::COLLATERAL;
use orderbook::Orderbook;
use primitive_types::{H160, U256};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

const HISTORY_LIMIT: usize = 1000;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait VaultReading: Send + Sync {
    async fn total_deposits(&self) -> Result<U256>;
    async fn balance_of(&self, user: H160) -> Result<U256>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UserDiscrepancy {
    pub user: H160,
    pub off_chain: U256,
    pub on_chain: U256,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconciliationResult {
    pub timestamp: DateTime<Utc>,
    pub on_chain_total: U256,
    pub off_chain_total: U256,
    pub discrepancy: U256,
    /// `|off - on| / max(on, 1)` in parts per million.
    pub discrepancy_ppm: u64,
    pub healthy: bool,
    pub per_user: Vec<UserDiscrepancy>,
}

pub struct Reconciler<V> {
    vault: V,
    orderbook: Arc<Mutex<Orderbook>>,
    monitor: Monitor,
    warn_ppm: u64,
    critical_ppm: u64,
    history: VecDeque<ReconciliationResult>,
}

impl<V: VaultReading> Reconciler<V> {
    pub fn new(
        vault: V,
        orderbook: Arc<Mutex<Orderbook>>,
        monitor: Monitor,
        warn_ppm: u64,
        critical_ppm: u64,
    ) -> Self {
        Self {
            vault,
            orderbook,
            monitor,
            warn_ppm,
            critical_ppm,
            history: VecDeque::new(),
        }
    }

    pub async fn run_once(&mut self, now: DateTime<Utc>) -> Result<ReconciliationResult> {
        let on_chain_total = self.vault.total_deposits().await?;
        let (off_chain_total, accounts) = {
            let orderbook = self.orderbook.lock().unwrap();
            (orderbook.total_balance(COLLATERAL), orderbook.accounts(COLLATERAL))
        };

        let discrepancy = if off_chain_total >= on_chain_total {
            off_chain_total - on_chain_total
        } else {
            on_chain_total - off_chain_total
        };
        let discrepancy_ppm = ppm(discrepancy, on_chain_total);
        let healthy = discrepancy_ppm < self.warn_ppm;
        let critical = discrepancy_ppm >= self.critical_ppm;

        let mut per_user = Vec::new();
        if !healthy {
            for (user, balance) in accounts {
                let on_chain = self.vault.balance_of(user).await?;
                if on_chain != balance.total() {
                    per_user.push(UserDiscrepancy {
                        user,
                        off_chain: balance.total(),
                        on_chain,
                    });
                }
            }
        }

        let result = ReconciliationResult {
            timestamp: now,
            on_chain_total,
            off_chain_total,
            discrepancy,
            discrepancy_ppm,
            healthy,
            per_user,
        };

        self.monitor.metrics.discrepancy_ppm.set(discrepancy_ppm.min(i64::MAX as u64) as i64);
        if critical {
            self.monitor.alert(
                Severity::Critical,
                "reconciliation",
                format!(
                    "critical discrepancy: off-chain {off_chain_total}, on-chain \
                     {on_chain_total} ({discrepancy_ppm} ppm); pausing",
                ),
            );
            let mut orderbook = self.orderbook.lock().unwrap();
            orderbook.pause("reconciliation discrepancy above the critical threshold");
            self.monitor.metrics.paused.set(1);
        } else if !healthy {
            self.monitor.alert(
                Severity::Warning,
                "reconciliation",
                format!(
                    "discrepancy: off-chain {off_chain_total}, on-chain {on_chain_total} \
                     ({discrepancy_ppm} ppm)",
                ),
            );
        }

        self.history.push_back(result.clone());
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
        Ok(result)
    }

    /// Explicit operator action to lift a reconciliation pause.
    pub fn resume(&self) {
        self.orderbook.lock().unwrap().resume();
        self.monitor.metrics.paused.set(0);
    }

    pub fn history(&self) -> impl Iterator<Item = &ReconciliationResult> {
        self.history.iter()
    }
}

fn ppm(discrepancy: U256, reference: U256) -> u64 {
    let reference = reference.max(U256::one());
    let scaled = discrepancy
        .checked_mul(U256::from(1_000_000))
        .unwrap_or(U256::MAX)
        / reference;
    scaled.min(U256::from(u64::MAX)).as_u64()
}
