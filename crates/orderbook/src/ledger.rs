//! Per account, per token balance and nonce accounting.
//!
//! The ledger is the single source of truth for off-chain funds. Every
//! mutation either moves value between the `available` and `locked` buckets
//! of one account, between two accounts, or is externally justified by an
//! on-chain deposit or claim. The sum over all accounts of a token therefore
//! only changes through `credit` and `debit`, which is what reconciliation
//! relies on.

use primitive_types::{H160, U256};
use std::collections::HashMap;

/// Account that holds the collateral backing outstanding complete sets.
/// MINT matches move collateral here, MERGE matches draw from it.
pub const RESERVE: H160 = H160([0; 20]);

/// Funds of one account in one token.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Balance {
    pub available: U256,
    pub locked: U256,
}

impl Balance {
    pub fn total(&self) -> U256 {
        self.available.saturating_add(self.locked)
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("insufficient balance for {owner:?} in token {token}")]
    InsufficientBalance { owner: H160, token: U256 },
    #[error("amount must be greater than zero")]
    ZeroAmount,
    #[error("balance overflow for {owner:?} in token {token}")]
    Overflow { owner: H160, token: U256 },
}

#[derive(Debug, Default)]
pub struct Ledger {
    balances: HashMap<(H160, U256), Balance>,
    nonces: HashMap<H160, U256>,
}

impl Ledger {
    pub fn balance(&self, owner: H160, token: U256) -> Balance {
        self.balances.get(&(owner, token)).copied().unwrap_or_default()
    }

    pub fn nonce(&self, owner: H160) -> U256 {
        self.nonces.get(&owner).copied().unwrap_or_default()
    }

    /// Stores `max(current, nonce)`; nonces never decrease.
    pub fn set_nonce(&mut self, owner: H160, nonce: U256) {
        let current = self.nonces.entry(owner).or_default();
        *current = (*current).max(nonce);
    }

    pub fn credit(&mut self, owner: H160, token: U256, amount: U256) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::ZeroAmount);
        }
        let balance = self.balances.entry((owner, token)).or_default();
        balance.available = balance
            .available
            .checked_add(amount)
            .ok_or(LedgerError::Overflow { owner, token })?;
        Ok(())
    }

    pub fn debit(&mut self, owner: H160, token: U256, amount: U256) -> Result<(), LedgerError> {
        let balance = self.balances.entry((owner, token)).or_default();
        balance.available = balance
            .available
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientBalance { owner, token })?;
        Ok(())
    }

    /// Moves `amount` from `available` to `locked` atomically.
    pub fn lock(&mut self, owner: H160, token: U256, amount: U256) -> Result<(), LedgerError> {
        let balance = self.balances.entry((owner, token)).or_default();
        let available = balance
            .available
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientBalance { owner, token })?;
        balance.available = available;
        balance.locked = balance.locked.saturating_add(amount);
        Ok(())
    }

    pub fn unlock(&mut self, owner: H160, token: U256, amount: U256) -> Result<(), LedgerError> {
        let balance = self.balances.entry((owner, token)).or_default();
        let locked = balance
            .locked
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientBalance { owner, token })?;
        balance.locked = locked;
        balance.available = balance.available.saturating_add(amount);
        Ok(())
    }

    /// Settles a fill leg: removes `amount` from the debitor's locked funds
    /// and credits it to the creditor's available funds.
    pub fn settle_locked(
        &mut self,
        debitor: H160,
        creditor: H160,
        token: U256,
        amount: U256,
    ) -> Result<(), LedgerError> {
        self.burn_locked(debitor, token, amount)?;
        let balance = self.balances.entry((creditor, token)).or_default();
        balance.available = balance.available.saturating_add(amount);
        Ok(())
    }

    /// Removes `amount` from the debitor's locked funds without crediting
    /// anyone. Used when outcome tokens are redeemed into a complete set.
    pub fn burn_locked(&mut self, owner: H160, token: U256, amount: U256) -> Result<(), LedgerError> {
        let balance = self.balances.entry((owner, token)).or_default();
        let locked = balance
            .locked
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientBalance { owner, token })?;
        balance.locked = locked;
        Ok(())
    }

    /// Credits tokens that were minted as part of a complete set. Unlike
    /// `credit` a zero amount is a no-op rather than an error.
    pub fn mint(&mut self, owner: H160, token: U256, amount: U256) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Ok(());
        }
        self.credit(owner, token, amount)
    }

    /// Sum of `available + locked` over all accounts of a token.
    pub fn total_balance(&self, token: U256) -> U256 {
        self.balances
            .iter()
            .filter(|((_, t), _)| *t == token)
            .fold(U256::zero(), |acc, (_, balance)| acc.saturating_add(balance.total()))
    }

    /// All accounts with a non-zero balance of a token.
    pub fn accounts(&self, token: U256) -> Vec<(H160, Balance)> {
        self.balances
            .iter()
            .filter(|((_, t), balance)| *t == token && !balance.total().is_zero())
            .map(|((owner, _), balance)| (*owner, *balance))
            .collect()
    }
}
