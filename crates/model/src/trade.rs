//! Trades produced by the matching engine, queued for settlement.

use crate::{order::OrderUid, u256_decimal, ONE};
use chrono::{DateTime, Utc};
use number_conversions::U256Ext;
use primitive_types::{H160, H256, U256};
use serde::{Deserialize, Serialize};

/// How the two orders of a trade relate to each other.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Deserialize, Serialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    /// Opposite sides of the same outcome token at crossing prices.
    Complementary,
    /// Two buys of complementary outcome tokens; a complete set is minted
    /// against the combined collateral.
    Mint,
    /// Two sells of complementary outcome tokens; a complete set is redeemed
    /// for collateral.
    Merge,
}

#[derive(Eq, PartialEq, Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: u64,
    pub taker_order: OrderUid,
    pub maker_order: OrderUid,
    pub maker: H160,
    pub taker: H160,
    pub market_id: H256,
    /// The taker's outcome token.
    #[serde(with = "u256_decimal")]
    pub token_id: U256,
    /// Filled amount in outcome token sub-units.
    #[serde(with = "u256_decimal")]
    pub amount: U256,
    /// Execution price, the resting order's price, in `ONE` fixed point.
    #[serde(with = "u256_decimal")]
    pub price: U256,
    pub match_type: MatchType,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "u256_decimal")]
    pub fee: U256,
    #[serde(with = "u256_decimal")]
    pub fee_rate_bps: U256,
}

impl Trade {
    /// Collateral value of the fill: `price * amount / ONE`, rounded down.
    pub fn cost(&self) -> Option<U256> {
        self.price.checked_mul_div_floor(&self.amount, &ONE)
    }
}
