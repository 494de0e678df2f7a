//! Binary markets and the registry of complementary outcome tokens.
//!
//! MINT and MERGE matches require knowing which two token ids form a
//! complete set. That relation is not derivable from the ids themselves, so
//! it is an explicit input populated when a market is listed.

use crate::u256_decimal;
use primitive_types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The YES/NO outcome token pair of a binary market.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomePair {
    pub market_id: H256,
    #[serde(with = "u256_decimal")]
    pub yes: U256,
    #[serde(with = "u256_decimal")]
    pub no: U256,
}

impl OutcomePair {
    pub fn complement(&self, token_id: &U256) -> Option<U256> {
        if *token_id == self.yes {
            Some(self.no)
        } else if *token_id == self.no {
            Some(self.yes)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct OutcomeRegistry {
    pairs: HashMap<H256, OutcomePair>,
}

impl OutcomeRegistry {
    pub fn new(pairs: impl IntoIterator<Item = OutcomePair>) -> Self {
        Self {
            pairs: pairs.into_iter().map(|pair| (pair.market_id, pair)).collect(),
        }
    }

    pub fn insert(&mut self, pair: OutcomePair) {
        self.pairs.insert(pair.market_id, pair);
    }

    pub fn pair(&self, market_id: &H256) -> Option<&OutcomePair> {
        self.pairs.get(market_id)
    }

    /// The complementary token of `token_id` within its market, if known.
    pub fn complement(&self, market_id: &H256, token_id: &U256) -> Option<U256> {
        self.pairs.get(market_id)?.complement(token_id)
    }
}
