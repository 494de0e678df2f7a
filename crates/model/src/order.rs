//! The signed order format accepted by the exchange together with its
//! EIP-712 identity and the fixed point price derivation used by the books.

use crate::{
    signature::{hashed_eip712_message, Signature, SigningScheme},
    u256_decimal, DomainSeparator, COLLATERAL, ONE,
};
use lazy_static::lazy_static;
use number_conversions::U256Ext;
use primitive_types::{H160, H256, U256};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use web3::signing;

#[derive(Eq, PartialEq, Clone, Copy, Debug, Deserialize, Serialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Buy => 0,
            Self::Sell => 1,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// An order as signed by the maker. Immutable once accepted; its identity is
/// the EIP-712 digest of the struct ([`Order::uid`]).
///
/// Amount semantics: a buy order offers `maker_amount` collateral for
/// `taker_amount` outcome tokens; a sell order quotes the inverse, so the
/// price is always collateral per token in `ONE` fixed point.
#[derive(Eq, PartialEq, Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(with = "u256_decimal")]
    pub salt: U256,
    pub maker: H160,
    pub signer: H160,
    /// Zero for publicly fillable orders.
    pub taker: H160,
    pub market_id: H256,
    #[serde(with = "u256_decimal")]
    pub token_id: U256,
    pub side: Side,
    #[serde(with = "u256_decimal")]
    pub maker_amount: U256,
    #[serde(with = "u256_decimal")]
    pub taker_amount: U256,
    /// Unix seconds; zero means the order never expires.
    #[serde(with = "u256_decimal")]
    pub expiration: U256,
    #[serde(with = "u256_decimal")]
    pub nonce: U256,
    #[serde(with = "u256_decimal")]
    pub fee_rate_bps: U256,
    pub signature_type: SigningScheme,
    pub signature: Signature,
}

impl Default for Order {
    fn default() -> Self {
        Self {
            salt: U256::zero(),
            maker: H160::zero(),
            signer: H160::zero(),
            taker: H160::zero(),
            market_id: H256::zero(),
            token_id: U256::zero(),
            side: Side::Buy,
            maker_amount: U256::zero(),
            taker_amount: U256::zero(),
            expiration: U256::zero(),
            nonce: U256::zero(),
            fee_rate_bps: U256::zero(),
            signature_type: SigningScheme::Eoa,
            signature: Signature::default(),
        }
    }
}

lazy_static! {
    static ref ORDER_TYPE_HASH: [u8; 32] = signing::keccak256(
        b"Order(uint256 salt,address maker,address signer,address taker,bytes32 marketId,\
          uint256 tokenId,uint8 side,uint256 makerAmount,uint256 takerAmount,\
          uint256 expiration,uint256 nonce,uint256 feeRateBps)",
    );
}

impl Order {
    /// The EIP-712 struct hash over all signed fields.
    pub fn struct_hash(&self) -> [u8; 32] {
        let mut data = [0u8; 416];
        data[0..32].copy_from_slice(&*ORDER_TYPE_HASH);
        self.salt.to_big_endian(&mut data[32..64]);
        data[76..96].copy_from_slice(self.maker.as_bytes());
        data[108..128].copy_from_slice(self.signer.as_bytes());
        data[140..160].copy_from_slice(self.taker.as_bytes());
        data[160..192].copy_from_slice(self.market_id.as_bytes());
        self.token_id.to_big_endian(&mut data[192..224]);
        data[255] = self.side.as_u8();
        self.maker_amount.to_big_endian(&mut data[256..288]);
        self.taker_amount.to_big_endian(&mut data[288..320]);
        self.expiration.to_big_endian(&mut data[320..352]);
        self.nonce.to_big_endian(&mut data[352..384]);
        self.fee_rate_bps.to_big_endian(&mut data[384..416]);
        signing::keccak256(&data)
    }

    pub fn uid(&self, domain_separator: &DomainSeparator) -> OrderUid {
        OrderUid(H256(hashed_eip712_message(
            domain_separator,
            &self.struct_hash(),
        )))
    }

    /// Limit price in collateral sub-units per token, `ONE` fixed point.
    /// `None` when either amount is zero.
    pub fn price(&self) -> Option<U256> {
        if self.maker_amount.is_zero() || self.taker_amount.is_zero() {
            return None;
        }
        match self.side {
            Side::Buy => self.maker_amount.checked_mul_div_floor(&ONE, &self.taker_amount),
            Side::Sell => self.taker_amount.checked_mul_div_floor(&ONE, &self.maker_amount),
        }
    }

    /// Size of the order in outcome token sub-units.
    ///
    /// For sells the size is derived from the quoted value and the price so
    /// that both sides of the book share units.
    pub fn size_in_tokens(&self) -> Option<U256> {
        let price = self.price()?;
        match self.side {
            Side::Buy => Some(self.taker_amount),
            Side::Sell => self.maker_amount.checked_mul_div_floor(&ONE, &price),
        }
    }

    /// The funds a maker commits when the order enters the book, as
    /// `(token id, amount)`: collateral for buys, outcome tokens for sells.
    pub fn required_lock(&self) -> Option<(U256, U256)> {
        match self.side {
            Side::Buy => Some((COLLATERAL, self.maker_amount)),
            Side::Sell => Some((self.token_id, self.size_in_tokens()?)),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        !self.expiration.is_zero() && self.expiration <= U256::from(now)
    }
}

/// The unique identity of an order: the EIP-712 digest of the signed struct.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct OrderUid(pub H256);

impl fmt::Display for OrderUid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for OrderUid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for OrderUid {
    type Err = hex::FromHexError;

    /// Parses the 32 byte digest from hex, upper or lower case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(H256(bytes)))
    }
}

/// Incrementally builds orders for tests.
#[derive(Default)]
pub struct OrderBuilder(Order);

impl OrderBuilder {
    pub fn with_salt(mut self, salt: U256) -> Self {
        self.0.salt = salt;
        self
    }

    pub fn with_maker(mut self, maker: H160) -> Self {
        self.0.maker = maker;
        self.0.signer = maker;
        self
    }

    pub fn with_taker(mut self, taker: H160) -> Self {
        self.0.taker = taker;
        self
    }

    pub fn with_market(mut self, market_id: H256) -> Self {
        self.0.market_id = market_id;
        self
    }

    pub fn with_token(mut self, token_id: U256) -> Self {
        self.0.token_id = token_id;
        self
    }

    pub fn with_side(mut self, side: Side) -> Self {
        self.0.side = side;
        self
    }

    pub fn with_amounts(mut self, maker_amount: U256, taker_amount: U256) -> Self {
        self.0.maker_amount = maker_amount;
        self.0.taker_amount = taker_amount;
        self
    }

    pub fn with_expiration(mut self, expiration: U256) -> Self {
        self.0.expiration = expiration;
        self
    }

    pub fn with_nonce(mut self, nonce: U256) -> Self {
        self.0.nonce = nonce;
        self
    }

    pub fn with_fee_rate_bps(mut self, fee_rate_bps: U256) -> Self {
        self.0.fee_rate_bps = fee_rate_bps;
        self
    }

    pub fn with_signature_type(mut self, signature_type: SigningScheme) -> Self {
        self.0.signature_type = signature_type;
        self
    }

    pub fn build(self) -> Order {
        self.0
    }
}
