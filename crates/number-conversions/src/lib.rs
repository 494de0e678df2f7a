//! Conversions between the 256 bit integers used on the wire and the signed
//! arbitrary precision integers used for netting computations.

use anyhow::{ensure, Result};
use num::{bigint::Sign, BigInt, BigUint};
use primitive_types::{U256, U512};

pub fn u256_to_big_uint(input: &U256) -> BigUint {
    let mut bytes = [0; 32];
    input.to_big_endian(&mut bytes);
    BigUint::from_bytes_be(&bytes)
}

pub fn u256_to_big_int(input: &U256) -> BigInt {
    BigInt::from_biguint(Sign::Plus, u256_to_big_uint(input))
}

pub fn big_uint_to_u256(input: &BigUint) -> Result<U256> {
    let bytes = input.to_bytes_be();
    ensure!(bytes.len() <= 32, "too large");
    Ok(U256::from_big_endian(&bytes))
}

pub fn big_int_to_u256(input: &BigInt) -> Result<U256> {
    ensure!(input.sign() != Sign::Minus, "negative");
    big_uint_to_u256(input.magnitude())
}

/// Checked fixed point arithmetic on `U256`.
///
/// All price and cost computations go through these helpers so that
/// intermediate products cannot overflow and rounding is always towards zero.
pub trait U256Ext: Sized {
    /// `self * mul / div` with the full 512 bit intermediate product,
    /// rounding down. `None` on division by zero or if the result does not
    /// fit into 256 bits.
    fn checked_mul_div_floor(&self, mul: &Self, div: &Self) -> Option<Self>;

    /// `self / other` rounding up.
    fn checked_ceil_div(&self, other: &Self) -> Option<Self>;
}

impl U256Ext for U256 {
    fn checked_mul_div_floor(&self, mul: &Self, div: &Self) -> Option<Self> {
        if div.is_zero() {
            return None;
        }
        let product = self.full_mul(*mul);
        let quotient = product / U512::from(*div);
        quotient.try_into().ok()
    }

    fn checked_ceil_div(&self, other: &Self) -> Option<Self> {
        self.checked_add(other.checked_sub(1.into())?)?
            .checked_div(*other)
    }
}
