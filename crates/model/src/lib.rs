//! Domain and wire types shared by the exchange services.

pub mod market;
pub mod order;
pub mod signature;
pub mod trade;
pub mod u256_decimal;

use lazy_static::lazy_static;
use primitive_types::{H160, U256};
use std::fmt;
use web3::signing;

/// One full token in fixed point sub-units. Prices and amounts are integers
/// scaled by this factor; a price of `ONE` means one unit of collateral per
/// outcome token.
pub const ONE: U256 = U256([1_000_000_000_000_000_000, 0, 0, 0]);

/// Token id under which collateral balances are tracked in the ledger.
/// Outcome tokens use their on-chain position ids, which are never zero.
pub const COLLATERAL: U256 = U256([0; 4]);

lazy_static! {
    static ref DOMAIN_TYPE_HASH: [u8; 32] = signing::keccak256(
        b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
    );
    static ref NAME_HASH: [u8; 32] = signing::keccak256(b"CTFExchange");
    static ref VERSION_HASH: [u8; 32] = signing::keccak256(b"1");
}

/// Domain separator used for signing orders.
///
/// https://eips.ethereum.org/EIPS/eip-712#definition-of-domainseparator
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct DomainSeparator(pub [u8; 32]);

impl DomainSeparator {
    pub fn new(chain_id: u64, verifying_contract: H160) -> Self {
        let mut data = [0u8; 160];
        data[0..32].copy_from_slice(&*DOMAIN_TYPE_HASH);
        data[32..64].copy_from_slice(&*NAME_HASH);
        data[64..96].copy_from_slice(&*VERSION_HASH);
        U256::from(chain_id).to_big_endian(&mut data[96..128]);
        data[140..160].copy_from_slice(verifying_contract.as_bytes());
        Self(signing::keccak256(&data))
    }
}

impl fmt::Debug for DomainSeparator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn domain_type_hash_matches_eip712() {
        assert_eq!(
            *DOMAIN_TYPE_HASH,
            hex!("8b73c3c69bb8fe3d512ecc4cf759cc79239f7b179b0ffacaa9a75d522b39400f"),
        );
    }

    #[test]
    fn domain_separator_is_stable() {
        let contract: H160 = hex!("4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E").into();
        let separator = DomainSeparator::new(137, contract);
        assert_eq!(
            separator.0,
            hex!("db7b2cb532363e3b7d92513e72585c641396bd87358b8a26da5e2bf67d4ddd2c"),
        );
        // Any domain field change produces a different separator.
        assert_ne!(separator, DomainSeparator::new(1, contract));
        assert_ne!(separator, DomainSeparator::new(137, H160::zero()));
    }
}
