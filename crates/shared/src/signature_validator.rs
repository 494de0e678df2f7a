use crate::transport::Web3;
use lazy_static::lazy_static;
use primitive_types::H160;
use web3::{
    ethabi::{self, Token},
    signing,
    types::{Bytes, CallRequest},
};

/// Everything needed to verify a contract signature over an order digest via
/// EIP-1271.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignatureCheck {
    /// The contract wallet that must approve the signature.
    pub contract: H160,
    /// The EIP-712 message digest that was signed.
    pub hash: [u8; 32],
    pub signature: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureValidationError {
    /// The signing contract rejected the signature.
    #[error("the signature is invalid")]
    Invalid,
    /// The signature could not be checked, for example because the node was
    /// unreachable. Callers treat this the same as `Invalid`: orders are
    /// never accepted unverified.
    #[error(transparent)]
    UnableToVerify(#[from] anyhow::Error),
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait SignatureValidating: Send + Sync {
    async fn validate_signature(
        &self,
        check: SignatureCheck,
    ) -> Result<(), SignatureValidationError>;
}

lazy_static! {
    /// Selector of `isValidSignature(bytes32,bytes)`, which doubles as the
    /// EIP-1271 magic return value.
    static ref IS_VALID_SIGNATURE: [u8; 4] = {
        let hash = signing::keccak256(b"isValidSignature(bytes32,bytes)");
        [hash[0], hash[1], hash[2], hash[3]]
    };
}

pub struct Web3SignatureValidator {
    web3: Web3,
}

impl Web3SignatureValidator {
    pub fn new(web3: Web3) -> Self {
        Self { web3 }
    }
}

#[async_trait::async_trait]
impl SignatureValidating for Web3SignatureValidator {
    async fn validate_signature(
        &self,
        check: SignatureCheck,
    ) -> Result<(), SignatureValidationError> {
        let mut data = IS_VALID_SIGNATURE.to_vec();
        data.extend(ethabi::encode(&[
            Token::FixedBytes(check.hash.to_vec()),
            Token::Bytes(check.signature),
        ]));
        let request = CallRequest {
            to: Some(check.contract),
            data: Some(Bytes(data)),
            ..Default::default()
        };
        let output = self
            .web3
            .eth()
            .call(request, None)
            .await
            .map_err(|err| SignatureValidationError::UnableToVerify(err.into()))?;
        if output.0.starts_with(&*IS_VALID_SIGNATURE) {
            Ok(())
        } else {
            Err(SignatureValidationError::Invalid)
        }
    }
}
