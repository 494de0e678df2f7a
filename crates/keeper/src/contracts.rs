//! The on-chain vocabulary of the vault and exchange contracts: selectors,
//! event topics, call encoding and log decoding. The contracts themselves
//! are external; everything here goes through plain `eth_call`,
//! `eth_sendTransaction` and `eth_getLogs`.

use anyhow::{anyhow, bail, Context as _, Result};
use lazy_static::lazy_static;
use model::trade::Trade;
use primitive_types::{H160, H256, U256};
use shared::transport::Web3;
use web3::{
    ethabi::{self, ParamType, Token},
    signing,
    types::{BlockNumber, Bytes, CallRequest, FilterBuilder, Log, TransactionRequest},
};

fn selector(signature: &str) -> [u8; 4] {
    let hash = signing::keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn event_topic(signature: &str) -> H256 {
    H256(signing::keccak256(signature.as_bytes()))
}

lazy_static! {
    static ref DEPOSIT_TOPIC: H256 = event_topic("Deposit(address,uint256)");
    static ref CLAIMED_TOPIC: H256 = event_topic("Claimed(address,uint256,uint256)");
    static ref EPOCH_COMMITTED_TOPIC: H256 = event_topic("EpochCommitted(uint256,bytes32,uint256)");
    static ref ORDER_CANCELLED_TOPIC: H256 = event_topic("OrderCancelled(bytes32)");
    static ref TOTAL_DEPOSITS: [u8; 4] = selector("totalDeposits()");
    static ref BALANCE_OF: [u8; 4] = selector("balanceOf(address)");
    static ref NONCES: [u8; 4] = selector("nonces(address)");
    static ref COMMIT_EPOCH: [u8; 4] = selector("commitEpoch(uint256,bytes32,uint256)");
    static ref EXECUTE_TRADE: [u8; 4] =
        selector("executeTrade(bytes32,bytes32,address,address,uint256,uint256,uint256)");
}

/// Position of a log in the chain; the idempotence key for all event side
/// effects.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct EventMeta {
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
}

impl EventMeta {
    fn of(log: &Log) -> Result<Self> {
        Ok(Self {
            block_number: log
                .block_number
                .ok_or_else(|| anyhow!("log without block number"))?
                .as_u64(),
            tx_hash: log
                .transaction_hash
                .ok_or_else(|| anyhow!("log without transaction hash"))?,
            log_index: log
                .log_index
                .ok_or_else(|| anyhow!("log without log index"))?
                .as_u64(),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChainEvent {
    Deposit { user: H160, amount: U256, meta: EventMeta },
    Claimed { user: H160, epoch_id: u64, amount: U256, meta: EventMeta },
    EpochCommitted { epoch_id: u64, merkle_root: H256, total_amount: U256, meta: EventMeta },
    OrderCancelled { order_hash: H256, meta: EventMeta },
}

impl ChainEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::Deposit { meta, .. }
            | Self::Claimed { meta, .. }
            | Self::EpochCommitted { meta, .. }
            | Self::OrderCancelled { meta, .. } => meta,
        }
    }
}

fn epoch_id_from_topic(topic: &H256) -> Result<u64> {
    let value = U256::from_big_endian(topic.as_bytes());
    if value > U256::from(u64::MAX) {
        bail!("epoch id {value} does not fit into u64");
    }
    Ok(value.as_u64())
}

/// Decodes a log of either contract into a typed event. `Ok(None)` for
/// topics we do not consume.
pub fn decode_event(log: &Log) -> Result<Option<ChainEvent>> {
    let Some(topic) = log.topics.first() else {
        return Ok(None);
    };
    let meta = EventMeta::of(log)?;
    let event = if *topic == *DEPOSIT_TOPIC {
        let tokens = ethabi::decode(&[ParamType::Address, ParamType::Uint(256)], &log.data.0)
            .context("malformed Deposit data")?;
        match (&tokens[0], &tokens[1]) {
            (Token::Address(user), Token::Uint(amount)) => {
                ChainEvent::Deposit { user: *user, amount: *amount, meta }
            }
            _ => bail!("unexpected Deposit tokens"),
        }
    } else if *topic == *CLAIMED_TOPIC {
        let epoch_id = epoch_id_from_topic(
            log.topics.get(1).ok_or_else(|| anyhow!("Claimed without epoch topic"))?,
        )?;
        let tokens = ethabi::decode(&[ParamType::Address, ParamType::Uint(256)], &log.data.0)
            .context("malformed Claimed data")?;
        match (&tokens[0], &tokens[1]) {
            (Token::Address(user), Token::Uint(amount)) => {
                ChainEvent::Claimed { user: *user, epoch_id, amount: *amount, meta }
            }
            _ => bail!("unexpected Claimed tokens"),
        }
    } else if *topic == *EPOCH_COMMITTED_TOPIC {
        let epoch_id = epoch_id_from_topic(
            log.topics
                .get(1)
                .ok_or_else(|| anyhow!("EpochCommitted without epoch topic"))?,
        )?;
        let tokens = ethabi::decode(&[ParamType::FixedBytes(32), ParamType::Uint(256)], &log.data.0)
            .context("malformed EpochCommitted data")?;
        match (&tokens[0], &tokens[1]) {
            (Token::FixedBytes(root), Token::Uint(total_amount)) => ChainEvent::EpochCommitted {
                epoch_id,
                merkle_root: H256::from_slice(root),
                total_amount: *total_amount,
                meta,
            },
            _ => bail!("unexpected EpochCommitted tokens"),
        }
    } else if *topic == *ORDER_CANCELLED_TOPIC {
        let order_hash = *log
            .topics
            .get(1)
            .ok_or_else(|| anyhow!("OrderCancelled without hash topic"))?;
        ChainEvent::OrderCancelled { order_hash, meta }
    } else {
        return Ok(None);
    };
    Ok(Some(event))
}

async fn eth_call(web3: &Web3, to: H160, data: Vec<u8>) -> Result<Vec<u8>> {
    let request = CallRequest {
        to: Some(to),
        data: Some(Bytes(data)),
        ..Default::default()
    };
    Ok(web3.eth().call(request, None).await?.0)
}

fn decode_uint(output: &[u8]) -> Result<U256> {
    let tokens =
        ethabi::decode(&[ParamType::Uint(256)], output).context("malformed uint return value")?;
    match tokens.first() {
        Some(Token::Uint(value)) => Ok(*value),
        _ => bail!("unexpected return tokens"),
    }
}

#[derive(Clone)]
pub struct Vault {
    web3: Web3,
    pub address: H160,
}

impl Vault {
    pub fn new(web3: Web3, address: H160) -> Self {
        Self { web3, address }
    }

    pub async fn total_deposits(&self) -> Result<U256> {
        let output = eth_call(&self.web3, self.address, TOTAL_DEPOSITS.to_vec()).await?;
        decode_uint(&output).context("totalDeposits()")
    }

    pub async fn balance_of(&self, user: H160) -> Result<U256> {
        let mut data = BALANCE_OF.to_vec();
        data.extend(ethabi::encode(&[Token::Address(user)]));
        let output = eth_call(&self.web3, self.address, data).await?;
        decode_uint(&output).context("balanceOf(address)")
    }

    pub async fn commit_epoch(
        &self,
        from: H160,
        epoch_id: u64,
        merkle_root: H256,
        total_amount: U256,
    ) -> Result<H256> {
        let mut data = COMMIT_EPOCH.to_vec();
        data.extend(ethabi::encode(&[
            Token::Uint(epoch_id.into()),
            Token::FixedBytes(merkle_root.as_bytes().to_vec()),
            Token::Uint(total_amount),
        ]));
        let request = TransactionRequest {
            from,
            to: Some(self.address),
            data: Some(Bytes(data)),
            ..Default::default()
        };
        Ok(self.web3.eth().send_transaction(request).await?)
    }
}

#[derive(Clone)]
pub struct Exchange {
    web3: Web3,
    pub address: H160,
}

impl Exchange {
    pub fn new(web3: Web3, address: H160) -> Self {
        Self { web3, address }
    }

    pub async fn nonce(&self, owner: H160) -> Result<U256> {
        let mut data = NONCES.to_vec();
        data.extend(ethabi::encode(&[Token::Address(owner)]));
        let output = eth_call(&self.web3, self.address, data).await?;
        decode_uint(&output).context("nonces(address)")
    }

    pub async fn execute_trade(&self, from: H160, trade: &Trade) -> Result<H256> {
        let mut data = EXECUTE_TRADE.to_vec();
        data.extend(ethabi::encode(&[
            Token::FixedBytes(trade.taker_order.0.as_bytes().to_vec()),
            Token::FixedBytes(trade.maker_order.0.as_bytes().to_vec()),
            Token::Address(trade.maker),
            Token::Address(trade.taker),
            Token::Uint(trade.token_id),
            Token::Uint(trade.amount),
            Token::Uint(trade.price),
        ]));
        let request = TransactionRequest {
            from,
            to: Some(self.address),
            data: Some(Bytes(data)),
            ..Default::default()
        };
        Ok(self.web3.eth().send_transaction(request).await?)
    }
}

/// Settlement submission over the real contracts, signed by the operator
/// account unlocked at the node.
pub struct OnchainSettlement {
    pub vault: Vault,
    pub exchange: Exchange,
    pub operator: H160,
}

#[async_trait::async_trait]
impl settlement::SettlementContract for OnchainSettlement {
    async fn commit_epoch(
        &self,
        epoch_id: u64,
        merkle_root: H256,
        total_amount: U256,
    ) -> Result<H256> {
        self.vault
            .commit_epoch(self.operator, epoch_id, merkle_root, total_amount)
            .await
    }

    async fn execute_trade(&self, trade: &Trade) -> Result<H256> {
        self.exchange.execute_trade(self.operator, trade).await
    }
}

#[async_trait::async_trait]
impl crate::reconciliation::VaultReading for Vault {
    async fn total_deposits(&self) -> Result<U256> {
        Vault::total_deposits(self).await
    }

    async fn balance_of(&self, user: H160) -> Result<U256> {
        Vault::balance_of(self, user).await
    }
}

/// Everything the indexer reads from the chain, bundled over one node
/// connection.
#[derive(Clone)]
pub struct RpcChain {
    web3: Web3,
    vault: Vault,
    exchange: Exchange,
}

impl RpcChain {
    pub fn new(web3: Web3, vault: Vault, exchange: Exchange) -> Self {
        Self { web3, vault, exchange }
    }
}

#[async_trait::async_trait]
impl crate::indexer::ChainData for RpcChain {
    async fn head_block(&self) -> Result<u64> {
        Ok(self.web3.eth().block_number().await?.as_u64())
    }

    async fn block_hash(&self, number: u64) -> Result<Option<H256>> {
        let block = self
            .web3
            .eth()
            .block(web3::types::BlockId::Number(BlockNumber::Number(number.into())))
            .await?;
        Ok(block.and_then(|block| block.hash))
    }

    async fn events(&self, from: u64, to: u64) -> Result<Vec<ChainEvent>> {
        let filter = FilterBuilder::default()
            .address(vec![self.vault.address, self.exchange.address])
            .from_block(BlockNumber::Number(from.into()))
            .to_block(BlockNumber::Number(to.into()))
            .build();
        let logs = self.web3.eth().logs(filter).await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_event(log) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => tracing::debug!(topics = ?log.topics, "skipping unknown event"),
                Err(err) => tracing::warn!(?err, "failed to decode event"),
            }
        }
        events.sort_by_key(|event| (event.meta().block_number, event.meta().log_index));
        Ok(events)
    }

    async fn nonce(&self, owner: H160) -> Result<U256> {
        self.exchange.nonce(owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use web3::types::{H160 as LogAddress, U256 as LogU256, U64};

    #[test]
    fn selectors_match_reference_values() {
        assert_eq!(*BALANCE_OF, hex!("70a08231"));
        assert_eq!(*NONCES, hex!("7ecebe00"));
        assert_eq!(*TOTAL_DEPOSITS, hex!("7d882097"));
    }

    #[test]
    fn topics_match_reference_values() {
        assert_eq!(
            *DEPOSIT_TOPIC,
            H256(hex!("e1fffcc4923d04b559f4d29a8bfc6cda04eb5b0d3c460751c2402c5c5cc9109c")),
        );
        assert_eq!(
            *ORDER_CANCELLED_TOPIC,
            H256(hex!("5152abf959f6564662358c2e52b702259b78bac5ee7842a0f01937e670efcc7d")),
        );
    }

    fn log(topics: Vec<H256>, data: Vec<u8>) -> Log {
        Log {
            address: LogAddress::zero(),
            topics,
            data: Bytes(data),
            block_hash: None,
            block_number: Some(U64::from(7)),
            transaction_hash: Some(H256::repeat_byte(0x01)),
            transaction_index: None,
            log_index: Some(LogU256::from(3)),
            transaction_log_index: None,
            log_type: None,
            removed: None,
        }
    }

    #[test]
    fn decodes_deposit() {
        let user = H160::repeat_byte(0x11);
        let data = ethabi::encode(&[Token::Address(user), Token::Uint(100.into())]);
        let event = decode_event(&log(vec![*DEPOSIT_TOPIC], data)).unwrap().unwrap();
        assert_eq!(
            event,
            ChainEvent::Deposit {
                user,
                amount: 100.into(),
                meta: EventMeta {
                    block_number: 7,
                    tx_hash: H256::repeat_byte(0x01),
                    log_index: 3,
                },
            },
        );
    }

    #[test]
    fn decodes_claimed_with_indexed_epoch() {
        let user = H160::repeat_byte(0x11);
        let epoch_topic = H256::from_low_u64_be(5);
        let data = ethabi::encode(&[Token::Address(user), Token::Uint(42.into())]);
        let event = decode_event(&log(vec![*CLAIMED_TOPIC, epoch_topic], data))
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            ChainEvent::Claimed { epoch_id: 5, amount, .. } if amount == 42.into()
        ));
    }

    #[test]
    fn decodes_order_cancelled() {
        let order_hash = H256::repeat_byte(0xab);
        let event = decode_event(&log(vec![*ORDER_CANCELLED_TOPIC, order_hash], Vec::new()))
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            ChainEvent::OrderCancelled { order_hash: hash, .. } if hash == order_hash
        ));
    }

    #[test]
    fn unknown_topics_are_skipped() {
        let event = decode_event(&log(vec![H256::repeat_byte(0xff)], Vec::new())).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn pending_logs_are_rejected() {
        let mut pending = log(vec![*ORDER_CANCELLED_TOPIC, H256::zero()], Vec::new());
        pending.block_number = None;
        assert!(decode_event(&pending).is_err());
    }
}
