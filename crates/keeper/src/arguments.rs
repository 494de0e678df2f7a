use anyhow::{ensure, Context as _, Result};
use model::market::OutcomePair;
use primitive_types::{H160, H256, U256};
use shared::arguments::{
    display_option, display_secs, duration_from_millis, duration_from_seconds, wei_from_base_unit,
};
use std::{
    fmt::{self, Display, Formatter},
    net::SocketAddr,
    str::FromStr,
    time::Duration,
};
use url::Url;

#[derive(clap::Parser)]
pub struct Arguments {
    #[clap(
        long,
        env = "LOG_FILTER",
        default_value = "warn,keeper=debug,orderbook=debug,settlement=debug,shared=debug"
    )]
    pub log_filter: String,

    /// The Ethereum node URL to connect to. When not set, the chain bound
    /// services (indexer, settlement, reconciliation) are disabled and the
    /// keeper runs matching only.
    #[clap(long, env)]
    pub node_url: Option<Url>,

    #[clap(long, env, default_value = "137")]
    pub chain_id: u64,

    /// Address of the exchange contract; also the EIP-712 verifying
    /// contract for order signatures.
    #[clap(long, env, value_parser = h160_from_str)]
    pub exchange_address: H160,

    /// Address of the settlement vault contract.
    #[clap(long, env, value_parser = h160_from_str)]
    pub vault_address: H160,

    /// Account unlocked at the node that sends commit and execution
    /// transactions.
    #[clap(long, env, value_parser = h160_from_str, default_value = "0x0000000000000000000000000000000000000000")]
    pub operator_address: H160,

    /// The binary markets to serve, as
    /// `<marketId>:<yesTokenId>:<noTokenId>` triples.
    #[clap(long, env, use_value_delimiter = true, value_parser = outcome_pair_from_str)]
    pub outcome_pairs: Vec<OutcomePair>,

    #[clap(long, env, default_value = "0.0.0.0:9586")]
    pub metrics_address: SocketAddr,

    /// How often pending trades are drained into a settlement batch, in
    /// milliseconds.
    #[clap(long, env, default_value = "60000", value_parser = duration_from_millis)]
    pub settlement_batch_interval: Duration,

    #[clap(long, env, default_value = "3")]
    pub settlement_max_retries: usize,

    /// Initial backoff between settlement retries, in milliseconds;
    /// doubles per attempt.
    #[clap(long, env, default_value = "1000", value_parser = duration_from_millis)]
    pub settlement_retry_backoff: Duration,

    #[clap(long, env, default_value = "300000", value_parser = duration_from_millis)]
    pub reconciliation_interval: Duration,

    #[clap(long, env, default_value = "2000", value_parser = duration_from_millis)]
    pub indexer_poll_interval: Duration,

    /// Confirmation depth before a deposit is credited off chain.
    #[clap(long, env, default_value = "20")]
    pub confirmations: u64,

    /// Reconciliation discrepancy (as a fraction of the on-chain total)
    /// that triggers a warning.
    #[clap(long, env, default_value = "0.0001")]
    pub discrepancy_warn: f64,

    /// The critical threshold is the warning threshold times this factor;
    /// crossing it pauses the exchange.
    #[clap(long, env, default_value = "10")]
    pub critical_multiplier: u64,

    /// How often the chain head is polled for maintenance, in seconds.
    #[clap(long, env, default_value = "5", value_parser = duration_from_seconds)]
    pub block_stream_poll_interval: Duration,

    /// Largest single order in whole collateral units.
    #[clap(long, env, default_value = "10000", value_parser = wei_from_base_unit)]
    pub max_order_size: U256,

    /// Largest open exposure per account in whole collateral units.
    #[clap(long, env, default_value = "100000", value_parser = wei_from_base_unit)]
    pub max_exposure: U256,

    #[clap(long, env, default_value = "60")]
    pub max_orders_per_minute: usize,

    /// Daily withdrawal alert threshold per account in whole collateral
    /// units.
    #[clap(long, env, default_value = "50000", value_parser = wei_from_base_unit)]
    pub max_withdrawal_per_day: U256,

    /// If the last successful indexer cycle is older than this, the pod
    /// fails the liveness check. In seconds.
    #[clap(long, env, default_value = "300", value_parser = duration_from_seconds)]
    pub max_indexer_age: Duration,
}

impl Arguments {
    /// Warning threshold in parts per million of the on-chain total.
    pub fn warn_ppm(&self) -> u64 {
        (self.discrepancy_warn * 1_000_000.0) as u64
    }

    pub fn critical_ppm(&self) -> u64 {
        self.warn_ppm().saturating_mul(self.critical_multiplier)
    }
}

fn h160_from_str(s: &str) -> Result<H160> {
    H160::from_str(s.trim_start_matches("0x")).context("invalid address")
}

fn h256_from_str(s: &str) -> Result<H256> {
    H256::from_str(s.trim_start_matches("0x")).context("invalid 32 byte hash")
}

/// `<marketId>:<yesTokenId>:<noTokenId>` with decimal token ids.
fn outcome_pair_from_str(s: &str) -> Result<OutcomePair> {
    let parts: Vec<_> = s.split(':').collect();
    ensure!(parts.len() == 3, "expected <marketId>:<yes>:<no>, got {s:?}");
    Ok(OutcomePair {
        market_id: h256_from_str(parts[0])?,
        yes: U256::from_dec_str(parts[1]).context("invalid yes token id")?,
        no: U256::from_dec_str(parts[2]).context("invalid no token id")?,
    })
}

impl Display for Arguments {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "log_filter: {}", self.log_filter)?;
        write!(f, "node_url: ")?;
        display_option(&self.node_url, f)?;
        writeln!(f)?;
        writeln!(f, "chain_id: {}", self.chain_id)?;
        writeln!(f, "exchange_address: {:?}", self.exchange_address)?;
        writeln!(f, "vault_address: {:?}", self.vault_address)?;
        writeln!(f, "operator_address: {:?}", self.operator_address)?;
        writeln!(f, "outcome_pairs: {}", self.outcome_pairs.len())?;
        writeln!(f, "metrics_address: {}", self.metrics_address)?;
        write!(f, "settlement_batch_interval: ")?;
        display_secs(self.settlement_batch_interval, f)?;
        writeln!(f)?;
        writeln!(f, "settlement_max_retries: {}", self.settlement_max_retries)?;
        write!(f, "reconciliation_interval: ")?;
        display_secs(self.reconciliation_interval, f)?;
        writeln!(f)?;
        write!(f, "indexer_poll_interval: ")?;
        display_secs(self.indexer_poll_interval, f)?;
        writeln!(f)?;
        writeln!(f, "confirmations: {}", self.confirmations)?;
        writeln!(f, "discrepancy_warn: {}", self.discrepancy_warn)?;
        writeln!(f, "critical_multiplier: {}", self.critical_multiplier)?;
        Ok(())
    }
}
