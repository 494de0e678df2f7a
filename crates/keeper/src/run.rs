use crate::{
    api::OrderApi,
    arguments::Arguments,
    contracts::{Exchange, OnchainSettlement, RpcChain, Vault},
    indexer::Indexer,
    monitor::Monitor,
    reconciliation::Reconciler,
    shutdown_controller::ShutdownController,
};
use anyhow::Result;
use chrono::Utc;
use clap::Parser as _;
use model::{market::OutcomeRegistry, DomainSeparator};
use orderbook::{risk::RiskLimits, Orderbook, OrderValidator};
use settlement::SettlementService;
use shared::{
    current_block::current_block_stream,
    maintenance::{Maintaining, ServiceMaintenance},
    metrics::LivenessChecking,
    signature_validator::Web3SignatureValidator,
};
use std::{
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

/// How often expired orders are swept when no node drives maintenance.
const FALLBACK_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub async fn start(args: impl Iterator<Item = String>) {
    let args = Arguments::parse_from(args);
    shared::tracing::initialize(args.log_filter.as_str());
    shared::panic_hook::install();
    tracing::info!("running keeper with validated arguments:\n{}", args);
    run(args).await;
}

pub struct Liveness {
    max_age: Duration,
    last_ok: RwLock<Instant>,
}

#[async_trait::async_trait]
impl LivenessChecking for Liveness {
    async fn is_alive(&self) -> bool {
        self.last_ok.read().unwrap().elapsed() <= self.max_age
    }
}

impl Liveness {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age, last_ok: RwLock::new(Instant::now()) }
    }

    pub fn bump(&self) {
        *self.last_ok.write().unwrap() = Instant::now();
    }
}

/// Evicts expired resting orders whenever a new block appears.
struct ExpirySweeper {
    orderbook: Arc<Mutex<Orderbook>>,
}

#[async_trait::async_trait]
impl Maintaining for ExpirySweeper {
    async fn run_maintenance(&self) -> Result<()> {
        let swept = self.orderbook.lock().unwrap().sweep_expired(Utc::now());
        if swept > 0 {
            tracing::debug!(swept, "evicted expired orders");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "ExpirySweeper"
    }
}

pub async fn run(args: Arguments) {
    let domain_separator = DomainSeparator::new(args.chain_id, args.exchange_address);
    let registry = OutcomeRegistry::new(args.outcome_pairs.iter().copied());
    let risk_limits = RiskLimits {
        max_order_size: args.max_order_size,
        max_exposure: args.max_exposure,
        max_orders_per_minute: args.max_orders_per_minute,
        max_withdrawal_per_day: args.max_withdrawal_per_day,
    };
    let orderbook = Arc::new(Mutex::new(Orderbook::new(
        domain_separator,
        registry,
        risk_limits,
    )));
    let monitor = Monitor::new();
    let liveness = Arc::new(Liveness::new(args.max_indexer_age));
    tokio::task::spawn(shared::metrics::serve_metrics(
        liveness.clone(),
        args.metrics_address,
    ));

    let mut shutdown = ShutdownController::new_shutdown_on_signal();

    let Some(node_url) = &args.node_url else {
        tracing::warn!(
            "no node url configured: indexer, settlement and reconciliation are disabled"
        );
        let sweeper = ExpirySweeper { orderbook };
        let mut sweep_timer = tokio::time::interval(FALLBACK_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = sweep_timer.tick() => {
                    let _ = sweeper.run_maintenance().await;
                    liveness.bump();
                }
                _ = shutdown.wait() => break,
            }
        }
        tracing::info!("shut down");
        return;
    };

    let web3 = shared::transport::create_transport(node_url).expect("connect ethereum RPC");
    let vault = Vault::new(web3.clone(), args.vault_address);
    let exchange = Exchange::new(web3.clone(), args.exchange_address);

    // Held for the order transport; validation runs against the chain, so
    // it lives with the other chain bound services.
    let _api = OrderApi::new(
        orderbook.clone(),
        OrderValidator::new(
            domain_separator,
            Arc::new(Web3SignatureValidator::new(web3.clone())),
        ),
    );

    let settlement = Arc::new(tokio::sync::Mutex::new(SettlementService::new(
        orderbook.clone(),
        OnchainSettlement {
            vault: vault.clone(),
            exchange: exchange.clone(),
            operator: args.operator_address,
        },
        args.settlement_max_retries,
        args.settlement_retry_backoff,
    )));
    let mut indexer = Indexer::new(
        RpcChain::new(web3.clone(), vault.clone(), exchange.clone()),
        orderbook.clone(),
        settlement.clone(),
        monitor.clone(),
        args.confirmations,
    );
    let mut reconciler = Reconciler::new(
        vault.clone(),
        orderbook.clone(),
        monitor.clone(),
        args.warn_ppm(),
        args.critical_ppm(),
    );

    let current_block = current_block_stream(web3.clone(), args.block_stream_poll_interval)
        .await
        .expect("subscribe to current block");
    let maintenance = ServiceMaintenance::new(vec![
        Arc::new(ExpirySweeper { orderbook: orderbook.clone() }) as Arc<dyn Maintaining>,
    ]);
    tokio::task::spawn(maintenance.run_maintenance_on_new_block(current_block));

    let mut indexer_timer = tokio::time::interval(args.indexer_poll_interval);
    let mut settlement_timer = tokio::time::interval(args.settlement_batch_interval);
    let mut reconciliation_timer = tokio::time::interval(args.reconciliation_interval);
    loop {
        tokio::select! {
            _ = indexer_timer.tick() => {
                match indexer.run_once().await {
                    Ok(()) => liveness.bump(),
                    Err(err) => tracing::warn!(?err, "indexer cycle failed"),
                }
            }
            _ = settlement_timer.tick() => {
                if let Err(err) = settlement.lock().await.run(Utc::now()).await {
                    tracing::error!(?err, "settlement cycle failed");
                }
            }
            _ = reconciliation_timer.tick() => {
                if let Err(err) = reconciler.run_once(Utc::now()).await {
                    tracing::warn!(?err, "reconciliation cycle failed");
                }
            }
            _ = shutdown.wait() => break,
        }
    }

    // Graceful exit: stop taking orders and settle what is already matched.
    tracing::info!("shutting down: draining a final settlement batch");
    orderbook.lock().unwrap().pause("shutting down");
    if let Err(err) = settlement.lock().await.run(Utc::now()).await {
        tracing::error!(?err, "final settlement drain failed");
    }
    tracing::info!("shut down");
}
