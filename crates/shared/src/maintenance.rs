use crate::current_block::{into_stream, CurrentBlockStream};
use anyhow::Result;
use futures::StreamExt as _;
use prometheus::IntCounterVec;
use std::sync::Arc;

/// Collects all service components requiring maintenance on each new block.
#[async_trait::async_trait]
pub trait Maintaining: Send + Sync {
    async fn run_maintenance(&self) -> Result<()>;
    fn name(&self) -> &str;
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Maintenance runs, labelled by maintainer and result.
    #[metric(labels("maintainer", "result"))]
    maintenance_runs: IntCounterVec,
}

pub struct ServiceMaintenance {
    maintainers: Vec<Arc<dyn Maintaining>>,
    metrics: &'static Metrics,
}

impl ServiceMaintenance {
    pub fn new(maintainers: Vec<Arc<dyn Maintaining>>) -> Self {
        Self {
            maintainers,
            metrics: Metrics::instance(crate::metrics::get_metric_storage_registry()).unwrap(),
        }
    }

    async fn run_maintenance(&self) {
        for maintainer in &self.maintainers {
            let result = maintainer.run_maintenance().await;
            let label = if result.is_ok() { "ok" } else { "error" };
            if let Err(err) = result {
                tracing::warn!(?err, maintainer = maintainer.name(), "maintenance failed");
            }
            self.metrics
                .maintenance_runs
                .with_label_values(&[maintainer.name(), label])
                .inc();
        }
    }

    pub async fn run_maintenance_on_new_block(self, current_block: CurrentBlockStream) -> ! {
        let mut stream = into_stream(current_block);
        while let Some(block) = stream.next().await {
            tracing::debug!(block = block.number, "running maintenance");
            self.run_maintenance().await;
        }
        panic!("block stream terminated unexpectedly");
    }
}
