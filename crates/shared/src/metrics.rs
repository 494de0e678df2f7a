use axum::{extract::State, http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{Encoder as _, Registry, TextEncoder};
use prometheus_metric_storage::StorageRegistry;
use std::{net::SocketAddr, sync::Arc};

/// Name prefix for all metrics exposed by the services.
const PREFIX: &str = "ctfx";

lazy_static! {
    static ref REGISTRY: StorageRegistry = StorageRegistry::new(
        Registry::new_custom(Some(PREFIX.to_string()), None).unwrap()
    );
}

pub fn get_metrics_registry() -> &'static Registry {
    get_metric_storage_registry().registry()
}

pub fn get_metric_storage_registry() -> &'static StorageRegistry {
    &REGISTRY
}

#[async_trait::async_trait]
pub trait LivenessChecking: Send + Sync {
    async fn is_alive(&self) -> bool;
}

/// Serves `/metrics` and `/liveness` until the process exits.
pub async fn serve_metrics(
    liveness: Arc<dyn LivenessChecking>,
    address: SocketAddr,
) -> anyhow::Result<()> {
    tracing::info!(%address, "serving metrics");
    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/liveness", get(liveness_check))
        .with_state(liveness);
    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics() -> String {
    let metrics = get_metrics_registry().gather();
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&metrics, &mut buffer) {
        tracing::error!(?err, "could not encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

async fn liveness_check(State(liveness): State<Arc<dyn LivenessChecking>>) -> StatusCode {
    if liveness.is_alive().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_shared() {
        assert!(std::ptr::eq(get_metrics_registry(), get_metric_storage_registry().registry()));
    }
}
