//! System health counters and the alert bus.

use chrono::{DateTime, Utc};
use prometheus::{IntCounterVec, IntGauge};
use tokio::sync::broadcast;

const ALERT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    fn as_label(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Alert {
    pub severity: Severity,
    /// The subsystem that raised the alert.
    pub source: &'static str,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(prometheus_metric_storage::MetricStorage)]
pub(crate) struct Metrics {
    /// Alerts raised, by severity.
    #[metric(labels("severity"))]
    alerts: IntCounterVec,
    /// Chain reorganizations observed by the indexer.
    pub reorgs: prometheus::IntCounter,
    /// Latest reconciliation discrepancy in parts per million.
    pub discrepancy_ppm: IntGauge,
    /// Whether the exchange is currently paused.
    pub paused: IntGauge,
    /// Last block the indexer has fully processed.
    pub last_processed_block: IntGauge,
    /// Deposits waiting for their confirmation depth.
    pub pending_deposits: IntGauge,
}

/// Cheap to clone handle that fans alerts out to subscribers and counts
/// them. Alerts are also logged so they reach operators without a
/// subscriber.
#[derive(Clone)]
pub struct Monitor {
    sender: broadcast::Sender<Alert>,
    pub(crate) metrics: &'static Metrics,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            sender: broadcast::channel(ALERT_CHANNEL_CAPACITY).0,
            metrics: Metrics::instance(shared::metrics::get_metric_storage_registry()).unwrap(),
        }
    }
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alert(&self, severity: Severity, source: &'static str, message: String) {
        match severity {
            Severity::Warning => tracing::warn!(source, %message, "alert"),
            Severity::Critical => tracing::error!(source, %message, "alert"),
        }
        self.metrics
            .alerts
            .with_label_values(&[severity.as_label()])
            .inc();
        let _ = self.sender.send(Alert {
            severity,
            source,
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alerts_reach_subscribers() {
        let monitor = Monitor::new();
        let mut alerts = monitor.subscribe();
        monitor.alert(Severity::Critical, "test", "it broke".to_string());
        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.source, "test");
    }

    #[test]
    fn alerts_without_subscribers_are_fine() {
        Monitor::new().alert(Severity::Warning, "test", "nobody listens".to_string());
    }
}
