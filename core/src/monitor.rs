//! Health monitor.
//!
//! One cycle per heartbeat tick: flag silent sessions, expire buffered
//! envelopes, and advance the metrics window.

use crate::buffer::OfflineBuffer;
use crate::envelope::now_millis;
use crate::metrics::MetricsAggregator;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// What a single monitor cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub flagged: Vec<String>,
    pub expired: usize,
}

#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<ConnectionRegistry>,
    buffer: Arc<OfflineBuffer>,
    metrics: Arc<MetricsAggregator>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        buffer: Arc<OfflineBuffer>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            registry,
            buffer,
            metrics,
        }
    }

    pub fn run_cycle(&self, now_ms: i64) -> CycleReport {
        let flagged = self.registry.sweep_health(now_ms);
        let expired = self.buffer.sweep_expired(now_ms);
        self.metrics.tick(now_ms);

        if !flagged.is_empty() || expired > 0 {
            debug!(flagged = flagged.len(), expired, "Health cycle");
        } else {
            trace!("Health cycle: nothing to do");
        }
        CycleReport { flagged, expired }
    }

    /// Run a cycle every `period` until the shutdown channel fires.
    pub fn spawn(
        self,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Health monitor shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.run_cycle(now_millis());
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{validate, EnvelopeDraft, MessageType};
    use crate::registry::{ConnectionStatus, OUTBOUND_QUEUE_CAPACITY};
    use serde_json::{json, Map};
    use tokio::sync::mpsc;

    fn monitor(unhealthy_after: Duration) -> (HealthMonitor, Arc<ConnectionRegistry>, Arc<OfflineBuffer>) {
        let registry = ConnectionRegistry::new(Duration::from_secs(60), unhealthy_after);
        let buffer = Arc::new(OfflineBuffer::new(10, 1_000, false));
        let metrics = Arc::new(MetricsAggregator::new().unwrap());
        (
            HealthMonitor::new(registry.clone(), buffer.clone(), metrics),
            registry,
            buffer,
        )
    }

    #[tokio::test]
    async fn test_cycle_flags_and_expires() {
        let (monitor, registry, buffer) = monitor(Duration::from_millis(500));
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        registry.register("c1", "agent-a", Map::new(), tx);
        buffer.enqueue(
            "offline",
            validate(EnvelopeDraft::new(MessageType::Alert, "a", "offline", "alerts", json!(1))).unwrap(),
        );

        let report = monitor.run_cycle(now_millis() + 2_000);
        assert_eq!(report.flagged, vec!["c1".to_string()]);
        assert_eq!(report.expired, 1);
        assert_eq!(registry.get("c1").unwrap().status, ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_spawned_monitor_stops_on_shutdown() {
        let (monitor, registry, _buffer) = monitor(Duration::from_millis(30));
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        registry.register("c1", "agent-a", Map::new(), tx);

        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = monitor.spawn(Duration::from_millis(20), shutdown_tx.subscribe());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(registry.get("c1").unwrap().status, ConnectionStatus::Error);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
