/// Metrics aggregation
use crate::buffer::BufferStats;
use crate::envelope::now_millis;
use crate::errors::{HubError, HubResult};
use crate::registry::ConnectionCounts;
use parking_lot::Mutex;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Length of a performance window in milliseconds.
pub const WINDOW_MS: i64 = 60_000;

/// Weight kept from the previous latency average.
const LATENCY_DECAY: f64 = 0.9;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub messages_processed: u64,
    pub messages_per_second: f64,
    pub average_latency_ms: f64,
    pub error_count: u64,
    pub window_started_at: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub uptime_secs: u64,
    pub is_running: bool,
}

/// Point-in-time metrics returned by `get_metrics`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub performance: PerformanceMetrics,
    pub clients: ConnectionCounts,
    pub buffer: BufferStats,
    pub system: SystemMetrics,
}

#[derive(Debug)]
struct Window {
    processed: u64,
    errors: u64,
    messages_per_second: f64,
    average_latency_ms: Option<f64>,
    started_at: i64,
}

impl Window {
    fn new(now_ms: i64) -> Self {
        Self {
            processed: 0,
            errors: 0,
            messages_per_second: 0.0,
            average_latency_ms: None,
            started_at: now_ms,
        }
    }
}

/// Windowed performance counters plus a Prometheus mirror.
pub struct MetricsAggregator {
    registry: Arc<Registry>,
    window: Mutex<Window>,
    started: Instant,

    pub messages_total: IntCounter,
    pub errors_total: IntCounter,
    pub channel_failures_total: IntCounter,
    pub buffered_total: IntCounter,
    pub delivery_latency: Histogram,
    pub connections_active: IntGauge,
    pub envelopes_buffered: IntGauge,
}

impl MetricsAggregator {
    pub fn new() -> HubResult<Self> {
        let registry = Arc::new(Registry::new());

        let messages_total = IntCounter::new("agentlink_messages_total", "Envelopes dispatched")?;
        registry.register(Box::new(messages_total.clone()))?;

        let errors_total = IntCounter::new("agentlink_errors_total", "Processing errors")?;
        registry.register(Box::new(errors_total.clone()))?;

        let channel_failures_total = IntCounter::new(
            "agentlink_channel_failures_total",
            "Store writes that failed after retries",
        )?;
        registry.register(Box::new(channel_failures_total.clone()))?;

        let buffered_total =
            IntCounter::new("agentlink_buffered_total", "Envelopes deferred to the offline buffer")?;
        registry.register(Box::new(buffered_total.clone()))?;

        let delivery_latency = Histogram::with_opts(
            HistogramOpts::new(
                "agentlink_delivery_latency_seconds",
                "Time from envelope creation to dispatch",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(delivery_latency.clone()))?;

        let connections_active = IntGauge::new("agentlink_connections_active", "Connected sessions")?;
        registry.register(Box::new(connections_active.clone()))?;

        let envelopes_buffered =
            IntGauge::new("agentlink_envelopes_buffered", "Envelopes held in the offline buffer")?;
        registry.register(Box::new(envelopes_buffered.clone()))?;

        Ok(Self {
            registry,
            window: Mutex::new(Window::new(now_millis())),
            started: Instant::now(),
            messages_total,
            errors_total,
            channel_failures_total,
            buffered_total,
            delivery_latency,
            connections_active,
            envelopes_buffered,
        })
    }

    /// Count a dispatched envelope. `latency_ms` is now minus the envelope
    /// timestamp.
    pub fn record_processed(&self, latency_ms: f64) {
        let latency_ms = latency_ms.max(0.0);
        {
            let mut window = self.window.lock();
            window.processed += 1;
            window.average_latency_ms = Some(match window.average_latency_ms {
                None => latency_ms,
                Some(old) => LATENCY_DECAY * old + (1.0 - LATENCY_DECAY) * latency_ms,
            });
        }
        self.messages_total.inc();
        self.delivery_latency.observe(latency_ms / 1000.0);
    }

    pub fn record_error(&self) {
        self.window.lock().errors += 1;
        self.errors_total.inc();
    }

    /// A store write that failed after retries. Counts as an error too.
    pub fn record_channel_failure(&self) {
        self.channel_failures_total.inc();
        self.record_error();
    }

    pub fn record_buffered(&self, count: usize) {
        self.buffered_total.inc_by(count as u64);
    }

    /// Recompute messages/second and roll the window once it is a minute old.
    pub fn tick(&self, now_ms: i64) {
        let mut window = self.window.lock();
        let elapsed_ms = (now_ms - window.started_at).max(1);
        window.messages_per_second = window.processed as f64 * 1000.0 / elapsed_ms as f64;

        if elapsed_ms >= WINDOW_MS {
            let rate = window.messages_per_second;
            *window = Window::new(now_ms);
            window.messages_per_second = rate;
        }
    }

    pub fn snapshot(
        &self,
        clients: ConnectionCounts,
        buffer: BufferStats,
        is_running: bool,
    ) -> MetricsSnapshot {
        self.connections_active.set(clients.connected as i64);
        self.envelopes_buffered.set(buffer.total_buffered as i64);

        let performance = {
            let window = self.window.lock();
            PerformanceMetrics {
                messages_processed: window.processed,
                messages_per_second: window.messages_per_second,
                average_latency_ms: window.average_latency_ms.unwrap_or(0.0),
                error_count: window.errors,
                window_started_at: window.started_at,
            }
        };

        MetricsSnapshot {
            performance,
            clients,
            buffer,
            system: SystemMetrics {
                uptime_secs: self.started.elapsed().as_secs(),
                is_running,
            },
        }
    }

    /// All metrics in Prometheus text format.
    pub fn gather_metrics(&self) -> HubResult<String> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        prometheus::Encoder::encode(&prometheus::TextEncoder::new(), &families, &mut buf)?;
        String::from_utf8(buf).map_err(|e| HubError::Metrics(e.to_string()))
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_ewma() {
        let metrics = MetricsAggregator::new().unwrap();
        metrics.record_processed(100.0);
        metrics.record_processed(200.0);
        let snap = metrics.snapshot(ConnectionCounts::default(), BufferStats::default(), true);
        assert_eq!(snap.performance.messages_processed, 2);
        assert!((snap.performance.average_latency_ms - 110.0).abs() < 1e-9);
        assert_eq!(metrics.messages_total.get(), 2);
    }

    #[test]
    fn test_window_rolls_after_a_minute() {
        let metrics = MetricsAggregator::new().unwrap();
        for _ in 0..120 {
            metrics.record_processed(1.0);
        }
        metrics.record_error();
        let start = metrics
            .snapshot(ConnectionCounts::default(), BufferStats::default(), true)
            .performance
            .window_started_at;

        metrics.tick(start + WINDOW_MS);
        let snap = metrics.snapshot(ConnectionCounts::default(), BufferStats::default(), true);
        assert!((snap.performance.messages_per_second - 2.0).abs() < 1e-9);
        assert_eq!(snap.performance.messages_processed, 0);
        assert_eq!(snap.performance.error_count, 0);
        assert_eq!(snap.performance.window_started_at, start + WINDOW_MS);
        assert_eq!(metrics.errors_total.get(), 1);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let metrics = MetricsAggregator::new().unwrap();
        let snap = metrics.snapshot(
            ConnectionCounts {
                total: 2,
                connected: 1,
                disconnected: 1,
                error: 0,
            },
            BufferStats {
                total_buffered: 3,
                agents: 1,
            },
            false,
        );
        let value = serde_json::to_value(snap).unwrap();
        assert_eq!(value["performance"]["messagesProcessed"], 0);
        assert_eq!(value["buffer"]["totalBuffered"], 3);
        assert_eq!(value["clients"]["connected"], 1);
        assert_eq!(value["system"]["isRunning"], false);
    }

    #[test]
    fn test_gather_metrics() {
        let metrics = MetricsAggregator::new().unwrap();
        metrics.record_channel_failure();
        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("agentlink_channel_failures_total 1"));
        assert!(text.contains("agentlink_errors_total 1"));
    }
}
