//! Observability sink for the pool supervisor.
//!
//! The real counters/gauges/alert channel live outside this crate (Prometheus,
//! a chat webhook, whatever the deployment wires up) — see spec §6. The
//! supervisor only ever talks to the two traits below, injected by whichever
//! binary constructs it, so swapping backends never touches supervisor code.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Named counters/gauges emitted by the pool supervisor (spec §6).
pub trait PoolMetrics: Send + Sync {
    fn set_nodes_total(&self, total: u32);
    fn set_nodes_up(&self, up: u32);
    fn observe_latency_ms(&self, node_id: &str, latency_ms: f64);
    fn inc_newnym(&self, node_id: &str);
    fn inc_restart(&self, node_id: &str);
}

/// Fired by the Health Loop when the unhealthy fraction crosses
/// `AlertThreshold` (spec §4.F). Debouncing lives in the health loop itself —
/// this trait just delivers the message.
pub trait AlertSink: Send + Sync {
    fn alert(&self, message: &str);
}

/// Default metrics sink: does nothing. Used where no recorder is configured.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl PoolMetrics for NoopMetrics {
    fn set_nodes_total(&self, _total: u32) {}
    fn set_nodes_up(&self, _up: u32) {}
    fn observe_latency_ms(&self, _node_id: &str, _latency_ms: f64) {}
    fn inc_newnym(&self, _node_id: &str) {}
    fn inc_restart(&self, _node_id: &str) {}
}

/// Default alert sink: logs through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingAlertSink;

impl AlertSink for LoggingAlertSink {
    fn alert(&self, message: &str) {
        tracing::warn!(%message, "pool alert");
    }
}

impl AlertSink for NoopMetrics {
    fn alert(&self, _message: &str) {}
}

/// In-memory metrics sink for tests: records the last gauge values and total
/// counter increments so assertions can read them back synchronously.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    nodes_total: AtomicI64,
    nodes_up: AtomicI64,
    newnym_total: AtomicU64,
    restarts_total: AtomicU64,
    last_latency_ms: Mutex<Option<(String, f64)>>,
    alerts: Mutex<Vec<String>>,
}

impl RecordingMetrics {
    pub fn nodes_total(&self) -> i64 {
        self.nodes_total.load(Ordering::SeqCst)
    }

    pub fn nodes_up(&self) -> i64 {
        self.nodes_up.load(Ordering::SeqCst)
    }

    pub fn newnym_total(&self) -> u64 {
        self.newnym_total.load(Ordering::SeqCst)
    }

    pub fn restarts_total(&self) -> u64 {
        self.restarts_total.load(Ordering::SeqCst)
    }

    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().unwrap().clone()
    }
}

impl PoolMetrics for RecordingMetrics {
    fn set_nodes_total(&self, total: u32) {
        self.nodes_total.store(total as i64, Ordering::SeqCst);
    }

    fn set_nodes_up(&self, up: u32) {
        self.nodes_up.store(up as i64, Ordering::SeqCst);
    }

    fn observe_latency_ms(&self, node_id: &str, latency_ms: f64) {
        *self.last_latency_ms.lock().unwrap() = Some((node_id.to_string(), latency_ms));
    }

    fn inc_newnym(&self, _node_id: &str) {
        self.newnym_total.fetch_add(1, Ordering::SeqCst);
    }

    fn inc_restart(&self, _node_id: &str) {
        self.restarts_total.fetch_add(1, Ordering::SeqCst);
    }
}

impl AlertSink for RecordingMetrics {
    fn alert(&self, message: &str) {
        self.alerts.lock().unwrap().push(message.to_string());
    }
}

/// Concrete `PoolMetrics` backed by the `metrics` facade crate
/// (`metrics::counter!`/`metrics::gauge!`), wired to whatever recorder the
/// binary installs (e.g. `metrics-exporter-prometheus`). Not used by default —
/// `pool-cli` starts with `NoopMetrics` unless a recorder is installed.
#[cfg(feature = "metrics-backend")]
#[derive(Debug, Default)]
pub struct MetricsCrateSink;

#[cfg(feature = "metrics-backend")]
impl PoolMetrics for MetricsCrateSink {
    fn set_nodes_total(&self, total: u32) {
        metrics::gauge!("nodes_total").set(total as f64);
    }

    fn set_nodes_up(&self, up: u32) {
        metrics::gauge!("nodes_up").set(up as f64);
    }

    fn observe_latency_ms(&self, node_id: &str, latency_ms: f64) {
        metrics::gauge!("node_latency_ms", "node_id" => node_id.to_string()).set(latency_ms);
    }

    fn inc_newnym(&self, node_id: &str) {
        metrics::counter!("newnym_total", "node_id" => node_id.to_string()).increment(1);
    }

    fn inc_restart(&self, node_id: &str) {
        metrics::counter!("restarts_total", "node_id" => node_id.to_string()).increment(1);
    }
}
