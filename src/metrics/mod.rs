//! Prometheus metrics for the gridwire driver
//!
//! Counters live in a process-wide registry; `gather()` renders them in the
//! text exposition format for whatever exporter the application runs.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// gridwire metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Transport metrics
    /// Currently open node sockets
    pub active_sessions: IntGauge,
    /// Statements written, by statement name
    pub statements_sent: IntCounterVec,
    /// Statement round-trip latency (in seconds)
    pub statement_latency: Histogram,
    /// Failed statements by error kind
    pub remote_errors: IntCounterVec,

    // Heartbeat metrics
    /// Heartbeat probes sent while waiting for a response head
    pub heartbeats_sent: IntCounter,
    /// Cancel frames delivered to a node
    pub cancel_requests: IntCounter,

    // Failover metrics
    /// Sessions re-established after a connection failure
    pub reconnects: IntCounter,
    /// Attempts retried after a connection or routing failure
    pub failover_retries: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        // Transport metrics
        let active_sessions = IntGauge::new(
            "gridwire_active_sessions",
            "Current number of open node sockets",
        )
        .unwrap();

        let statements_sent = IntCounterVec::new(
            Opts::new("gridwire_statements_sent_total", "Total number of statements sent"),
            &["statement"], // CONNECT, LOGIN, SQL_EXECUTE, etc.
        )
        .unwrap();

        let statement_latency = Histogram::with_opts(
            HistogramOpts::new(
                "gridwire_statement_duration_seconds",
                "Statement round-trip latency in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                60.0,
            ]),
        )
        .unwrap();

        let remote_errors = IntCounterVec::new(
            Opts::new("gridwire_statement_errors_total", "Total number of failed statements"),
            &["kind"], // connection, statement, wrong_node, etc.
        )
        .unwrap();

        // Heartbeat metrics
        let heartbeats_sent = IntCounter::new(
            "gridwire_heartbeats_sent_total",
            "Total number of heartbeat probes sent",
        )
        .unwrap();

        let cancel_requests = IntCounter::new(
            "gridwire_cancel_requests_total",
            "Total number of cancel requests sent",
        )
        .unwrap();

        // Failover metrics
        let reconnects = IntCounter::new(
            "gridwire_reconnects_total",
            "Total number of sessions re-established by failover",
        )
        .unwrap();

        let failover_retries = IntCounterVec::new(
            Opts::new("gridwire_failover_retries_total", "Total number of failover retries"),
            &["reason"], // connection, wrong_node
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(active_sessions.clone()))
            .unwrap();
        registry
            .register(Box::new(statements_sent.clone()))
            .unwrap();
        registry
            .register(Box::new(statement_latency.clone()))
            .unwrap();
        registry
            .register(Box::new(remote_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(heartbeats_sent.clone()))
            .unwrap();
        registry
            .register(Box::new(cancel_requests.clone()))
            .unwrap();
        registry.register(Box::new(reconnects.clone())).unwrap();
        registry
            .register(Box::new(failover_retries.clone()))
            .unwrap();

        Self {
            registry,
            active_sessions,
            statements_sent,
            statement_latency,
            remote_errors,
            heartbeats_sent,
            cancel_requests,
            reconnects,
            failover_retries,
        }
    }

    /// Record a failover retry
    pub fn record_failover_retry(&self, reason: &str) {
        self.failover_retries.with_label_values(&[reason]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
