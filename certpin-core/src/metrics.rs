use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// Prometheus collectors for proxy sessions.
#[derive(Clone)]
pub struct ProxyMetrics {
    pub(crate) connections_total: IntCounterVec,
    pub(crate) connections_active: IntGauge,
    pub(crate) sessions_bridged: IntCounterVec,
    pub(crate) bytes_transferred: IntCounterVec,
    pub(crate) pin_mismatches: IntCounterVec,
    pub(crate) errors_total: IntCounterVec,
    pub(crate) session_duration: HistogramVec,
}

impl ProxyMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connections_total = IntCounterVec::new(
            Opts::new(
                "certpin_connections_total",
                "Total number of connections handled",
            ),
            &["mode", "status"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = IntGauge::new(
            "certpin_connections_active",
            "Number of currently active connections",
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        let sessions_bridged = IntCounterVec::new(
            Opts::new(
                "certpin_sessions_bridged_total",
                "Sessions that passed verification and started bridging",
            ),
            &["host"],
        )?;
        registry.register(Box::new(sessions_bridged.clone()))?;

        let bytes_transferred = IntCounterVec::new(
            Opts::new(
                "certpin_bytes_transferred_total",
                "Total bytes transferred per host and direction",
            ),
            &["host", "direction"],
        )?;
        registry.register(Box::new(bytes_transferred.clone()))?;

        let pin_mismatches = IntCounterVec::new(
            Opts::new(
                "certpin_pin_mismatches_total",
                "Upstream certificates rejected by the pin check",
            ),
            &["host"],
        )?;
        registry.register(Box::new(pin_mismatches.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("certpin_errors_total", "Total number of errors by type"),
            &["error_type"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let session_duration = HistogramVec::new(
            HistogramOpts::new(
                "certpin_session_duration_seconds",
                "Connection duration in seconds",
            )
            .buckets(vec![
                0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
            ]),
            &["mode"],
        )?;
        registry.register(Box::new(session_duration.clone()))?;

        Ok(Self {
            connections_total,
            connections_active,
            sessions_bridged,
            bytes_transferred,
            pin_mismatches,
            errors_total,
            session_duration,
        })
    }

    /// Counters for the `tx` (client to upstream) and `rx` directions of `host`.
    pub(crate) fn byte_counters(&self, host: &str) -> (IntCounter, IntCounter) {
        (
            self.bytes_transferred.with_label_values(&[host, "tx"]),
            self.bytes_transferred.with_label_values(&[host, "rx"]),
        )
    }

    pub fn bridged_sessions(&self, host: &str) -> u64 {
        self.sessions_bridged.with_label_values(&[host]).get()
    }

    pub fn pin_mismatches(&self, host: &str) -> u64 {
        self.pin_mismatches.with_label_values(&[host]).get()
    }

    /// Finished connections for a listener mode (`sni` or `forward`) and
    /// status (`success`, `failure`, `rejected` or `aborted`).
    pub fn connections(&self, mode: &str, status: &str) -> u64 {
        self.connections_total.with_label_values(&[mode, status]).get()
    }

    pub fn errors(&self, error_type: &str) -> u64 {
        self.errors_total.with_label_values(&[error_type]).get()
    }

    pub fn active_connections(&self) -> i64 {
        self.connections_active.get()
    }
}
