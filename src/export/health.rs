use anyhow::Result;
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};

use crate::catalog::NAMESPACE;

/// Prometheus metrics for the exporter's own health, served from the same
/// `/metrics` endpoint as the instrumentation families.
pub struct HealthMetrics {
    registry: Registry,

    /// Total samples received from attachment backends.
    pub samples_received: Counter,
    /// Total samples dropped because a shard channel was full.
    pub samples_dropped: Counter,
    /// Total malformed or unresolvable samples dropped at decode.
    pub sample_decode_errors: Counter,
    /// Attach attempts that ended in the failed state, by reason.
    pub attach_failures: CounterVec,
    /// Number of currently active attachments.
    pub attachments_active: Gauge,
    /// Number of target processes currently tracked by discovery.
    pub pids_tracked: Gauge,
    /// Discovery scans that failed and were deferred to the next tick.
    pub discovery_errors: Counter,
    /// Duration of one discovery reconciliation pass.
    pub discovery_duration: Histogram,
}

impl HealthMetrics {
    /// Creates the health metrics and registers them with a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let samples_received = Counter::with_opts(
            Opts::new(
                "samples_received_total",
                "Total samples received from attachment backends.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_dropped = Counter::with_opts(
            Opts::new(
                "samples_dropped_total",
                "Total samples dropped because a collector shard was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let sample_decode_errors = Counter::with_opts(
            Opts::new(
                "sample_decode_errors_total",
                "Total malformed samples dropped at decode.",
            )
            .namespace(NAMESPACE),
        )?;
        let attach_failures = CounterVec::new(
            Opts::new(
                "attach_failures_total",
                "Total attach attempts that ended in the failed state, by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let attachments_active = Gauge::with_opts(
            Opts::new(
                "attachments_active",
                "Number of currently active attachments.",
            )
            .namespace(NAMESPACE),
        )?;
        let pids_tracked = Gauge::with_opts(
            Opts::new(
                "pids_tracked",
                "Number of target processes currently tracked by discovery.",
            )
            .namespace(NAMESPACE),
        )?;
        let discovery_errors = Counter::with_opts(
            Opts::new(
                "discovery_errors_total",
                "Total discovery scans that failed and were retried on the next tick.",
            )
            .namespace(NAMESPACE),
        )?;
        let discovery_duration = Histogram::with_opts(
            HistogramOpts::new(
                "discovery_duration_seconds",
                "Time to complete one discovery reconciliation pass.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(samples_received.clone()))?;
        registry.register(Box::new(samples_dropped.clone()))?;
        registry.register(Box::new(sample_decode_errors.clone()))?;
        registry.register(Box::new(attach_failures.clone()))?;
        registry.register(Box::new(attachments_active.clone()))?;
        registry.register(Box::new(pids_tracked.clone()))?;
        registry.register(Box::new(discovery_errors.clone()))?;
        registry.register(Box::new(discovery_duration.clone()))?;

        Ok(Self {
            registry,
            samples_received,
            samples_dropped,
            sample_decode_errors,
            attach_failures,
            attachments_active,
            pids_tracked,
            discovery_errors,
            discovery_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
