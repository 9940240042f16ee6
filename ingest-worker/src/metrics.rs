//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `worker_bundles_processed_total` - Messages processed
//! - `worker_bundles_success_total` - Messages imported successfully
//! - `worker_bundles_failed_total{reason}` - Failed attempts by failure class
//! - `worker_bundles_processing_seconds` - Processing time per message

use crate::retry::FailureClass;
use crate::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Sink for the signals emitted while processing messages
pub trait MetricsSink: Send + Sync {
    /// One message went through the processor
    fn record_processed(&self);

    /// One message was imported successfully
    fn record_success(&self);

    /// One attempt failed with the given class
    fn record_failure(&self, class: FailureClass);

    /// Time spent on one message, retries included
    fn record_duration(&self, duration: Duration);
}

/// Prometheus-backed metrics with a private registry
#[derive(Clone)]
pub struct PrometheusMetrics {
    /// Messages processed
    pub processed_total: IntCounter,

    /// Messages imported successfully
    pub success_total: IntCounter,

    /// Failed attempts by reason
    pub failed_total: IntCounterVec,

    /// Processing duration
    pub processing_seconds: Histogram,

    registry: Registry,
}

impl PrometheusMetrics {
    /// Create new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let processed_total = IntCounter::with_opts(Opts::new(
            "worker_bundles_processed_total",
            "Number of bundles processed",
        ))?;
        registry.register(Box::new(processed_total.clone()))?;

        let success_total = IntCounter::with_opts(Opts::new(
            "worker_bundles_success_total",
            "Number of bundles successfully processed",
        ))?;
        registry.register(Box::new(success_total.clone()))?;

        let failed_total = IntCounterVec::new(
            Opts::new(
                "worker_bundles_failed_total",
                "Number of bundle processing failures by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(failed_total.clone()))?;

        let processing_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "worker_bundles_processing_seconds",
                "Processing time of bundles",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;
        registry.register(Box::new(processing_seconds.clone()))?;

        Ok(Self {
            processed_total,
            success_total,
            failed_total,
            processing_seconds,
            registry,
        })
    }

    /// Failure count for one class
    pub fn failures(&self, class: FailureClass) -> u64 {
        self.failed_total
            .with_label_values(&[class.metric_label()])
            .get()
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the text exposition format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_processed(&self) {
        self.processed_total.inc();
    }

    fn record_success(&self) {
        self.success_total.inc();
    }

    fn record_failure(&self, class: FailureClass) {
        self.failed_total
            .with_label_values(&[class.metric_label()])
            .inc();
    }

    fn record_duration(&self, duration: Duration) {
        self.processing_seconds.observe(duration.as_secs_f64());
    }
}
