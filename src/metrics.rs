//! Prometheus metrics for the submission pipeline.
//!
//! - **Counters**: submissions by outcome, attachments staged, audit writes by status
//! - **Gauges**: sends waiting in the dispatch queue
//! - **Histograms**: dispatch duration by outcome
//!
//! Labels are low-cardinality tags only; submitter identities never become labels.

use std::time::Duration;

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, IntCounter, Opts, Registry, TextEncoder};

use crate::error::Result;

/// Prometheus metrics registry for the submission service.
#[derive(Clone)]
pub struct FieldlogMetrics {
    registry: Registry,

    dispatch_queue_depth: Gauge,

    submissions_total: CounterVec,
    attachments_staged_total: IntCounter,
    audit_writes_total: CounterVec,

    dispatch_duration_seconds: HistogramVec,
}

impl FieldlogMetrics {
    /// Create the metrics and register them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric fails to register (e.g., duplicate registration).
    pub fn new(registry: Registry) -> Result<Self> {
        let dispatch_queue_depth = Gauge::with_opts(Opts::new(
            "fieldlog_dispatch_queue_depth",
            "Number of messages waiting for a relay connection",
        ))
        .map_err(|e| anyhow::anyhow!("Failed to create dispatch_queue_depth gauge: {}", e))?;

        let submissions_total = CounterVec::new(
            Opts::new(
                "fieldlog_submissions_total",
                "Total number of submissions by outcome",
            ),
            &["outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create submissions_total counter: {}", e))?;

        let attachments_staged_total = IntCounter::with_opts(Opts::new(
            "fieldlog_attachments_staged_total",
            "Total number of attachment files written to staging",
        ))
        .map_err(|e| anyhow::anyhow!("Failed to create attachments_staged_total counter: {}", e))?;

        let audit_writes_total = CounterVec::new(
            Opts::new(
                "fieldlog_audit_writes_total",
                "Total number of audit writes by status",
            ),
            &["status"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create audit_writes_total counter: {}", e))?;

        let dispatch_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "fieldlog_dispatch_duration_seconds",
                "Time from queueing a message to its dispatch outcome",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 40.0, 60.0, 120.0]),
            &["outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create dispatch_duration_seconds histogram: {}", e))?;

        registry
            .register(Box::new(dispatch_queue_depth.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register dispatch_queue_depth: {}", e))?;
        registry
            .register(Box::new(submissions_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register submissions_total: {}", e))?;
        registry
            .register(Box::new(attachments_staged_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register attachments_staged_total: {}", e))?;
        registry
            .register(Box::new(audit_writes_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register audit_writes_total: {}", e))?;
        registry
            .register(Box::new(dispatch_duration_seconds.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register dispatch_duration_seconds: {}", e))?;

        Ok(Self {
            registry,
            dispatch_queue_depth,
            submissions_total,
            attachments_staged_total,
            audit_writes_total,
            dispatch_duration_seconds,
        })
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
        String::from_utf8(buffer)
            .map_err(|e| anyhow::anyhow!("Metrics output is not UTF-8: {}", e).into())
    }

    /// Record a finished submission.
    ///
    /// `outcome` is "sent", "rejected" or the kind of the failure.
    pub fn record_submission(&self, outcome: &str) {
        self.submissions_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_attachments_staged(&self, count: usize) {
        self.attachments_staged_total.inc_by(count as u64);
    }

    pub fn set_dispatch_queue_depth(&self, depth: usize) {
        self.dispatch_queue_depth.set(depth as f64);
    }

    /// Record a dispatch outcome and how long it took, queue wait included.
    pub fn record_dispatch(&self, outcome: &str, duration: Duration) {
        self.dispatch_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
    }

    /// Record an audit write; `status` is "written" or "failed".
    pub fn record_audit_write(&self, status: &str) {
        self.audit_writes_total.with_label_values(&[status]).inc();
    }
}
