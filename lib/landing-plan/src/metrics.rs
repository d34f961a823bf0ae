//! Prometheus metrics for resolution and apply

use crate::Result;
use landing_api::Severity;
use landing_core::{Resolution, ResolveError};
use prometheus::{Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Prometheus metrics collector for the resolver
#[derive(Clone)]
pub struct PlanMetrics {
    /// Resolution passes by outcome (resolved, partial, or the halting error kind)
    pub resolutions_total: CounterVec,
    /// Spokes rejected during resolution
    pub rejected_spokes_total: Counter,
    /// Validation findings by severity
    pub diagnostics_total: CounterVec,
    /// Resolution latency in seconds
    pub resolution_duration_seconds: Histogram,
    /// Resources applied by resource type
    pub applied_resources_total: CounterVec,
    /// Retried apply calls
    pub apply_retries_total: Counter,
    pub registry: Arc<Registry>,
}

impl PlanMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let resolutions_total = CounterVec::new(
            Opts::new("landing_resolutions_total", "Resolution passes by outcome"),
            &["outcome"],
        )?;

        let rejected_spokes_total = Counter::new(
            "landing_rejected_spokes_total",
            "Spokes rejected during resolution",
        )?;

        let diagnostics_total = CounterVec::new(
            Opts::new("landing_diagnostics_total", "Validation findings by severity"),
            &["severity"],
        )?;

        let resolution_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "landing_resolution_duration_seconds",
            "Resolution latency in seconds",
        ))?;

        let applied_resources_total = CounterVec::new(
            Opts::new("landing_applied_resources_total", "Resources applied by type"),
            &["resource_type"],
        )?;

        let apply_retries_total = Counter::new(
            "landing_apply_retries_total",
            "Retried apply calls",
        )?;

        registry.register(Box::new(resolutions_total.clone()))?;
        registry.register(Box::new(rejected_spokes_total.clone()))?;
        registry.register(Box::new(diagnostics_total.clone()))?;
        registry.register(Box::new(resolution_duration_seconds.clone()))?;
        registry.register(Box::new(applied_resources_total.clone()))?;
        registry.register(Box::new(apply_retries_total.clone()))?;

        Ok(Self {
            resolutions_total,
            rejected_spokes_total,
            diagnostics_total,
            resolution_duration_seconds,
            applied_resources_total,
            apply_retries_total,
            registry,
        })
    }

    /// Record a completed resolution pass
    pub fn record_resolution(&self, resolution: &Resolution, elapsed: Duration) {
        let outcome = if resolution.failures.is_empty() {
            "resolved"
        } else {
            "partial"
        };
        debug!("Recording {} resolution in {:?}", outcome, elapsed);

        self.resolutions_total.with_label_values(&[outcome]).inc();
        self.rejected_spokes_total.inc_by(resolution.failures.len() as f64);
        for diagnostic in &resolution.diagnostics {
            self.record_diagnostic(diagnostic.severity);
        }
        self.resolution_duration_seconds.observe(elapsed.as_secs_f64());
    }

    /// Record a resolution pass halted by an error
    pub fn record_failure(&self, error: &ResolveError, elapsed: Duration) {
        self.resolutions_total.with_label_values(&[error.kind()]).inc();
        for diagnostic in error.diagnostics() {
            self.record_diagnostic(diagnostic.severity);
        }
        self.resolution_duration_seconds.observe(elapsed.as_secs_f64());
    }

    fn record_diagnostic(&self, severity: Severity) {
        self.diagnostics_total.with_label_values(&[severity.as_str()]).inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
