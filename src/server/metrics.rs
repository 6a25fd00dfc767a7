//! Prometheus metrics for the release updater
//!
//! Exposed on `/metrics` by the health server:
//! - `kulta_updater_release_blocked{release,reason}` - 1 while a release is hard-locked
//! - `kulta_updater_release_waiting_manual{release}` - 1 while a release awaits approval
//! - `kulta_updater_pending_manual_releases` - releases awaiting manual approval
//! - `kulta_updater_reconciliations_total{result}` - reconcile outcomes
//! - `kulta_updater_reconciliation_duration_seconds` - reconcile latency

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Reason label values for `kulta_updater_release_blocked`
pub const BLOCKED_REQUIREMENT: &str = "requirement";
pub const BLOCKED_DISRUPTION: &str = "disruption";

pub struct ControllerMetrics {
    registry: Registry,
    release_blocked: IntGaugeVec,
    release_waiting_manual: IntGaugeVec,
    pending_manual_releases: IntGauge,
    reconciliations_total: IntCounterVec,
    reconciliation_duration: Histogram,
}

pub type SharedMetrics = Arc<ControllerMetrics>;

impl ControllerMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let release_blocked = IntGaugeVec::new(
            Opts::new(
                "kulta_updater_release_blocked",
                "Release is blocked by a requirement or disruption lock",
            ),
            &["release", "reason"],
        )?;
        registry.register(Box::new(release_blocked.clone()))?;

        let release_waiting_manual = IntGaugeVec::new(
            Opts::new(
                "kulta_updater_release_waiting_manual",
                "Release is waiting for manual approval",
            ),
            &["release"],
        )?;
        registry.register(Box::new(release_waiting_manual.clone()))?;

        let pending_manual_releases = IntGauge::new(
            "kulta_updater_pending_manual_releases",
            "Number of pending releases waiting for manual approval",
        )?;
        registry.register(Box::new(pending_manual_releases.clone()))?;

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "kulta_updater_reconciliations_total",
                "Total reconciliations by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconciliation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "kulta_updater_reconciliation_duration_seconds",
                "Duration of release reconciliations",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(reconciliation_duration.clone()))?;

        Ok(Self {
            registry,
            release_blocked,
            release_waiting_manual,
            pending_manual_releases,
            reconciliations_total,
            reconciliation_duration,
        })
    }

    pub fn set_release_blocked(&self, release: &str, reason: &str, blocked: bool) {
        self.release_blocked
            .with_label_values(&[release, reason])
            .set(i64::from(blocked));
    }

    pub fn set_release_waiting_manual(&self, release: &str, waiting: bool) {
        self.release_waiting_manual
            .with_label_values(&[release])
            .set(i64::from(waiting));
    }

    pub fn set_pending_manual_releases(&self, count: usize) {
        self.pending_manual_releases
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn record_reconciliation(&self, result: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&[result])
            .inc();
        self.reconciliation_duration.observe(duration_secs);
    }

    pub fn record_reconciliation_error(&self) {
        self.reconciliations_total
            .with_label_values(&["error"])
            .inc();
    }

    /// Render the registry in Prometheus text format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

pub fn create_metrics() -> Result<SharedMetrics, MetricsError> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
