use prometheus::{Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub proofs_submitted: IntCounter,
    pub change_requests_opened: IntCounter,
    pub change_responses_posted: IntCounter,
    pub milestones_approved: IntCounter,
    pub payments_released: IntCounter,
    pub payments_failed: IntCounter,
    pub payments_reconciled: IntCounter,
    pub release_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let proofs_submitted =
            IntCounter::new("tranche_proofs_submitted_total", "Proofs accepted").unwrap();
        let change_requests_opened = IntCounter::new(
            "tranche_change_requests_opened_total",
            "Change requests opened",
        )
        .unwrap();
        let change_responses_posted = IntCounter::new(
            "tranche_change_responses_total",
            "Vendor change responses posted",
        )
        .unwrap();
        let milestones_approved =
            IntCounter::new("tranche_milestones_approved_total", "Milestones approved").unwrap();
        let payments_released =
            IntCounter::new("tranche_payments_released_total", "Payments released").unwrap();
        let payments_failed =
            IntCounter::new("tranche_payments_failed_total", "Release attempts failed").unwrap();
        let payments_reconciled = IntCounter::new(
            "tranche_payments_reconciled_total",
            "Payments healed by reconciliation",
        )
        .unwrap();
        let release_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tranche_release_duration_seconds",
                "End-to-end payment release latency",
            )
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )
        .unwrap();

        registry
            .register(Box::new(proofs_submitted.clone()))
            .unwrap();
        registry
            .register(Box::new(change_requests_opened.clone()))
            .unwrap();
        registry
            .register(Box::new(change_responses_posted.clone()))
            .unwrap();
        registry
            .register(Box::new(milestones_approved.clone()))
            .unwrap();
        registry
            .register(Box::new(payments_released.clone()))
            .unwrap();
        registry.register(Box::new(payments_failed.clone())).unwrap();
        registry
            .register(Box::new(payments_reconciled.clone()))
            .unwrap();
        registry
            .register(Box::new(release_duration.clone()))
            .unwrap();

        Self {
            registry: Arc::new(registry),
            proofs_submitted,
            change_requests_opened,
            change_responses_posted,
            milestones_approved,
            payments_released,
            payments_failed,
            payments_reconciled,
            release_duration,
        }
    }

    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
