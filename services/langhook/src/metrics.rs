//! Pipeline metrics: a Prometheus registry for the scrape endpoint plus a
//! small atomic roll-up for the JSON metrics endpoint.
//!
//! The registry is owned by [`Metrics`] and injected where needed — no
//! process-global statics.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

pub struct Metrics {
    registry: Registry,

    pub events_processed: IntCounterVec,
    pub events_mapped: IntCounterVec,
    pub events_failed: IntCounterVec,
    pub llm_invocations: IntCounterVec,
    pub mapping_duration_seconds: HistogramVec,
    pub gate_evaluations: IntCounterVec,
    pub gate_cost_usd: CounterVec,
    pub webhook_attempts: IntCounterVec,

    // Roll-up for /map/metrics/json.
    processed_total: AtomicU64,
    mapped_total: AtomicU64,
    failed_total: AtomicU64,
    llm_total: AtomicU64,
}

/// Snapshot served by `GET /map/metrics/json`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub events_processed: u64,
    pub events_mapped: u64,
    pub events_failed: u64,
    pub llm_invocations: u64,
    pub mapping_success_rate: f64,
    pub llm_usage_rate: f64,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_processed = IntCounterVec::new(
            Opts::new("langhook_events_processed_total", "Raw events consumed"),
            &["source"],
        )
        .expect("metric definition");
        let events_mapped = IntCounterVec::new(
            Opts::new("langhook_events_mapped_total", "Events canonicalised"),
            &["source"],
        )
        .expect("metric definition");
        let events_failed = IntCounterVec::new(
            Opts::new("langhook_events_failed_total", "Canonicalisation failures"),
            &["source", "reason"],
        )
        .expect("metric definition");
        let llm_invocations = IntCounterVec::new(
            Opts::new("langhook_llm_invocations_total", "Transform synthesis calls"),
            &["source"],
        )
        .expect("metric definition");
        let mapping_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "langhook_mapping_duration_seconds",
                "Raw event processing time",
            ),
            &["source"],
        )
        .expect("metric definition");
        let gate_evaluations = IntCounterVec::new(
            Opts::new("langhook_gate_evaluations_total", "LLM gate evaluations"),
            &["subscription_id", "decision", "model", "failover_reason"],
        )
        .expect("metric definition");
        let gate_cost_usd = CounterVec::new(
            Opts::new(
                "langhook_gate_llm_cost_usd_total",
                "Estimated LLM cost for gate evaluations",
            ),
            &["subscription_id", "model"],
        )
        .expect("metric definition");
        let webhook_attempts = IntCounterVec::new(
            Opts::new("langhook_webhook_attempts_total", "Webhook delivery attempts"),
            &["status"],
        )
        .expect("metric definition");

        for collector in [
            Box::new(events_processed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(events_mapped.clone()),
            Box::new(events_failed.clone()),
            Box::new(llm_invocations.clone()),
            Box::new(mapping_duration_seconds.clone()),
            Box::new(gate_evaluations.clone()),
            Box::new(gate_cost_usd.clone()),
            Box::new(webhook_attempts.clone()),
        ] {
            registry.register(collector).expect("metric registration");
        }

        Metrics {
            registry,
            events_processed,
            events_mapped,
            events_failed,
            llm_invocations,
            mapping_duration_seconds,
            gate_evaluations,
            gate_cost_usd,
            webhook_attempts,
            processed_total: AtomicU64::new(0),
            mapped_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            llm_total: AtomicU64::new(0),
        }
    }

    pub fn record_processed(&self, source: &str) {
        self.events_processed.with_label_values(&[source]).inc();
        self.processed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mapped(&self, source: &str) {
        self.events_mapped.with_label_values(&[source]).inc();
        self.mapped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self, source: &str, reason: &str) {
        self.events_failed.with_label_values(&[source, reason]).inc();
        self.failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_llm_invocation(&self, source: &str) {
        self.llm_invocations.with_label_values(&[source]).inc();
        self.llm_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Prometheus text exposition for `GET /map/metrics`.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.processed_total.load(Ordering::Relaxed);
        let mapped = self.mapped_total.load(Ordering::Relaxed);
        let failed = self.failed_total.load(Ordering::Relaxed);
        let llm = self.llm_total.load(Ordering::Relaxed);
        let rate = |n: u64| {
            if processed == 0 {
                0.0
            } else {
                n as f64 / processed as f64
            }
        };
        MetricsSnapshot {
            events_processed: processed,
            events_mapped: mapped,
            events_failed: failed,
            llm_invocations: llm,
            mapping_success_rate: rate(mapped),
            llm_usage_rate: rate(llm),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
