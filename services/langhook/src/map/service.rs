//! The canonicaliser: raw event in, canonical event (or mapping failure) out.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use lh_protocol::subject::{MAP_FAIL_SUBJECT, event_subject};
use lh_protocol::{Envelope, MappingFailure, RawEvent};
use sqlx::PgPool;
use tracing::{error, info};

use crate::bus::EventBus;
use crate::metrics::Metrics;
use crate::subscriptions::repo;

use super::mapper::MappingEngine;
use super::synth::{SynthesisError, TransformSynthesizer};

pub struct MapService {
    engine: MappingEngine,
    synth: TransformSynthesizer,
    bus: EventBus,
    pool: PgPool,
    metrics: Arc<Metrics>,
}

impl MapService {
    pub fn new(
        engine: MappingEngine,
        synth: TransformSynthesizer,
        bus: EventBus,
        pool: PgPool,
        metrics: Arc<Metrics>,
    ) -> Self {
        MapService {
            engine,
            synth,
            bus,
            pool,
            metrics,
        }
    }

    /// Process one raw event end to end.
    ///
    /// Every failure mode resolves to a mapping-failure record on the
    /// dead-letter subject; this function itself never fails, so the raw
    /// consumer can always ack.
    pub async fn process_raw(&self, raw: &RawEvent) {
        let start = Instant::now();
        let source = raw.source.as_str();
        self.metrics.record_processed(source);

        // Cached transform first; miss or invalid result falls through to
        // synthesis.
        let canonical = match self.engine.apply(source, &raw.payload).await {
            Some(canonical) => canonical,
            None => {
                if !self.synth.is_available() {
                    self.send_failure(raw, "No mapping available and LLM service unavailable")
                        .await;
                    self.metrics.record_failed(source, "no_mapping_no_llm");
                    return;
                }
                self.metrics.record_llm_invocation(source);
                match self.synth.generate(source, &raw.payload).await {
                    Ok((expr, canonical)) => {
                        self.engine.store_mapping(source, &raw.payload, &expr).await;
                        canonical
                    }
                    Err(SynthesisError::Unavailable) => {
                        self.send_failure(raw, "No mapping available and LLM service unavailable")
                            .await;
                        self.metrics.record_failed(source, "no_mapping_no_llm");
                        return;
                    }
                    Err(e) => {
                        error!(source, event_id = %raw.id, error = %e, "transform synthesis failed");
                        self.send_failure(raw, "LLM transform invalid").await;
                        self.metrics.record_failed(source, "llm_transform_invalid");
                        return;
                    }
                }
            }
        };

        let envelope = Envelope::wrap(&raw.id.to_string(), canonical);
        let subject = event_subject(&envelope.data);
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(source, event_id = %raw.id, error = %e, "envelope serialisation failed");
                self.send_failure(raw, "envelope serialisation failed").await;
                self.metrics.record_failed(source, "processing_error");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&subject, payload) {
            error!(source, event_id = %raw.id, error = %e, "canonical publish failed");
            self.send_failure(raw, "canonical publish failed").await;
            self.metrics.record_failed(source, "processing_error");
            return;
        }

        // Registry and event-log writes are best effort; their failures
        // never break canonicalisation.
        repo::register_event_schema(
            &self.pool,
            &envelope.data.publisher,
            &envelope.data.resource.kind,
            envelope.data.action.as_str(),
        )
        .await;
        if let Err(e) = repo::append_event_log(&self.pool, &envelope).await {
            tracing::warn!(event_id = %envelope.id, error = %e, "failed to append event log");
        }

        self.metrics.record_mapped(source);
        let elapsed = start.elapsed();
        self.metrics
            .mapping_duration_seconds
            .with_label_values(&[source])
            .observe(elapsed.as_secs_f64());

        info!(
            event_id = %raw.id,
            source,
            subject = %subject,
            publisher = %envelope.data.publisher,
            resource_type = %envelope.data.resource.kind,
            resource_id = %envelope.data.resource.id,
            action = %envelope.data.action,
            elapsed_ms = elapsed.as_millis() as u64,
            "event mapped"
        );
    }

    async fn send_failure(&self, raw: &RawEvent, message: &str) {
        let failure = MappingFailure {
            id: raw.id,
            timestamp: Utc::now(),
            source: raw.source.clone(),
            error: message.to_owned(),
            payload: raw.payload.clone(),
        };
        match serde_json::to_vec(&failure) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(MAP_FAIL_SUBJECT, payload) {
                    error!(event_id = %raw.id, error = %e, "failed to publish mapping failure");
                }
            }
            Err(e) => error!(event_id = %raw.id, error = %e, "failed to encode mapping failure"),
        }
        info!(
            event_id = %raw.id,
            source = %raw.source,
            error = message,
            "mapping failure recorded"
        );
    }
}
