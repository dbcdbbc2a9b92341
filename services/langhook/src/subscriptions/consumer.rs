//! One worker per active subscription, bound to the canonical stream.

use lh_protocol::Envelope;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::consume::{BackoffPolicy, ErrorAction, FetchErrorPolicy, bind_with_retry};
use crate::bus::Delivery;
use crate::streams::EVENTS_STREAM;

use super::gate::{GateConfig, GateEvaluator};
use super::repo::{self, DeliveryRecord, SubscriptionRow};
use super::supervisor::WorkerDeps;
use super::webhook::WebhookChannel;

/// Durable consumer name for a subscription.
pub fn durable_name(subscription_id: i32) -> String {
    format!("sub-{subscription_id}")
}

pub struct SubscriptionWorker {
    sub: SubscriptionRow,
    deps: WorkerDeps,
    cancel: CancellationToken,
    retire_tx: mpsc::UnboundedSender<i32>,
}

enum Outcome {
    Continue,
    /// One-shot subscription spent; stop this worker.
    Retire,
}

impl SubscriptionWorker {
    pub fn new(
        sub: SubscriptionRow,
        deps: WorkerDeps,
        cancel: CancellationToken,
        retire_tx: mpsc::UnboundedSender<i32>,
    ) -> Self {
        SubscriptionWorker {
            sub,
            deps,
            cancel,
            retire_tx,
        }
    }

    pub async fn run(self) {
        let settings = &self.deps.settings.consumer;
        let backoff = BackoffPolicy {
            base: settings.base_backoff,
            max: settings.max_backoff,
        };
        let stream = match bind_with_retry(
            || async { self.deps.bus.get_stream(EVENTS_STREAM) },
            settings.bind_max_attempts,
            backoff,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!(subscription_id = self.sub.id, error = %e, "worker could not bind stream");
                return;
            }
        };

        let durable = durable_name(self.sub.id);
        let mut consumer = stream.durable(&durable, &self.sub.pattern, settings.ack_wait);
        let mut policy = FetchErrorPolicy::new(settings.error_threshold, backoff);
        let evaluator = GateEvaluator::new(
            self.deps.chat.clone(),
            self.deps.metrics.clone(),
            self.deps.budget.clone(),
        );
        info!(
            subscription_id = self.sub.id,
            pattern = %self.sub.pattern,
            "subscription consumer started"
        );

        'outer: loop {
            let fetched = tokio::select! {
                () = self.cancel.cancelled() => break,
                fetched = consumer.fetch(settings.batch_size, settings.fetch_wait) => fetched,
            };

            match fetched {
                Ok(batch) => {
                    policy.on_success();
                    for delivery in batch {
                        match self.handle(&delivery, &evaluator).await {
                            Outcome::Continue => {}
                            Outcome::Retire => break 'outer,
                        }
                    }
                }
                Err(e) => {
                    error!(subscription_id = self.sub.id, error = %e, "fetch failed");
                    if let ErrorAction::Reset(delay) = policy.on_error() {
                        warn!(
                            subscription_id = self.sub.id,
                            delay_ms = delay.as_millis() as u64,
                            "resetting subscription consumer"
                        );
                        tokio::time::sleep(delay).await;
                        consumer = stream.durable(&durable, &self.sub.pattern, settings.ack_wait);
                    }
                }
            }
        }

        info!(subscription_id = self.sub.id, "subscription consumer stopped");
    }

    async fn handle(&self, delivery: &Delivery, evaluator: &GateEvaluator) -> Outcome {
        let envelope: Envelope = match serde_json::from_slice(delivery.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Poison message: acked so it cannot wedge the consumer.
                warn!(subscription_id = self.sub.id, error = %e, "undecodable envelope dropped");
                delivery.ack();
                return Outcome::Continue;
            }
        };

        // Gate, if enabled. A blocked event is logged and acked; no webhook.
        let mut gate_passed = None;
        let mut gate_reason = None;
        if let Some(config) = GateConfig::from_json(self.sub.gate.as_ref()) {
            let decision = evaluator
                .evaluate(&envelope.data, &config, &self.sub.description, self.sub.id)
                .await;
            gate_passed = Some(decision.passed);
            gate_reason = Some(decision.reason);
            if !decision.passed {
                self.log_delivery(
                    &envelope,
                    &DeliveryRecord {
                        subscription_id: self.sub.id,
                        webhook_sent: false,
                        webhook_response_status: None,
                        gate_passed,
                        gate_reason,
                    },
                )
                .await;
                delivery.ack();
                return Outcome::Continue;
            }
        }

        // One webhook attempt; transport errors surface as a null status.
        let channel = WebhookChannel::from_config(
            self.sub.channel_type.as_deref(),
            self.sub.channel_config.as_deref(),
        );
        let mut webhook_sent = false;
        let mut status: Option<u16> = None;
        if let Some(channel) = &channel {
            let body = serde_json::to_value(&envelope).unwrap_or(serde_json::Value::Null);
            webhook_sent = true;
            status = self.deps.webhooks.deliver(channel, &body).await;
            let label = status.map_or_else(|| "error".to_owned(), |s| s.to_string());
            self.deps
                .metrics
                .webhook_attempts
                .with_label_values(&[&label])
                .inc();
        }

        self.log_delivery(
            &envelope,
            &DeliveryRecord {
                subscription_id: self.sub.id,
                webhook_sent,
                webhook_response_status: status.map(i32::from),
                gate_passed,
                gate_reason,
            },
        )
        .await;
        delivery.ack();

        // One-shot retirement after a successful delivery.
        let delivered_ok = status.is_some_and(|s| (200..300).contains(&s));
        if self.sub.disposable && delivered_ok {
            if let Err(e) = repo::mark_used(&self.deps.pool, self.sub.id).await {
                error!(subscription_id = self.sub.id, error = %e, "failed to mark subscription used");
            }
            let _ = self.retire_tx.send(self.sub.id);
            info!(subscription_id = self.sub.id, "disposable subscription retired");
            return Outcome::Retire;
        }
        Outcome::Continue
    }

    /// Delivery outcomes are recorded best-effort; a log failure does not
    /// trigger a second webhook attempt.
    async fn log_delivery(&self, envelope: &Envelope, record: &DeliveryRecord) {
        if let Err(e) = repo::append_subscription_event_log(&self.deps.pool, envelope, record).await
        {
            warn!(
                subscription_id = self.sub.id,
                event_id = %envelope.id,
                error = %e,
                "failed to append subscription event log"
            );
        }
    }
}
