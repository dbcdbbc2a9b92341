//! The raw consumer: pulls raw events and feeds them to the canonicaliser.

use std::sync::Arc;

use lh_protocol::RawEvent;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::consume::{BackoffPolicy, ErrorAction, FetchErrorPolicy, bind_with_retry};
use crate::bus::{BusError, EventBus};
use crate::config::ConsumerSettings;
use crate::streams::RAW_STREAM;

use super::MapService;

const DURABLE_NAME: &str = "canonicaliser";

/// Run the raw-event pull loop until shutdown.
///
/// Startup retries stream-not-found with backoff up to the configured cap
/// and then propagates the error so the process fails loudly.
pub async fn run(
    bus: EventBus,
    settings: ConsumerSettings,
    raw_subject: String,
    service: Arc<MapService>,
    shutdown: CancellationToken,
) -> Result<(), BusError> {
    let backoff = BackoffPolicy {
        base: settings.base_backoff,
        max: settings.max_backoff,
    };
    let stream = bind_with_retry(
        || async { bus.get_stream(RAW_STREAM) },
        settings.bind_max_attempts,
        backoff,
    )
    .await?;

    let mut consumer = stream.durable(DURABLE_NAME, &raw_subject, settings.ack_wait);
    let mut policy = FetchErrorPolicy::new(settings.error_threshold, backoff);
    info!(stream = RAW_STREAM, durable = DURABLE_NAME, "raw consumer started");

    loop {
        let fetched = tokio::select! {
            () = shutdown.cancelled() => break,
            fetched = consumer.fetch(settings.batch_size, settings.fetch_wait) => fetched,
        };

        match fetched {
            Ok(batch) => {
                policy.on_success();
                for delivery in batch {
                    match serde_json::from_slice::<RawEvent>(delivery.payload()) {
                        Ok(raw) => {
                            // One event at a time; process_raw never fails.
                            service.process_raw(&raw).await;
                            delivery.ack();
                        }
                        Err(e) => {
                            // Poison message: redelivering it cannot help.
                            warn!(error = %e, "undecodable raw event dropped");
                            delivery.ack();
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "raw fetch failed");
                if let ErrorAction::Reset(delay) = policy.on_error() {
                    warn!(delay_ms = delay.as_millis() as u64, "resetting raw consumer");
                    tokio::time::sleep(delay).await;
                    consumer = stream.durable(DURABLE_NAME, &raw_subject, settings.ack_wait);
                }
            }
        }
    }

    info!("raw consumer stopped");
    Ok(())
}
