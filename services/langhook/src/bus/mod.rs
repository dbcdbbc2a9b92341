//! In-process stream bus.
//!
//! A small durable-semantics pub/sub: named streams bound to subject
//! patterns, named pull consumers with filter subjects, explicit acks, and
//! redelivery of un-acked messages after an ack deadline. At-least-once
//! within the process; long-term durability is provided by the event-log
//! tables downstream.
//!
//! Unavailability is a real condition here, not just an error variant:
//!
//! - a stream with consumers retains every message until all of them have
//!   consumed and acked it; once the retention bound fills with messages a
//!   consumer still needs, `publish` reports [`BusError::ServiceUnavailable`]
//!   instead of dropping data (streams with no consumers stay bounded rings
//!   and evict their oldest silently);
//! - after [`EventBus::begin_shutdown`], `fetch` and `publish` report
//!   [`BusError::ServiceUnavailable`] so consumer loops run their
//!   reset/backoff machinery instead of spinning on a closing bus.
//!
//! Locking: each stream guards its state with a plain mutex that is never
//! held across an await. Fetch blocks on a `Notify` with a deadline.

pub mod consume;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use lh_protocol::subject::subject_matches;

/// Default bound on retained messages per stream.
const DEFAULT_MAX_MESSAGES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("stream `{0}` not found")]
    StreamNotFound(String),
    #[error("stream service unavailable")]
    ServiceUnavailable,
}

/// One stored message. Payloads are opaque bytes (JSON in practice).
#[derive(Debug)]
pub struct StoredMessage {
    pub seq: u64,
    pub subject: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct PendingDelivery {
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug)]
struct ConsumerState {
    filter: String,
    /// Next sequence number this consumer has not yet seen.
    cursor: u64,
    pending: HashMap<u64, PendingDelivery>,
}

#[derive(Debug)]
struct StreamState {
    next_seq: u64,
    messages: BTreeMap<u64, Arc<StoredMessage>>,
    consumers: HashMap<String, ConsumerState>,
}

#[derive(Debug)]
struct StreamCore {
    name: String,
    subjects: Vec<String>,
    max_messages: usize,
    state: Mutex<StreamState>,
    notify: Notify,
    draining: Arc<AtomicBool>,
}

/// The bus: a registry of streams.
#[derive(Clone, Default)]
pub struct EventBus {
    streams: Arc<RwLock<HashMap<String, Arc<StreamCore>>>>,
    draining: Arc<AtomicBool>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stream bound to the given subject patterns, or return the
    /// existing one with that name.
    pub fn add_stream(&self, name: &str, subjects: &[&str]) -> Stream {
        self.add_stream_with_capacity(name, subjects, DEFAULT_MAX_MESSAGES)
    }

    /// As [`EventBus::add_stream`], with an explicit retained-message bound.
    pub fn add_stream_with_capacity(
        &self,
        name: &str,
        subjects: &[&str],
        max_messages: usize,
    ) -> Stream {
        let mut streams = self.streams.write().expect("bus lock poisoned");
        let core = streams
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(StreamCore {
                    name: name.to_owned(),
                    subjects: subjects.iter().map(|s| (*s).to_owned()).collect(),
                    max_messages: max_messages.max(1),
                    state: Mutex::new(StreamState {
                        next_seq: 0,
                        messages: BTreeMap::new(),
                        consumers: HashMap::new(),
                    }),
                    notify: Notify::new(),
                    draining: self.draining.clone(),
                })
            })
            .clone();
        Stream { core }
    }

    pub fn get_stream(&self, name: &str) -> Result<Stream, BusError> {
        self.streams
            .read()
            .expect("bus lock poisoned")
            .get(name)
            .cloned()
            .map(|core| Stream { core })
            .ok_or_else(|| BusError::StreamNotFound(name.to_owned()))
    }

    /// Stop serving: subsequent publishes and fetches report
    /// [`BusError::ServiceUnavailable`]. Blocked fetches are woken so they
    /// observe the drain promptly.
    pub fn begin_shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);
        let streams = self.streams.read().expect("bus lock poisoned");
        for core in streams.values() {
            core.notify.notify_waiters();
        }
    }

    /// Publish to every stream whose bound subjects match.
    ///
    /// A stream with consumers never drops a message one of them still
    /// needs: when its retention bound is full of unconsumed messages the
    /// publish is rejected with [`BusError::ServiceUnavailable`] (other
    /// matching streams still receive the message first).
    pub fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(BusError::ServiceUnavailable);
        }
        let cores: Vec<Arc<StreamCore>> = {
            let streams = self.streams.read().expect("bus lock poisoned");
            streams
                .values()
                .filter(|core| core.subjects.iter().any(|s| subject_matches(s, subject)))
                .cloned()
                .collect()
        };
        debug!(subject, streams = cores.len(), "publish");
        let payload = Arc::new(payload);
        let mut saturated = false;
        for core in cores {
            let appended = {
                let mut state = core.state.lock().expect("stream lock poisoned");
                if state.messages.len() >= core.max_messages {
                    evict_consumed(&mut state, core.max_messages);
                }
                if state.messages.len() >= core.max_messages {
                    debug!(stream = %core.name, subject, "stream saturated, publish rejected");
                    saturated = true;
                    false
                } else {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    let message = Arc::new(StoredMessage {
                        seq,
                        subject: subject.to_owned(),
                        payload: payload.as_ref().clone(),
                    });
                    state.messages.insert(seq, message);
                    true
                }
            };
            if appended {
                core.notify.notify_waiters();
            }
        }
        if saturated {
            return Err(BusError::ServiceUnavailable);
        }
        Ok(())
    }
}

/// Evict messages every consumer is past. A message is safe to drop only
/// when each consumer's cursor has moved beyond it and no consumer holds it
/// un-acked; streams with no consumers are plain bounded rings.
fn evict_consumed(state: &mut StreamState, max: usize) {
    let floor = state
        .consumers
        .values()
        .map(|c| {
            let pending_min = c.pending.keys().copied().min().unwrap_or(c.cursor);
            c.cursor.min(pending_min)
        })
        .min();
    while state.messages.len() >= max {
        let Some((&seq, _)) = state.messages.first_key_value() else {
            break;
        };
        match floor {
            Some(floor) if seq >= floor => break,
            _ => {
                state.messages.pop_first();
            }
        }
    }
}

/// Handle to one named stream.
#[derive(Clone, Debug)]
pub struct Stream {
    core: Arc<StreamCore>,
}

impl Stream {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Create or look up a named durable consumer with a filter subject.
    ///
    /// New consumers start at the stream tail. A filter change discards the
    /// old consumer state (cursor and pending set) — callers that change
    /// filters are expected to stop and re-create, which this enforces.
    pub fn durable(&self, name: &str, filter: &str, ack_wait: Duration) -> Consumer {
        let mut state = self.core.state.lock().expect("stream lock poisoned");
        let tail = state.next_seq;
        let existing_matches = state
            .consumers
            .get(name)
            .is_some_and(|c| c.filter == filter);
        if !existing_matches {
            state.consumers.insert(
                name.to_owned(),
                ConsumerState {
                    filter: filter.to_owned(),
                    cursor: tail,
                    pending: HashMap::new(),
                },
            );
        }
        Consumer {
            core: self.core.clone(),
            name: name.to_owned(),
            ack_wait,
        }
    }

    pub fn delete_consumer(&self, name: &str) {
        let mut state = self.core.state.lock().expect("stream lock poisoned");
        state.consumers.remove(name);
    }

    /// Number of messages currently retained (testing/diagnostics).
    pub fn len(&self) -> usize {
        self.core.state.lock().expect("stream lock poisoned").messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A durable pull consumer bound to one stream.
#[derive(Clone)]
pub struct Consumer {
    core: Arc<StreamCore>,
    name: String,
    ack_wait: Duration,
}

/// One delivered message; ack it once handled. Dropping without ack leaves
/// it pending and it will be redelivered after the ack deadline.
pub struct Delivery {
    pub message: Arc<StoredMessage>,
    pub deliveries: u32,
    core: Arc<StreamCore>,
    consumer: String,
}

impl Delivery {
    pub fn ack(&self) {
        let mut state = self.core.state.lock().expect("stream lock poisoned");
        if let Some(consumer) = state.consumers.get_mut(&self.consumer) {
            consumer.pending.remove(&self.message.seq);
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }
}

impl Consumer {
    /// Pull up to `max` messages, waiting up to `wait` for the first one.
    ///
    /// Redeliveries (pending past the ack deadline) are returned before new
    /// messages. Returns an empty batch on timeout, and
    /// [`BusError::ServiceUnavailable`] once the bus is draining.
    pub async fn fetch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, BusError> {
        let deadline = Instant::now() + wait;
        loop {
            if self.core.draining.load(Ordering::SeqCst) {
                return Err(BusError::ServiceUnavailable);
            }
            let notified = self.core.notify.notified();
            tokio::pin!(notified);

            let batch = self.collect(max);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Bounded wait so due redeliveries are picked up promptly even
            // without a publish to wake us.
            let nap = (deadline - now).min(self.ack_wait.min(Duration::from_millis(200)));
            let _ = tokio::time::timeout(nap, &mut notified).await;
        }
    }

    fn collect(&self, max: usize) -> Vec<Delivery> {
        let mut state = self.core.state.lock().expect("stream lock poisoned");
        let state = &mut *state;
        let Some(consumer) = state.consumers.get_mut(&self.name) else {
            return Vec::new();
        };

        let now = Instant::now();
        let mut batch = Vec::new();

        // Due redeliveries first.
        let mut due: Vec<u64> = consumer
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= self.ack_wait)
            .map(|(seq, _)| *seq)
            .collect();
        due.sort_unstable();
        for seq in due {
            if batch.len() >= max {
                break;
            }
            match state.messages.get(&seq) {
                Some(message) => {
                    let pending = consumer.pending.get_mut(&seq).expect("pending entry");
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    batch.push(Delivery {
                        message: message.clone(),
                        deliveries: pending.deliveries,
                        core: self.core.clone(),
                        consumer: self.name.clone(),
                    });
                }
                // Evicted while pending; nothing left to redeliver.
                None => {
                    consumer.pending.remove(&seq);
                }
            }
        }

        // Then new messages past the cursor that match the filter.
        let mut cursor = consumer.cursor;
        for (&seq, message) in state.messages.range(consumer.cursor..) {
            if batch.len() >= max {
                break;
            }
            cursor = seq + 1;
            if !subject_matches(&consumer.filter, &message.subject) {
                continue;
            }
            consumer.pending.insert(
                seq,
                PendingDelivery {
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            batch.push(Delivery {
                message: message.clone(),
                deliveries: 1,
                core: self.core.clone(),
                consumer: self.name.clone(),
            });
        }
        consumer.cursor = cursor.max(consumer.cursor);
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with_events_stream() -> (EventBus, Stream) {
        let bus = EventBus::new();
        let stream = bus.add_stream("events", &["langhook.events.>"]);
        (bus, stream)
    }

    #[tokio::test]
    async fn publish_fetch_ack_round_trip() {
        let (bus, stream) = bus_with_events_stream();
        let consumer = stream.durable("c1", "langhook.events.>", Duration::from_secs(30));

        bus.publish("langhook.events.github.pull_request.1.created", b"one".to_vec())
            .unwrap();
        let batch = consumer.fetch(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload(), b"one");
        assert_eq!(batch[0].deliveries, 1);
        batch[0].ack();

        let empty = consumer.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn filter_subject_limits_what_a_consumer_sees() {
        let (bus, stream) = bus_with_events_stream();
        let consumer = stream.durable(
            "github-only",
            "langhook.events.github.>",
            Duration::from_secs(30),
        );

        bus.publish("langhook.events.stripe.payment_intent.x.updated", b"s".to_vec())
            .unwrap();
        bus.publish("langhook.events.github.issue.1.created", b"g".to_vec())
            .unwrap();

        let batch = consumer.fetch(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject(), "langhook.events.github.issue.1.created");
        batch[0].ack();
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered_after_the_ack_deadline() {
        let (bus, stream) = bus_with_events_stream();
        let consumer = stream.durable("slow", "langhook.events.>", Duration::from_millis(50));

        bus.publish("langhook.events.github.issue.1.created", b"x".to_vec())
            .unwrap();
        let first = consumer.fetch(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].deliveries, 1);
        drop(first); // no ack

        let second = consumer.fetch(10, Duration::from_millis(300)).await.unwrap();
        assert_eq!(second.len(), 1, "expected a redelivery");
        assert_eq!(second[0].deliveries, 2);
        second[0].ack();

        let third = consumer.fetch(10, Duration::from_millis(80)).await.unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn durable_consumers_start_at_the_stream_tail() {
        let (bus, stream) = bus_with_events_stream();
        bus.publish("langhook.events.github.issue.1.created", b"old".to_vec())
            .unwrap();

        let consumer = stream.durable("late", "langhook.events.>", Duration::from_secs(30));
        bus.publish("langhook.events.github.issue.2.created", b"new".to_vec())
            .unwrap();

        let batch = consumer.fetch(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload(), b"new");
        batch[0].ack();
    }

    #[tokio::test]
    async fn durable_state_survives_rebinding_with_the_same_filter() {
        let (bus, stream) = bus_with_events_stream();
        let consumer = stream.durable("d", "langhook.events.>", Duration::from_secs(30));
        bus.publish("langhook.events.github.issue.1.created", b"a".to_vec())
            .unwrap();
        consumer.fetch(10, Duration::from_millis(100)).await.unwrap()[0].ack();

        // Re-bind (same name, same filter): cursor is preserved, nothing
        // is replayed.
        let rebound = stream.durable("d", "langhook.events.>", Duration::from_secs(30));
        let batch = rebound.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn changing_the_filter_resets_the_consumer() {
        let (bus, stream) = bus_with_events_stream();
        let _old = stream.durable("d", "langhook.events.github.>", Duration::from_secs(30));
        bus.publish("langhook.events.stripe.charge.1.created", b"s".to_vec())
            .unwrap();

        // New filter: fresh consumer at the tail; the stripe event published
        // before the re-create is not replayed.
        let replaced = stream.durable("d", "langhook.events.stripe.>", Duration::from_secs(30));
        let batch = replaced.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert!(batch.is_empty());

        bus.publish("langhook.events.stripe.charge.2.created", b"s2".to_vec())
            .unwrap();
        let batch = replaced.fetch(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        batch[0].ack();
    }

    #[tokio::test]
    async fn missing_stream_is_reported() {
        let bus = EventBus::new();
        assert_eq!(
            bus.get_stream("nope").unwrap_err(),
            BusError::StreamNotFound("nope".to_owned())
        );
    }

    #[tokio::test]
    async fn fetch_honours_the_batch_cap() {
        let (bus, stream) = bus_with_events_stream();
        let consumer = stream.durable("c", "langhook.events.>", Duration::from_secs(30));
        for i in 0..5 {
            bus.publish(
                &format!("langhook.events.github.issue.{i}.created"),
                vec![i as u8],
            )
            .unwrap();
        }
        let batch = consumer.fetch(3, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 3);
        for delivery in &batch {
            delivery.ack();
        }
        let rest = consumer.fetch(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(rest.len(), 2);
        for delivery in &rest {
            delivery.ack();
        }
    }

    #[tokio::test]
    async fn saturated_stream_rejects_publishes_until_consumers_catch_up() {
        let bus = EventBus::new();
        let stream = bus.add_stream_with_capacity("events", &["langhook.events.>"], 2);
        let consumer = stream.durable("slow", "langhook.events.>", Duration::from_secs(30));

        bus.publish("langhook.events.github.issue.1.created", b"a".to_vec())
            .unwrap();
        bus.publish("langhook.events.github.issue.2.created", b"b".to_vec())
            .unwrap();
        // The consumer has seen nothing; nothing can be evicted.
        assert_eq!(
            bus.publish("langhook.events.github.issue.3.created", b"c".to_vec()),
            Err(BusError::ServiceUnavailable)
        );

        // Fetched but un-acked messages are still protected.
        let batch = consumer.fetch(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(
            bus.publish("langhook.events.github.issue.3.created", b"c".to_vec()),
            Err(BusError::ServiceUnavailable)
        );

        // Acks move the consumer's horizon; publishing works again.
        for delivery in &batch {
            delivery.ack();
        }
        bus.publish("langhook.events.github.issue.3.created", b"c".to_vec())
            .unwrap();
        let batch = consumer.fetch(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload(), b"c");
        batch[0].ack();
    }

    #[tokio::test]
    async fn streams_without_consumers_stay_bounded_rings() {
        let bus = EventBus::new();
        let stream = bus.add_stream_with_capacity("dlq", &["langhook.map_fail"], 2);
        for i in 0..5u8 {
            bus.publish("langhook.map_fail", vec![i]).unwrap();
        }
        assert_eq!(stream.len(), 2);
    }

    #[tokio::test]
    async fn draining_bus_reports_service_unavailable() {
        let (bus, stream) = bus_with_events_stream();
        let consumer = stream.durable("c", "langhook.events.>", Duration::from_secs(30));
        bus.publish("langhook.events.github.issue.1.created", b"x".to_vec())
            .unwrap();

        bus.begin_shutdown();
        assert!(matches!(
            consumer.fetch(1, Duration::from_secs(5)).await,
            Err(BusError::ServiceUnavailable)
        ));
        assert_eq!(
            bus.publish("langhook.events.github.issue.2.created", b"y".to_vec()),
            Err(BusError::ServiceUnavailable)
        );
    }

    #[tokio::test]
    async fn draining_wakes_a_blocked_fetch() {
        let (bus, stream) = bus_with_events_stream();
        let consumer = stream.durable("c", "langhook.events.>", Duration::from_secs(30));

        let fetcher = tokio::spawn(async move { consumer.fetch(1, Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.begin_shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), fetcher)
            .await
            .expect("fetch should wake on drain")
            .unwrap();
        assert!(matches!(result, Err(BusError::ServiceUnavailable)));
    }

    #[tokio::test]
    async fn fetch_blocks_until_a_publish_arrives() {
        let (bus, stream) = bus_with_events_stream();
        let consumer = stream.durable("c", "langhook.events.>", Duration::from_secs(30));

        let publisher = tokio::spawn({
            let bus = bus.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                bus.publish("langhook.events.github.issue.9.created", b"late".to_vec())
                    .unwrap();
            }
        });

        let batch = consumer.fetch(1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(batch.len(), 1);
        batch[0].ack();
        publisher.await.unwrap();
    }
}
