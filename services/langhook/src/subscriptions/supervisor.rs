//! Consumer supervisor: keeps the running worker set in sync with the
//! subscription store.
//!
//! The supervisor owns a mutex-guarded `id → handle` map and is its only
//! writer. API handlers call `add`/`update`/`remove` before returning to the
//! client; `reload` reconciles against the store at startup and on a
//! periodic interval so the set converges after crashes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::Settings;
use crate::llm::ChatModel;
use crate::metrics::Metrics;
use crate::streams::EVENTS_STREAM;

use super::budget::BudgetMonitor;
use super::consumer::{SubscriptionWorker, durable_name};
use super::repo::{self, SubscriptionRow};
use super::webhook::WebhookSink;

/// Everything a subscription worker needs, injected at construction.
#[derive(Clone)]
pub struct WorkerDeps {
    pub pool: PgPool,
    pub bus: EventBus,
    pub chat: Arc<ChatModel>,
    pub metrics: Arc<Metrics>,
    pub settings: Arc<Settings>,
    pub webhooks: WebhookSink,
    pub budget: Arc<BudgetMonitor>,
}

struct ConsumerHandle {
    pattern: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    deps: WorkerDeps,
    consumers: Mutex<HashMap<i32, ConsumerHandle>>,
    retire_tx: mpsc::UnboundedSender<i32>,
}

impl Supervisor {
    /// Build the supervisor plus the retire channel receiver that
    /// [`Supervisor::start_background`] consumes.
    pub fn new(deps: WorkerDeps) -> (Arc<Self>, mpsc::UnboundedReceiver<i32>) {
        let (retire_tx, retire_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Supervisor {
            deps,
            consumers: Mutex::new(HashMap::new()),
            retire_tx,
        });
        (supervisor, retire_rx)
    }

    /// Start a consumer for a subscription, unless it is inactive or a
    /// spent one-shot. An existing consumer for the same id is replaced.
    pub async fn add(&self, sub: SubscriptionRow) {
        if !sub.is_routable() {
            return;
        }
        let mut consumers = self.consumers.lock().await;
        if let Some(existing) = consumers.remove(&sub.id) {
            existing.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let worker = SubscriptionWorker::new(
            sub.clone(),
            self.deps.clone(),
            cancel.clone(),
            self.retire_tx.clone(),
        );
        let task = tokio::spawn(worker.run());
        consumers.insert(
            sub.id,
            ConsumerHandle {
                pattern: sub.pattern.clone(),
                cancel,
                task,
            },
        );
        info!(subscription_id = sub.id, pattern = %sub.pattern, "consumer added");
    }

    /// The filter or gate may have changed: stop any existing consumer and
    /// start fresh from the updated row.
    pub async fn update(&self, sub: SubscriptionRow) {
        self.remove(sub.id).await;
        self.add(sub).await;
    }

    /// Stop and discard the consumer for `id`, dropping its durable state.
    pub async fn remove(&self, id: i32) {
        let handle = self.consumers.lock().await.remove(&id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            handle.task.abort();
            info!(subscription_id = id, "consumer removed");
        }
        if let Ok(stream) = self.deps.bus.get_stream(EVENTS_STREAM) {
            stream.delete_consumer(&durable_name(id));
        }
    }

    /// Reconcile the running set against the store: stop orphans, start
    /// missing consumers, restart those whose pattern changed.
    pub async fn reload(&self) -> Result<(), sqlx::Error> {
        let desired = repo::list_active_routable(&self.deps.pool).await?;
        let desired_ids: HashSet<i32> = desired.iter().map(|s| s.id).collect();

        let orphans: Vec<i32> = {
            let consumers = self.consumers.lock().await;
            consumers
                .keys()
                .filter(|id| !desired_ids.contains(id))
                .copied()
                .collect()
        };
        for id in orphans {
            self.remove(id).await;
        }

        for sub in desired {
            let needs_start = {
                let consumers = self.consumers.lock().await;
                match consumers.get(&sub.id) {
                    Some(handle) => handle.pattern != sub.pattern || handle.task.is_finished(),
                    None => true,
                }
            };
            if needs_start {
                self.update(sub).await;
            }
        }

        let running = self.running_ids().await.len();
        info!(running, "supervisor reloaded");
        Ok(())
    }

    pub async fn running_ids(&self) -> Vec<i32> {
        let consumers = self.consumers.lock().await;
        let mut ids: Vec<i32> = consumers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Cancel every worker and give each a bounded grace period to finish.
    pub async fn shutdown_all(&self) {
        let handles: Vec<(i32, ConsumerHandle)> = {
            let mut consumers = self.consumers.lock().await;
            consumers.drain().collect()
        };
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (id, handle) in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle.task)
                .await
                .is_err()
            {
                warn!(subscription_id = id, "consumer did not stop within grace period");
            }
        }
    }

    /// Background duties: retire notifications from workers and the
    /// periodic crash-recovery reload.
    pub fn start_background(
        self: Arc<Self>,
        mut retire_rx: mpsc::UnboundedReceiver<i32>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let supervisor = self;
        tokio::spawn(async move {
            let mut reload_tick = tokio::time::interval(supervisor.deps.settings.reconcile_interval);
            reload_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it, startup already
            // ran a reload.
            reload_tick.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    retired = retire_rx.recv() => match retired {
                        Some(id) => supervisor.remove(id).await,
                        None => break,
                    },
                    _ = reload_tick.tick() => {
                        if let Err(e) = supervisor.reload().await {
                            warn!(error = %e, "periodic reload failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams;
    use chrono::Utc;
    use lh_protocol::subject;

    fn test_deps() -> WorkerDeps {
        let bus = EventBus::new();
        streams::create_streams(&bus, subject::RAW_SUBJECT);
        let settings = Arc::new(Settings::default());
        WorkerDeps {
            pool: crate::db::create_lazy_pool("postgres://postgres@127.0.0.1:5432/langhook")
                .expect("lazy pool"),
            bus,
            chat: Arc::new(ChatModel::new(settings.llm.clone())),
            metrics: Arc::new(Metrics::new()),
            settings,
            webhooks: WebhookSink::new(reqwest::Client::new()),
            budget: Arc::new(BudgetMonitor::default()),
        }
    }

    fn sub(id: i32, pattern: &str, active: bool, disposable: bool, used: bool) -> SubscriptionRow {
        SubscriptionRow {
            id,
            subscriber_id: repo::DEFAULT_SUBSCRIBER.to_owned(),
            description: "test".to_owned(),
            pattern: pattern.to_owned(),
            channel_type: None,
            channel_config: None,
            active,
            disposable,
            used,
            gate: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn add_starts_a_consumer_and_remove_stops_it() {
        let (supervisor, _rx) = Supervisor::new(test_deps());
        supervisor
            .add(sub(1, "langhook.events.github.>", true, false, false))
            .await;
        assert_eq!(supervisor.running_ids().await, vec![1]);

        supervisor.remove(1).await;
        assert!(supervisor.running_ids().await.is_empty());
    }

    #[tokio::test]
    async fn inactive_and_spent_disposables_are_not_started() {
        let (supervisor, _rx) = Supervisor::new(test_deps());
        supervisor
            .add(sub(1, "langhook.events.>", false, false, false))
            .await;
        supervisor
            .add(sub(2, "langhook.events.>", true, true, true))
            .await;
        assert!(supervisor.running_ids().await.is_empty());

        // An unspent disposable does run.
        supervisor
            .add(sub(3, "langhook.events.>", true, true, false))
            .await;
        assert_eq!(supervisor.running_ids().await, vec![3]);
        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn update_replaces_the_running_consumer() {
        let (supervisor, _rx) = Supervisor::new(test_deps());
        supervisor
            .add(sub(7, "langhook.events.github.>", true, false, false))
            .await;
        supervisor
            .update(sub(7, "langhook.events.stripe.>", true, false, false))
            .await;
        assert_eq!(supervisor.running_ids().await, vec![7]);
        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn retire_signal_removes_the_consumer() {
        let deps = test_deps();
        let (supervisor, retire_rx) = Supervisor::new(deps);
        let shutdown = CancellationToken::new();
        let background = supervisor.clone().start_background(retire_rx, shutdown.clone());

        supervisor
            .add(sub(9, "langhook.events.github.>", true, true, false))
            .await;
        assert_eq!(supervisor.running_ids().await, vec![9]);

        // Simulate the worker announcing retirement.
        supervisor.retire_tx.send(9).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(supervisor.running_ids().await.is_empty());

        shutdown.cancel();
        let _ = background.await;
    }

    #[tokio::test]
    async fn shutdown_all_stops_everything() {
        let (supervisor, _rx) = Supervisor::new(test_deps());
        for id in 1..=3 {
            supervisor
                .add(sub(id, "langhook.events.>", true, false, false))
                .await;
        }
        assert_eq!(supervisor.running_ids().await.len(), 3);
        supervisor.shutdown_all().await;
        assert!(supervisor.running_ids().await.is_empty());
    }
}
