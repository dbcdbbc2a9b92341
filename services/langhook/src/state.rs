//! Application state: the composition root.
//!
//! Every collaborator — pool, bus, chat model, metrics, rate limiter,
//! supervisor, pattern compiler — is constructed once here and injected
//! where needed. No globals.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::bus::EventBus;
use crate::config::Settings;
use crate::llm::ChatModel;
use crate::map::mapper::MappingEngine;
use crate::map::store::MappingStore;
use crate::map::synth::TransformSynthesizer;
use crate::map::MapService;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::subscriptions::budget::{BudgetLimits, BudgetMonitor};
use crate::subscriptions::nlp::PatternCompiler;
use crate::subscriptions::supervisor::{Supervisor, WorkerDeps};
use crate::subscriptions::webhook::WebhookSink;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub bus: EventBus,
    pub settings: Arc<Settings>,
    pub chat: Arc<ChatModel>,
    pub metrics: Arc<Metrics>,
    pub limiter: RateLimiter,
    pub supervisor: Arc<Supervisor>,
    pub compiler: Arc<PatternCompiler>,
    pub budget: Arc<BudgetMonitor>,
}

impl AppState {
    /// Wire the full object graph. Returns the state plus the retire
    /// channel receiver for [`Supervisor::start_background`].
    pub fn new(
        pool: PgPool,
        bus: EventBus,
        settings: Settings,
    ) -> (Self, mpsc::UnboundedReceiver<i32>) {
        let settings = Arc::new(settings);
        let chat = Arc::new(ChatModel::new(settings.llm.clone()));
        let metrics = Arc::new(Metrics::new());
        let limiter =
            RateLimiter::in_memory(settings.rate_limit.max, settings.rate_limit.window);
        let webhooks = WebhookSink::new(reqwest::Client::new());
        let budget = Arc::new(BudgetMonitor::new(BudgetLimits {
            daily_limit_usd: settings.gate_daily_cost_limit_usd,
            alert_threshold: settings.gate_cost_alert_threshold,
        }));

        let deps = WorkerDeps {
            pool: pool.clone(),
            bus: bus.clone(),
            chat: chat.clone(),
            metrics: metrics.clone(),
            settings: settings.clone(),
            webhooks,
            budget: budget.clone(),
        };
        let (supervisor, retire_rx) = Supervisor::new(deps);
        let compiler = Arc::new(PatternCompiler::new(chat.clone(), pool.clone()));

        let state = AppState {
            pool,
            bus,
            settings,
            chat,
            metrics,
            limiter,
            supervisor,
            compiler,
            budget,
        };
        (state, retire_rx)
    }

    /// Build the canonicaliser service from this state's collaborators.
    pub fn map_service(&self) -> Arc<MapService> {
        let store = MappingStore::new(self.pool.clone());
        let engine = MappingEngine::new(store);
        let synth = TransformSynthesizer::new(self.chat.clone());
        Arc::new(MapService::new(
            engine,
            synth,
            self.bus.clone(),
            self.pool.clone(),
            self.metrics.clone(),
        ))
    }
}
