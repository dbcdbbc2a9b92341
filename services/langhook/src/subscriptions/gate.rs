//! Per-event LLM gate: a boolean semantic filter with a failover policy.

use std::sync::Arc;

use lh_protocol::CanonicalEvent;
use tracing::{info, warn};

use crate::llm::{ChatModel, json_extract};
use crate::metrics::Metrics;

use super::budget::BudgetMonitor;

const EVENT_DATA_PLACEHOLDER: &str = "{event_data}";

const GATE_SYSTEM_PROMPT: &str = "You evaluate events for subscription gates. \
Follow the instruction exactly and respond with a JSON object: \
{\"decision\": true or false, \"reasoning\": \"short explanation\"}.";

/// What to answer when the model cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailoverPolicy {
    #[default]
    FailOpen,
    FailClosed,
}

impl FailoverPolicy {
    fn decision(self) -> bool {
        matches!(self, FailoverPolicy::FailOpen)
    }
}

/// Gate settings parsed from a subscription's `gate` JSON column.
#[derive(Debug, Clone, Default)]
pub struct GateConfig {
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub failover: FailoverPolicy,
}

impl GateConfig {
    /// Returns `None` when the gate is absent or disabled.
    pub fn from_json(gate: Option<&serde_json::Value>) -> Option<GateConfig> {
        let gate = gate?;
        if !gate
            .get("enabled")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            return None;
        }
        let failover = match gate.get("failover_policy").and_then(serde_json::Value::as_str) {
            Some("fail_closed") => FailoverPolicy::FailClosed,
            _ => FailoverPolicy::FailOpen,
        };
        Some(GateConfig {
            prompt: gate
                .get("prompt")
                .and_then(serde_json::Value::as_str)
                .filter(|p| !p.is_empty())
                .map(str::to_owned),
            model: gate
                .get("model")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned),
            failover,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub passed: bool,
    pub reason: String,
}

pub struct GateEvaluator {
    chat: Arc<ChatModel>,
    metrics: Arc<Metrics>,
    budget: Arc<BudgetMonitor>,
}

impl GateEvaluator {
    pub fn new(chat: Arc<ChatModel>, metrics: Arc<Metrics>, budget: Arc<BudgetMonitor>) -> Self {
        GateEvaluator {
            chat,
            metrics,
            budget,
        }
    }

    /// Decide whether `event` passes the gate for one subscription.
    ///
    /// Never fails: LLM unavailability or errors resolve through the
    /// subscription's failover policy.
    pub async fn evaluate(
        &self,
        event: &CanonicalEvent,
        config: &GateConfig,
        description: &str,
        subscription_id: i32,
    ) -> GateDecision {
        let sub_label = subscription_id.to_string();
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| self.chat.model_name().to_owned());

        if !self.chat.is_available() {
            let decision = config.failover.decision();
            self.record(&sub_label, decision, &model, "llm_unavailable");
            warn!(
                subscription_id,
                decision, "gate evaluation skipped - LLM unavailable"
            );
            return GateDecision {
                passed: decision,
                reason: "LLM service unavailable".to_owned(),
            };
        }

        // Spending stops at the daily ceiling; the failover policy decides
        // what happens to events until it resets.
        if self.budget.is_exhausted() {
            let decision = config.failover.decision();
            self.record(&sub_label, decision, &model, "budget_exhausted");
            warn!(subscription_id, decision, "gate evaluation skipped - daily budget exhausted");
            return GateDecision {
                passed: decision,
                reason: "gate budget exhausted".to_owned(),
            };
        }

        let prompt = render_prompt(config.prompt.as_deref(), description, event);
        let response = match self.chat.complete(GATE_SYSTEM_PROMPT, &prompt).await {
            Ok(response) => response,
            Err(e) => {
                let decision = config.failover.decision();
                self.record(&sub_label, decision, &model, "evaluation_error");
                warn!(subscription_id, error = %e, decision, "gate evaluation failed");
                return GateDecision {
                    passed: decision,
                    reason: format!("Gate evaluation error: {e}"),
                };
            }
        };

        let decision = parse_gate_response(&response);
        self.record(&sub_label, decision.passed, &model, "");
        let cost = self.chat.estimate_cost_usd(&prompt, &response);
        self.metrics
            .gate_cost_usd
            .with_label_values(&[&sub_label, &model])
            .inc_by(cost);
        self.budget.record_cost(cost, subscription_id);

        info!(
            subscription_id,
            model = %model,
            decision = if decision.passed { "pass" } else { "block" },
            reasoning = %decision.reason,
            "gate evaluation completed"
        );
        decision
    }

    fn record(&self, subscription_id: &str, passed: bool, model: &str, failover_reason: &str) {
        self.metrics
            .gate_evaluations
            .with_label_values(&[
                subscription_id,
                if passed { "pass" } else { "block" },
                model,
                failover_reason,
            ])
            .inc();
    }
}

/// Fill the gate prompt template with the event JSON. Templates without the
/// placeholder get the event appended so the model always sees the data.
fn render_prompt(template: Option<&str>, description: &str, event: &CanonicalEvent) -> String {
    let event_json = serde_json::to_string_pretty(event).unwrap_or_default();
    let template = template.map_or_else(
        || default_prompt(description),
        str::to_owned,
    );
    if template.contains(EVENT_DATA_PLACEHOLDER) {
        template.replace(EVENT_DATA_PLACEHOLDER, &event_json)
    } else {
        format!("{template}\n\nEvent data:\n{event_json}")
    }
}

fn default_prompt(description: &str) -> String {
    format!(
        "Evaluate if this event matches the subscription: \"{description}\"\n\n\
         Event data:\n{EVENT_DATA_PLACEHOLDER}\n\n\
         Return ONLY a JSON object: {{\"decision\": true or false}}"
    )
}

/// Parse the model's verdict, tolerant of fences and prose. Parse failures
/// block (decision false) with a recorded reason.
fn parse_gate_response(response: &str) -> GateDecision {
    let Some(value) = json_extract(response) else {
        return GateDecision {
            passed: false,
            reason: "parse failure".to_owned(),
        };
    };
    let passed = match value.get("decision") {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    };
    let reason = value
        .get("reasoning")
        .or_else(|| value.get("reason"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("No reasoning provided")
        .to_owned();
    GateDecision { passed, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lh_protocol::canonical::{Action, Resource, ResourceId};
    use serde_json::json;

    fn event() -> CanonicalEvent {
        CanonicalEvent {
            publisher: "stripe".to_owned(),
            resource: Resource {
                kind: "payment_intent".to_owned(),
                id: ResourceId::Str("pi_ABC".to_owned()),
            },
            action: Action::Updated,
            timestamp: "2025-10-08T22:08:47Z".to_owned(),
            payload: json!({"amount": 1500}),
        }
    }

    #[test]
    fn config_is_none_when_disabled_or_absent() {
        assert!(GateConfig::from_json(None).is_none());
        assert!(GateConfig::from_json(Some(&json!({"enabled": false}))).is_none());
        assert!(GateConfig::from_json(Some(&json!({"prompt": "p"}))).is_none());
    }

    #[test]
    fn config_parses_failover_policy() {
        let open = GateConfig::from_json(Some(&json!({"enabled": true}))).unwrap();
        assert_eq!(open.failover, FailoverPolicy::FailOpen);
        let closed = GateConfig::from_json(Some(
            &json!({"enabled": true, "failover_policy": "fail_closed"}),
        ))
        .unwrap();
        assert_eq!(closed.failover, FailoverPolicy::FailClosed);
    }

    #[test]
    fn parses_plain_fenced_and_prose_responses() {
        assert!(parse_gate_response(r#"{"decision": true, "reasoning": "over limit"}"#).passed);
        assert!(parse_gate_response("```json\n{\"decision\": true}\n```").passed);
        let prose = parse_gate_response(
            "Looking at the amount, {\"decision\": false, \"reasoning\": \"only $5\"} is my verdict.",
        );
        assert!(!prose.passed);
        assert_eq!(prose.reason, "only $5");
    }

    #[test]
    fn parse_failure_blocks_with_reason() {
        let decision = parse_gate_response("I think yes?");
        assert!(!decision.passed);
        assert_eq!(decision.reason, "parse failure");
    }

    #[test]
    fn string_decisions_are_coerced() {
        assert!(parse_gate_response(r#"{"decision": "true"}"#).passed);
        assert!(!parse_gate_response(r#"{"decision": "nope"}"#).passed);
        assert!(!parse_gate_response(r#"{"decision": 1}"#).passed);
    }

    #[test]
    fn prompt_substitutes_event_data() {
        let rendered = render_prompt(
            Some("Is the amount over $1000?\n{event_data}"),
            "desc",
            &event(),
        );
        assert!(rendered.contains("\"amount\": 1500"));
        assert!(!rendered.contains(EVENT_DATA_PLACEHOLDER));

        // No placeholder: event data is appended.
        let appended = render_prompt(Some("Just decide."), "desc", &event());
        assert!(appended.contains("\"amount\": 1500"));
    }

    #[tokio::test]
    async fn unavailable_llm_fails_open_or_closed_per_policy() {
        let chat = Arc::new(ChatModel::new(crate::config::Settings::default().llm));
        let metrics = Arc::new(Metrics::new());
        let evaluator = GateEvaluator::new(chat, metrics, Arc::new(BudgetMonitor::default()));

        let open = GateConfig {
            failover: FailoverPolicy::FailOpen,
            ..GateConfig::default()
        };
        let decision = evaluator.evaluate(&event(), &open, "d", 1).await;
        assert!(decision.passed);
        assert_eq!(decision.reason, "LLM service unavailable");

        let closed = GateConfig {
            failover: FailoverPolicy::FailClosed,
            ..GateConfig::default()
        };
        let decision = evaluator.evaluate(&event(), &closed, "d", 1).await;
        assert!(!decision.passed);
    }
}
