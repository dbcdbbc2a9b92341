//! Applying cached transforms to raw payloads.

use lh_protocol::{CanonicalEvent, subject::sanitize_token};
use lh_transform::fingerprint;
use tracing::{debug, error, warn};

use super::store::MappingStore;

pub struct MappingEngine {
    store: MappingStore,
}

impl MappingEngine {
    pub fn new(store: MappingStore) -> Self {
        MappingEngine { store }
    }

    /// Look up a cached transform by fingerprint and evaluate it.
    ///
    /// Returns `None` on a cache miss, a lookup failure, or an evaluation /
    /// validation failure — all of which send the caller down the LLM
    /// synthesis path.
    pub async fn apply(
        &self,
        source: &str,
        payload: &serde_json::Value,
    ) -> Option<CanonicalEvent> {
        let fp = fingerprint(payload);
        debug!(source, fingerprint = %fp, "payload fingerprinted");

        let mapping = match self.store.get(&fp).await {
            Ok(Some(mapping)) => mapping,
            Ok(None) => {
                debug!(source, fingerprint = %fp, "no fingerprint mapping found");
                return None;
            }
            Err(e) => {
                warn!(source, fingerprint = %fp, error = %e, "mapping lookup failed");
                return None;
            }
        };

        debug!(
            source,
            fingerprint = %fp,
            publisher = %mapping.publisher,
            "found fingerprint mapping"
        );
        evaluate(&mapping.mapping_expr, payload, source)
    }

    /// Persist a freshly synthesised transform keyed by the payload's
    /// fingerprint. Failures are logged, not propagated: the event that
    /// triggered synthesis still flows, the cache just stays cold.
    pub async fn store_mapping(&self, source: &str, payload: &serde_json::Value, expr: &str) {
        let fp = fingerprint(payload);
        let structure = lh_transform::type_skeleton(payload);

        let event_name = match evaluate(expr, payload, source) {
            Some(canonical) => format!(
                "{} {}",
                sanitize_token(&canonical.resource.kind),
                canonical.action
            ),
            None => "unknown unknown".to_owned(),
        };

        match self
            .store
            .put(&fp, source, &event_name, expr, &structure)
            .await
        {
            Ok(()) => {
                tracing::info!(source, fingerprint = %fp, event_name = %event_name, "stored new mapping");
            }
            Err(e) => {
                error!(source, fingerprint = %fp, error = %e, "failed to store mapping");
            }
        }
    }
}

/// Evaluate a transform expression and validate the result as a canonical
/// event. Returns `None` (with a log) on any failure; the engine never
/// panics on a bad stored expression.
pub fn evaluate(
    expr: &str,
    payload: &serde_json::Value,
    source: &str,
) -> Option<CanonicalEvent> {
    let value = match lh_transform::transform(expr, payload) {
        Ok(value) => value,
        Err(e) => {
            error!(source, error = %e, "transform evaluation failed");
            return None;
        }
    };
    let Some(json) = value.into_json() else {
        error!(source, "transform evaluated to undefined");
        return None;
    };
    match CanonicalEvent::from_transform_output(&json, payload.clone()) {
        Ok(canonical) => Some(canonical),
        Err(e) => {
            error!(source, error = %e, "transform result failed validation");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lh_protocol::canonical::Action;
    use serde_json::json;

    #[test]
    fn evaluate_produces_a_validated_canonical_event() {
        let payload = json!({
            "action": "opened",
            "pull_request": {"id": 1374, "created_at": "2025-06-03T15:45:02Z"},
        });
        let canonical = evaluate(
            r#"{"publisher": "github",
                "resource": {"type": "pull_request", "id": pull_request.id},
                "action": action = "opened" ? "created" : "updated",
                "timestamp": pull_request.created_at}"#,
            &payload,
            "github",
        )
        .unwrap();
        assert_eq!(canonical.action, Action::Created);
        assert_eq!(canonical.resource.id.to_string(), "1374");
        assert_eq!(canonical.payload, payload);
    }

    #[test]
    fn evaluate_rejects_invalid_actions() {
        let payload = json!({"id": 1});
        let result = evaluate(
            r#"{"publisher": "x", "resource": {"type": "t", "id": id}, "action": "merged", "timestamp": "2025-01-01T00:00:00Z"}"#,
            &payload,
            "x",
        );
        assert!(result.is_none());
    }

    #[test]
    fn evaluate_rejects_undefined_results_and_parse_errors() {
        assert!(evaluate("missing.path", &json!({}), "x").is_none());
        assert!(evaluate("{{{nonsense", &json!({}), "x").is_none());
    }
}
