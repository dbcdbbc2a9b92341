// Delivery envelope wrapping a canonical event for the stream.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::canonical::CanonicalEvent;

/// Stream message carrying one canonical event plus routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Request id of the originating raw event.
    pub id: String,
    pub specversion: String,
    /// `/<publisher>`
    pub source: String,
    /// `com.<publisher>.<resource_type>.<action>`
    #[serde(rename = "type")]
    pub kind: String,
    /// `<resource_type>/<resolved_id>` — see [`resolve_resource_id`].
    pub subject: String,
    pub time: String,
    pub data: CanonicalEvent,
}

impl Envelope {
    /// Wrap a canonical event for publication.
    pub fn wrap(event_id: &str, event: CanonicalEvent) -> Self {
        let resolved_id = resolve_resource_id(&event.resource.id.to_string(), &event.payload);
        Envelope {
            id: event_id.to_owned(),
            specversion: "1.0".to_owned(),
            source: format!("/{}", event.publisher),
            kind: format!(
                "com.{}.{}.{}",
                event.publisher, event.resource.kind, event.action
            ),
            subject: format!("{}/{}", event.resource.kind, resolved_id),
            time: Utc::now().to_rfc3339(),
            data: event,
        }
    }
}

/// One-step dotted-path resolution of a resource id against the original
/// payload.
///
/// Transforms occasionally emit the *path* of the id (`head_commit.id`)
/// instead of its value. If the id looks like a dot path that exists in the
/// payload and resolves to a scalar, substitute the resolved value;
/// otherwise keep the literal.
pub fn resolve_resource_id(id: &str, payload: &serde_json::Value) -> String {
    if !id.contains('.') {
        return id.to_owned();
    }
    let mut current = payload;
    for part in id.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return id.to_owned(),
        }
    }
    match current {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        _ => id.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{Action, Resource, ResourceId};
    use serde_json::json;

    fn commit_event(id: &str, payload: serde_json::Value) -> CanonicalEvent {
        CanonicalEvent {
            publisher: "github".to_owned(),
            resource: Resource {
                kind: "commit".to_owned(),
                id: ResourceId::Str(id.to_owned()),
            },
            action: Action::Created,
            timestamp: "2025-06-19T00:40:27+07:00".to_owned(),
            payload,
        }
    }

    #[test]
    fn literal_id_is_kept() {
        let event = commit_event("384c3b87", json!({"head_commit": {"id": "384c3b87"}}));
        let envelope = Envelope::wrap("evt-1", event);
        assert_eq!(envelope.subject, "commit/384c3b87");
        assert_eq!(envelope.kind, "com.github.commit.created");
        assert_eq!(envelope.source, "/github");
    }

    #[test]
    fn dotted_path_id_resolves_against_the_payload() {
        let event = commit_event(
            "head_commit.id",
            json!({"head_commit": {"id": "384c3b87", "tree_id": "375b20dd"}}),
        );
        let envelope = Envelope::wrap("evt-2", event);
        assert_eq!(envelope.subject, "commit/384c3b87");
    }

    #[test]
    fn dotted_path_missing_from_payload_stays_literal() {
        let event = commit_event("head_commit.id", json!({"repository": {"id": 7}}));
        let envelope = Envelope::wrap("evt-3", event);
        assert_eq!(envelope.subject, "commit/head_commit.id");
    }

    #[test]
    fn envelope_round_trip_preserves_canonical_data() {
        let event = commit_event("384c3b87", json!({"head_commit": {"id": "384c3b87"}}));
        let envelope = Envelope::wrap("evt-4", event.clone());
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.data, event);
    }
}
