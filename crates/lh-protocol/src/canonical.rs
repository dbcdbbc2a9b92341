// Canonical event model and schema validation.
//
// A canonical event is the normalised record emitted by the canonicaliser:
// who published it, what resource it is about, what happened to it, when.
// Validation is strict here so that nothing malformed ever reaches the
// canonical stream.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Past-tense CRUD action of a canonical event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Read,
    Updated,
    Deleted,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Read => "read",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
        }
    }

    /// Parse an action as reported by a transform.
    ///
    /// Transforms may emit present-tense verbs; those are folded onto the
    /// canonical past-tense enum. Anything else is rejected.
    pub fn from_reported(value: &str) -> Option<Self> {
        match value {
            "create" | "created" => Some(Action::Created),
            "read" => Some(Action::Read),
            "update" | "updated" => Some(Action::Updated),
            "delete" | "deleted" => Some(Action::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource identifier: a scalar, either numeric or textual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceId {
    Int(i64),
    Str(String),
}

impl ResourceId {
    /// Atomic ids must not contain `/`, `#`, or space — those would break
    /// the subject grammar and suggest a composite key.
    pub fn is_atomic(&self) -> bool {
        match self {
            ResourceId::Int(_) => true,
            ResourceId::Str(s) => {
                !s.is_empty() && !s.contains('/') && !s.contains('#') && !s.contains(' ')
            }
        }
    }

    /// Coerce a JSON scalar into an id. Objects, arrays and floats with a
    /// fractional part are not ids.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(ResourceId::Str(s.clone())),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(ResourceId::Int(i))
                } else {
                    // 1374.0 is still an integral id; 13.74 is not.
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| ResourceId::Int(f as i64))
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Int(i) => write!(f, "{i}"),
            ResourceId::Str(s) => f.write_str(s),
        }
    }
}

/// What the event is about: a `{type, id}` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: ResourceId,
}

/// The normalised record emitted by the canonicaliser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub publisher: String,
    pub resource: Resource,
    pub action: Action,
    /// ISO-8601 timestamp carried from the source payload.
    pub timestamp: String,
    /// The original raw body, verbatim.
    pub payload: serde_json::Value,
}

/// Why a transform result was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalError {
    #[error("transform result is not an object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("`resource` must be an object with `type` and `id`")]
    BadResource,
    #[error("invalid action `{0}` - must be one of created, read, updated, deleted")]
    BadAction(String),
    #[error("resource id `{0}` is not atomic (contains /, #, or space)")]
    NonAtomicId(String),
    #[error("resource id must be a string or an integer")]
    NonScalarId,
    #[error("`{0}` must be a non-empty string")]
    EmptyField(&'static str),
}

impl CanonicalEvent {
    /// Build a canonical event from a transform's raw JSON output.
    ///
    /// Performs the present→past action fold and full schema validation;
    /// the original payload is attached for downstream consumers.
    pub fn from_transform_output(
        output: &serde_json::Value,
        raw_payload: serde_json::Value,
    ) -> Result<Self, CanonicalError> {
        let obj = output.as_object().ok_or(CanonicalError::NotAnObject)?;

        let publisher = obj
            .get("publisher")
            .ok_or(CanonicalError::MissingField("publisher"))?
            .as_str()
            .ok_or(CanonicalError::EmptyField("publisher"))?
            .to_owned();

        let resource = obj
            .get("resource")
            .ok_or(CanonicalError::MissingField("resource"))?
            .as_object()
            .ok_or(CanonicalError::BadResource)?;
        let kind = resource
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(CanonicalError::BadResource)?
            .to_owned();
        let id_value = resource.get("id").ok_or(CanonicalError::BadResource)?;
        let id = ResourceId::from_json(id_value).ok_or(CanonicalError::NonScalarId)?;

        let action_str = obj
            .get("action")
            .ok_or(CanonicalError::MissingField("action"))?
            .as_str()
            .ok_or_else(|| CanonicalError::BadAction(String::new()))?;
        let action = Action::from_reported(action_str)
            .ok_or_else(|| CanonicalError::BadAction(action_str.to_owned()))?;

        let timestamp = obj
            .get("timestamp")
            .ok_or(CanonicalError::MissingField("timestamp"))?
            .as_str()
            .ok_or(CanonicalError::EmptyField("timestamp"))?
            .to_owned();

        let event = CanonicalEvent {
            publisher,
            resource: Resource { kind, id },
            action,
            timestamp,
            payload: raw_payload,
        };
        event.validate()?;
        Ok(event)
    }

    /// Re-check the schema invariants on an already-built event.
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.publisher.is_empty() {
            return Err(CanonicalError::EmptyField("publisher"));
        }
        if self.resource.kind.is_empty() {
            return Err(CanonicalError::EmptyField("resource.type"));
        }
        if !self.resource.id.is_atomic() {
            return Err(CanonicalError::NonAtomicId(self.resource.id.to_string()));
        }
        if self.timestamp.is_empty() {
            return Err(CanonicalError::EmptyField("timestamp"));
        }
        Ok(())
    }
}
