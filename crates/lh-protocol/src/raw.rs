// Raw-event and dead-letter records as produced by the ingest endpoint.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of HMAC verification at ingest time.
///
/// Encoded on the wire as `true` / `false` / `null` so that existing
/// consumers of the raw stream keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum SignatureState {
    Valid,
    Invalid,
    /// No secret configured for the source; the body was not checked.
    Unchecked,
}

impl From<Option<bool>> for SignatureState {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => SignatureState::Valid,
            Some(false) => SignatureState::Invalid,
            None => SignatureState::Unchecked,
        }
    }
}

impl From<SignatureState> for Option<bool> {
    fn from(value: SignatureState) -> Self {
        match value {
            SignatureState::Valid => Some(true),
            SignatureState::Invalid => Some(false),
            SignatureState::Unchecked => None,
        }
    }
}

/// One accepted webhook delivery, published on the raw stream.
///
/// Consumed exactly once by the canonicaliser; it then becomes either a
/// canonical event or a [`MappingFailure`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Request id assigned at ingest; carried through to the canonical event.
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Source slug from the URL path, e.g. `github`.
    pub source: String,
    pub signature_valid: SignatureState,
    pub headers: BTreeMap<String, String>,
    pub payload: serde_json::Value,
}

/// Record published on the dead-letter subject when an event cannot be
/// canonicalised (or cannot even be parsed at ingest).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingFailure {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub error: String,
    pub payload: serde_json::Value,
}
