// lh-protocol: wire and domain types shared by the LangHook service and tests.
//
// Everything that crosses a process or stream boundary lives here: raw
// ingest records, canonical events, delivery envelopes, mapping failures,
// routing subjects, and the HTTP error envelope.

pub mod canonical;
pub mod envelope;
pub mod raw;
pub mod subject;

pub use canonical::{Action, CanonicalError, CanonicalEvent, Resource, ResourceId};
pub use envelope::Envelope;
pub use raw::{MappingFailure, RawEvent, SignatureState};

use serde::{Deserialize, Serialize};

/// JSON body returned by every non-2xx HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
