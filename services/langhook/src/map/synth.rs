//! LLM synthesis of transform expressions, validated by execution.

use std::sync::Arc;

use lh_protocol::CanonicalEvent;
use thiserror::Error;
use tracing::{info, warn};

use crate::llm::{ChatModel, LlmError, strip_code_fences};

use super::mapper::evaluate;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("LLM unavailable")]
    Unavailable,
    #[error(transparent)]
    Llm(LlmError),
    #[error("generated transform is invalid: {0}")]
    Invalid(String),
}

const SYSTEM_PROMPT: &str = r#"You are an API analyst. Given a webhook JSON payload, write one transform
expression that converts it into the canonical format:

{"publisher": <source name>,
 "resource": {"type": <singular noun>, "id": <atomic identifier>},
 "action": one of "created", "read", "updated", "deleted",
 "timestamp": <ISO-8601 string>}

Expression language:
- object constructors with quoted keys: {"key": value}
- string/number literals, true, false, null
- field paths into the payload: pull_request.id, data.object.id
- conditional chains: action = "opened" ? "created" : "updated"
- string concatenation with &
- functions: $fromEpoch(seconds) converts a Unix timestamp to ISO-8601,
  $string(x), $number(x), $lowercase(x), $uppercase(x), $now(),
  $substring(s, start, len), $contains(s, needle), $replace(s, from, to)

Rules:
1. Identify the main resource and its atomic id (no composite keys).
2. Choose the action from the payload's own event semantics; hardcode it or
   branch on a payload field with a conditional chain.
3. Take the timestamp from the payload; use $fromEpoch for epoch numbers.
4. Return ONLY the expression. No explanations, no code fences.

Example:
{"publisher": "github", "resource": {"type": "pull_request", "id": pull_request.id}, "action": action = "opened" ? "created" : "updated", "timestamp": pull_request.created_at}"#;

/// Synthesises transform expressions for payload shapes we have never seen.
pub struct TransformSynthesizer {
    chat: Arc<ChatModel>,
}

impl TransformSynthesizer {
    pub fn new(chat: Arc<ChatModel>) -> Self {
        TransformSynthesizer { chat }
    }

    pub fn is_available(&self) -> bool {
        self.chat.is_available()
    }

    /// Ask the model for a transform, then prove it by executing it against
    /// the triggering payload and validating the result.
    pub async fn generate(
        &self,
        source: &str,
        payload: &serde_json::Value,
    ) -> Result<(String, CanonicalEvent), SynthesisError> {
        if !self.chat.is_available() {
            return Err(SynthesisError::Unavailable);
        }

        let user = format!(
            "Source: {source}\n\nPayload:\n{}",
            serde_json::to_string_pretty(payload).unwrap_or_default()
        );
        let response = self.chat.complete(SYSTEM_PROMPT, &user).await.map_err(|e| {
            warn!(source, error = %e, "transform synthesis call failed");
            match e {
                LlmError::Unavailable => SynthesisError::Unavailable,
                other => SynthesisError::Llm(other),
            }
        })?;

        let expr = strip_code_fences(&response);
        let canonical = evaluate(&expr, payload, source).ok_or_else(|| {
            SynthesisError::Invalid(format!(
                "expression did not produce a valid canonical event: {}",
                expr.chars().take(200).collect::<String>()
            ))
        })?;

        info!(
            source,
            expression_length = expr.len(),
            resource_type = %canonical.resource.kind,
            action = %canonical.action,
            "transform synthesis completed"
        );
        Ok((expr, canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[tokio::test]
    async fn generation_without_an_api_key_is_unavailable() {
        let synth = TransformSynthesizer::new(Arc::new(ChatModel::new(Settings::default().llm)));
        assert!(!synth.is_available());
        let err = synth
            .generate("github", &serde_json::json!({"a": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::Unavailable));
    }
}
