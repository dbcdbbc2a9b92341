//! Chat-model client: an OpenAI-compatible `/chat/completions` surface over
//! `reqwest`, plus the one tolerant JSON extractor every LLM consumer in the
//! pipeline parses responses through.

use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::LlmSettings;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM not configured (no API key)")]
    Unavailable,
    #[error("LLM request timed out")]
    Timeout,
    #[error("LLM returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("LLM transport error: {0}")]
    Transport(String),
    #[error("LLM response missing completion text")]
    MalformedResponse,
}

/// A chat model that returns text. That is the whole provider abstraction.
pub struct ChatModel {
    client: reqwest::Client,
    settings: LlmSettings,
}

impl ChatModel {
    pub fn new(settings: LlmSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .unwrap_or_default();
        ChatModel { client, settings }
    }

    pub fn is_available(&self) -> bool {
        self.settings.api_key.is_some()
    }

    pub fn model_name(&self) -> &str {
        &self.settings.model
    }

    /// One structured completion: system + user message in, text out.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let Some(api_key) = self.settings.api_key.as_deref() else {
            return Err(LlmError::Unavailable);
        };

        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.settings.model,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        debug!(model = %self.settings.model, provider = %self.settings.provider, "llm request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(|text| text.trim().to_owned())
            .ok_or(LlmError::MalformedResponse)
    }

    /// Rough cost estimate in USD for one call, 4 chars ≈ 1 token.
    pub fn estimate_cost_usd(&self, prompt: &str, response: &str) -> f64 {
        let (input_per_1k, output_per_1k) = match self.settings.model.as_str() {
            "gpt-4o" => (0.005, 0.015),
            "gpt-4" => (0.03, 0.06),
            "gpt-3.5-turbo" => (0.0015, 0.002),
            _ => (0.000_15, 0.0006), // gpt-4o-mini and friends
        };
        let prompt_tokens = prompt.len() as f64 / 4.0;
        let response_tokens = response.len() as f64 / 4.0;
        (prompt_tokens / 1000.0) * input_per_1k + (response_tokens / 1000.0) * output_per_1k
    }
}

/// Strip fenced-code markers from a model response.
///
/// Handles a leading ```` ``` ```` or ```` ```json ```` line with a matching
/// closing fence, as well as fences embedded mid-prose.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip an optional language tag up to the first newline.
        let body_start = after.find('\n').map_or(0, |i| i + 1);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim().to_owned();
        }
    }
    trimmed.to_owned()
}

/// Extract a JSON object from a model response, tolerant of:
/// raw JSON, fenced JSON, and JSON embedded in prose (the largest `{…}`
/// span wins).
pub fn json_extract(text: &str) -> Option<serde_json::Value> {
    let unfenced = strip_code_fences(text);
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(unfenced.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&unfenced[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_model_is_unavailable() {
        let model = ChatModel::new(crate::config::Settings::default().llm);
        assert!(!model.is_available());
    }

    #[tokio::test]
    async fn complete_without_key_errors_immediately() {
        let model = ChatModel::new(crate::config::Settings::default().llm);
        assert!(matches!(
            model.complete("s", "u").await,
            Err(LlmError::Unavailable)
        ));
    }

    #[test]
    fn strips_fences_with_language_tags() {
        let fenced = "```json\n{\"decision\": true}\n```";
        assert_eq!(strip_code_fences(fenced), "{\"decision\": true}");

        let bare = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(bare), "{\"a\": 1}");

        assert_eq!(strip_code_fences("no fences"), "no fences");
    }

    #[test]
    fn extracts_raw_json() {
        let value = json_extract(r#"{"decision": true, "reasoning": "ok"}"#).unwrap();
        assert_eq!(value["decision"], true);
    }

    #[test]
    fn extracts_fenced_json() {
        let value = json_extract("```json\n{\"decision\": false}\n```").unwrap();
        assert_eq!(value["decision"], false);
    }

    #[test]
    fn extracts_json_embedded_in_prose() {
        let value = json_extract(
            "Sure! Based on the event, here is my verdict: {\"decision\": true, \"reasoning\": \"amount over limit\"} — hope that helps.",
        )
        .unwrap();
        assert_eq!(value["reasoning"], "amount over limit");
    }

    #[test]
    fn garbage_yields_none() {
        assert!(json_extract("no json here").is_none());
        assert!(json_extract("{broken").is_none());
    }

    #[test]
    fn cost_estimate_is_positive_and_model_sensitive() {
        let mut settings = crate::config::Settings::default().llm;
        let mini = ChatModel::new(settings.clone());
        settings.model = "gpt-4".to_owned();
        let big = ChatModel::new(settings);
        let prompt = "p".repeat(4000);
        assert!(big.estimate_cost_usd(&prompt, "r") > mini.estimate_cost_usd(&prompt, "r"));
    }
}
