//! Pattern compiler: natural-language description → subject pattern, plus
//! an optional gate prompt when semantic filtering is requested.
//!
//! The LLM is constrained by a closed vocabulary taken from the schema
//! registry. With an empty registry nothing can be routed, so compilation
//! fails with [`CompileError::NoSuitableSchema`] (the API maps it to 422).
//! With the LLM unavailable, a small keyword fallback keeps the system
//! degrading rather than rejecting.

use std::sync::Arc;

use regex::Regex;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};

use crate::llm::{ChatModel, json_extract};

use super::repo::{self, SchemaSummary};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("no suitable event schema found for description: {0}")]
    NoSuitableSchema(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPattern {
    pub pattern: String,
    pub gate_prompt: Option<String>,
}

const NO_SCHEMA_MARKER: &str = "ERROR: No suitable schema found";

pub struct PatternCompiler {
    chat: Arc<ChatModel>,
    pool: PgPool,
}

impl PatternCompiler {
    pub fn new(chat: Arc<ChatModel>, pool: PgPool) -> Self {
        PatternCompiler { chat, pool }
    }

    pub async fn compile(
        &self,
        description: &str,
        gate_enabled: bool,
    ) -> Result<CompiledPattern, CompileError> {
        let summary = repo::schema_summary(&self.pool).await;
        if summary.is_empty() {
            return Err(CompileError::NoSuitableSchema(description.to_owned()));
        }

        if !self.chat.is_available() {
            return Ok(fallback_compile(description, gate_enabled));
        }

        let system = build_system_prompt(&summary, gate_enabled);
        let user = build_user_prompt(description, gate_enabled);
        let response = match self.chat.complete(&system, &user).await {
            Ok(response) => response,
            Err(e) => {
                warn!(description, error = %e, "pattern compilation call failed, using fallback");
                return Ok(fallback_compile(description, gate_enabled));
            }
        };

        if is_no_schema_response(&response) {
            warn!(description, response = %response, "no suitable schema for description");
            return Err(CompileError::NoSuitableSchema(description.to_owned()));
        }

        match parse_response(&response, description, gate_enabled) {
            ParsedResponse::Compiled(compiled) => {
                info!(
                    description,
                    pattern = %compiled.pattern,
                    gate = gate_enabled,
                    "pattern compiled"
                );
                Ok(compiled)
            }
            ParsedResponse::NoSchema => {
                Err(CompileError::NoSuitableSchema(description.to_owned()))
            }
            ParsedResponse::Unparseable => {
                warn!(description, response = %response, "unparseable compiler response, using fallback");
                Ok(fallback_compile(description, gate_enabled))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prompt construction
// ---------------------------------------------------------------------------

fn build_system_prompt(summary: &SchemaSummary, gate_enabled: bool) -> String {
    let publishers = summary.publishers.join(", ");
    let actions = summary.actions.join(", ");
    let resource_types: String = summary
        .resource_types
        .iter()
        .map(|(publisher, types)| format!("- {publisher}: {}", types.join(", ")))
        .collect::<Vec<_>>()
        .join("\n");

    let gate_instructions = if gate_enabled {
        r#"

GATE PROMPT GENERATION:
Also generate a gate_prompt used to evaluate whether each incoming event
matches the user's specific intent. It must test only what the user asked
for (no bias toward "importance") and instruct the evaluator to return
JSON: {"decision": true or false}.

RESPONSE FORMAT — a JSON object:
{"pattern": "langhook.events.<publisher>.<resource_type>.<resource_id>.<action>",
 "gate_prompt": "..."}
If no suitable schema exists, respond with {"error": "No suitable schema found"}."#
    } else {
        r#"

RESPONSE FORMAT:
Respond with only the pattern, or with "ERROR: No suitable schema found"."#
    };

    format!(
        r#"You convert natural-language event descriptions into dotted subject
filter patterns.

Pattern: langhook.events.<publisher>.<resource_type>.<resource_id>.<action>
Wildcards: `*` = one token, `>` = one or more trailing tokens.

AVAILABLE EVENT SCHEMAS:
Publishers: {publishers}
Actions: {actions}
Resource types by publisher:
{resource_types}

Rules:
1. Think like a REST API: map verbs to created, read, updated, deleted
   (e.g. "opened" = created, "merged" = updated).
2. Only use the publishers, resource types, and actions listed above.
3. Use `*` where the description names no specific id.
4. If the request cannot be mapped, reply: "{NO_SCHEMA_MARKER}"{gate_instructions}"#
    )
}

fn build_user_prompt(description: &str, gate_enabled: bool) -> String {
    if gate_enabled {
        format!(
            "Convert this description to a filter pattern and generate a gate prompt:\n\n\"{description}\"\n\nRespond with JSON containing both pattern and gate_prompt."
        )
    } else {
        format!("Convert this description to a filter pattern:\n\n\"{description}\"\n\nPattern:")
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

enum ParsedResponse {
    Compiled(CompiledPattern),
    NoSchema,
    Unparseable,
}

fn pattern_regex() -> Regex {
    // Full subject grammar: four tokens after the events prefix.
    Regex::new(r"langhook\.events\.([a-z0-9_*>\-]+\.){3}[a-z0-9_*>\-]+")
        .expect("pattern regex is valid")
}

/// Pull a well-formed pattern out of free-form model text.
fn extract_pattern(text: &str) -> Option<String> {
    pattern_regex()
        .find(&text.to_lowercase())
        .map(|m| m.as_str().to_owned())
}

fn parse_response(response: &str, description: &str, gate_enabled: bool) -> ParsedResponse {
    if gate_enabled {
        if let Some(value) = json_extract(response) {
            if value.get("error").is_some() {
                return ParsedResponse::NoSchema;
            }
            if let Some(pattern) = value.get("pattern").and_then(serde_json::Value::as_str) {
                if let Some(pattern) = extract_pattern(pattern) {
                    let gate_prompt = value
                        .get("gate_prompt")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_owned)
                        .unwrap_or_else(|| fallback_gate_prompt(description));
                    return ParsedResponse::Compiled(CompiledPattern {
                        pattern,
                        gate_prompt: Some(gate_prompt),
                    });
                }
            }
        }
        // The model returned a bare pattern despite the JSON instruction:
        // accept it and gate on the description itself.
        if let Some(pattern) = extract_pattern(response) {
            return ParsedResponse::Compiled(CompiledPattern {
                pattern,
                gate_prompt: Some(fallback_gate_prompt(description)),
            });
        }
        ParsedResponse::Unparseable
    } else {
        match extract_pattern(response) {
            Some(pattern) => ParsedResponse::Compiled(CompiledPattern {
                pattern,
                gate_prompt: None,
            }),
            None => ParsedResponse::Unparseable,
        }
    }
}

fn is_no_schema_response(response: &str) -> bool {
    let lowered = response.to_lowercase();
    [
        "error: no suitable schema found",
        "error: no registered schemas available",
        "no suitable schema",
        "no registered schemas",
        "cannot be mapped",
        "schema not found",
    ]
    .iter()
    .any(|marker| lowered.contains(marker))
}

// ---------------------------------------------------------------------------
// Deterministic fallback (LLM unavailable)
// ---------------------------------------------------------------------------

/// Keyword-driven compilation over a small built-in vocabulary; used only
/// when the LLM cannot be consulted.
pub fn fallback_compile(description: &str, gate_enabled: bool) -> CompiledPattern {
    let lowered = description.to_lowercase();

    let mut publisher = "*";
    let mut resource_type = "*";
    if lowered.contains("github") || lowered.contains("pull request") || lowered.contains("pr ") {
        publisher = "github";
        if lowered.contains("pull request") || lowered.contains("pr ") {
            resource_type = "pull_request";
        } else if lowered.contains("issue") {
            resource_type = "issue";
        }
    } else if lowered.contains("stripe") || lowered.contains("payment") {
        publisher = "stripe";
        if lowered.contains("payment") {
            resource_type = "payment_intent";
        }
    } else if lowered.contains("slack") {
        publisher = "slack";
    } else if lowered.contains("jira") {
        publisher = "jira";
    }

    let resource_id = Regex::new(r"\b(\d+)\b")
        .expect("id regex is valid")
        .find(&lowered)
        .map_or_else(|| "*".to_owned(), |m| m.as_str().to_owned());

    let action = if ["create", "created", "new", "opened", "submitted"]
        .iter()
        .any(|w| lowered.contains(w))
    {
        "created"
    } else if ["update", "updated", "change", "modified", "approve", "merged", "succeed"]
        .iter()
        .any(|w| lowered.contains(w))
    {
        "updated"
    } else if ["delete", "deleted", "remove", "removed", "closed"]
        .iter()
        .any(|w| lowered.contains(w))
    {
        "deleted"
    } else {
        "*"
    };

    let pattern = format!("langhook.events.{publisher}.{resource_type}.{resource_id}.{action}");
    info!(description, pattern = %pattern, "fallback pattern compiled");
    CompiledPattern {
        gate_prompt: gate_enabled.then(|| fallback_gate_prompt(description)),
        pattern,
    }
}

/// Gate prompt derived from the description, used when the model did not
/// produce one.
fn fallback_gate_prompt(description: &str) -> String {
    format!(
        "Evaluate if this event matches the subscription: \"{description}\"\n\n\
         Event data:\n{{event_data}}\n\n\
         Return ONLY a JSON object: {{\"decision\": true or false}}\n\
         Return true if the event matches what the user requested, false otherwise."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_patterns_from_prose() {
        let pattern =
            extract_pattern("The pattern is `langhook.events.github.pull_request.*.updated`.")
                .unwrap();
        assert_eq!(pattern, "langhook.events.github.pull_request.*.updated");
        assert!(extract_pattern("no pattern here").is_none());
        // Too few tokens is not a pattern.
        assert!(extract_pattern("langhook.events.github.updated").is_none());
    }

    #[test]
    fn no_schema_marker_is_detected() {
        assert!(is_no_schema_response(NO_SCHEMA_MARKER));
        assert!(is_no_schema_response("error: no suitable schema found"));
        assert!(is_no_schema_response(
            "The request cannot be mapped to any schema."
        ));
        assert!(!is_no_schema_response(
            "langhook.events.github.pull_request.*.created"
        ));
    }

    #[test]
    fn gated_json_response_parses_pattern_and_prompt() {
        let response = r#"{"pattern": "langhook.events.stripe.payment_intent.*.updated", "gate_prompt": "Is the amount over $1000?"}"#;
        let ParsedResponse::Compiled(compiled) = parse_response(response, "desc", true) else {
            panic!("expected compiled pattern");
        };
        assert_eq!(
            compiled.pattern,
            "langhook.events.stripe.payment_intent.*.updated"
        );
        assert_eq!(compiled.gate_prompt.as_deref(), Some("Is the amount over $1000?"));
    }

    #[test]
    fn gated_bare_pattern_uses_the_description_as_gate_prompt() {
        let response = "langhook.events.stripe.payment_intent.*.updated";
        let ParsedResponse::Compiled(compiled) =
            parse_response(response, "payments over $1000", true)
        else {
            panic!("expected compiled pattern");
        };
        assert!(compiled.gate_prompt.unwrap().contains("payments over $1000"));
    }

    #[test]
    fn gated_error_object_means_no_schema() {
        let response = r#"{"error": "No suitable schema found"}"#;
        assert!(matches!(
            parse_response(response, "weather", true),
            ParsedResponse::NoSchema
        ));
    }

    #[test]
    fn fallback_detects_github_pull_requests() {
        let compiled = fallback_compile("Notify me when PR 1374 is approved", false);
        assert_eq!(compiled.pattern, "langhook.events.github.pull_request.1374.updated");
        assert!(compiled.gate_prompt.is_none());
    }

    #[test]
    fn fallback_detects_stripe_payments() {
        let compiled =
            fallback_compile("Notify me when a Stripe payment over $1000 succeeds", true);
        assert!(compiled.pattern.starts_with("langhook.events.stripe.payment_intent."));
        assert!(compiled.pattern.ends_with(".updated"));
        assert!(compiled.gate_prompt.is_some());
    }

    #[test]
    fn fallback_defaults_to_wildcards() {
        let compiled = fallback_compile("tell me about everything", false);
        assert_eq!(compiled.pattern, "langhook.events.*.*.*.*");
    }

    #[test]
    fn system_prompt_carries_the_registry_vocabulary() {
        let mut summary = SchemaSummary::default();
        summary.publishers = vec!["github".to_owned(), "stripe".to_owned()];
        summary.actions = vec!["created".to_owned(), "updated".to_owned()];
        summary
            .resource_types
            .insert("github".to_owned(), vec!["pull_request".to_owned()]);

        let prompt = build_system_prompt(&summary, false);
        assert!(prompt.contains("Publishers: github, stripe"));
        assert!(prompt.contains("- github: pull_request"));
        assert!(prompt.contains(NO_SCHEMA_MARKER));
        assert!(!prompt.contains("gate_prompt"));

        let gated = build_system_prompt(&summary, true);
        assert!(gated.contains("gate_prompt"));
    }
}
