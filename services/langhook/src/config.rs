//! Service configuration loaded from environment variables.
//!
//! Everything has a default except `DATABASE_URL`, which `main` insists on.
//! Per-source HMAC secrets are discovered from `<SOURCE>_SECRET` variables
//! (`GITHUB_SECRET` → source `github`).

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use lh_protocol::subject;

/// Parsed `RATE_LIMIT` spec, e.g. `200/minute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSpec {
    pub max: u64,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Knobs for the stream consumers. Backoff values are floors, not fixed.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Attempts to find the stream at startup before failing loudly.
    pub bind_max_attempts: u32,
    /// Consecutive service-unavailable errors before a connection reset.
    pub error_threshold: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub batch_size: usize,
    pub fetch_wait: Duration,
    pub ack_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    /// Optional path prefix the whole API is nested under, e.g. `/langhook`.
    pub server_path_prefix: Option<String>,
    pub max_body_bytes: usize,
    pub rate_limit: RateLimitSpec,
    pub raw_subject: String,
    pub llm: LlmSettings,
    pub consumer: ConsumerSettings,
    pub reconcile_interval: Duration,
    /// Daily USD ceiling for gate LLM spend.
    pub gate_daily_cost_limit_usd: f64,
    /// Fraction of the ceiling that triggers the first budget alert.
    pub gate_cost_alert_threshold: f64,
    /// source slug → shared HMAC secret.
    secrets: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_addr: "0.0.0.0:8000".to_owned(),
            server_path_prefix: None,
            max_body_bytes: 1_048_576,
            rate_limit: RateLimitSpec {
                max: 200,
                window: Duration::from_secs(60),
            },
            raw_subject: subject::RAW_SUBJECT.to_owned(),
            llm: LlmSettings {
                provider: "openai".to_owned(),
                model: "gpt-4o-mini".to_owned(),
                api_key: None,
                base_url: "https://api.openai.com/v1".to_owned(),
                temperature: 0.1,
                max_tokens: 1000,
                timeout: Duration::from_secs(30),
            },
            consumer: ConsumerSettings {
                bind_max_attempts: 10,
                error_threshold: 3,
                base_backoff: Duration::from_secs(2),
                max_backoff: Duration::from_secs(60),
                batch_size: 10,
                fetch_wait: Duration::from_millis(500),
                ack_wait: Duration::from_secs(30),
            },
            reconcile_interval: Duration::from_secs(60),
            gate_daily_cost_limit_usd: 10.0,
            gate_cost_alert_threshold: 0.8,
            secrets: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Settings {
            bind_addr: var_or("BIND_ADDR", &defaults.bind_addr),
            server_path_prefix: env::var("SERVER_PATH_PREFIX")
                .ok()
                .filter(|p| !p.is_empty())
                .map(|p| normalize_prefix(&p))
                .filter(|p| p != "/"),
            max_body_bytes: parse_or("MAX_BODY_BYTES", defaults.max_body_bytes),
            rate_limit: env::var("RATE_LIMIT")
                .ok()
                .and_then(|spec| parse_rate_limit(&spec))
                .unwrap_or(defaults.rate_limit),
            raw_subject: var_or("RAW_SUBJECT", &defaults.raw_subject),
            llm: LlmSettings {
                provider: var_or("LLM_PROVIDER", &defaults.llm.provider),
                model: var_or("LLM_MODEL", &defaults.llm.model),
                api_key: env::var("LLM_API_KEY")
                    .or_else(|_| env::var("OPENAI_API_KEY"))
                    .ok()
                    .filter(|k| !k.is_empty()),
                base_url: var_or("LLM_BASE_URL", &defaults.llm.base_url),
                temperature: parse_or("LLM_TEMPERATURE", defaults.llm.temperature),
                max_tokens: parse_or("LLM_MAX_TOKENS", defaults.llm.max_tokens),
                timeout: Duration::from_secs(parse_or("LLM_TIMEOUT_SECONDS", 30)),
            },
            consumer: ConsumerSettings {
                bind_max_attempts: parse_or(
                    "STREAM_BIND_MAX_ATTEMPTS",
                    defaults.consumer.bind_max_attempts,
                ),
                error_threshold: parse_or(
                    "STREAM_ERROR_THRESHOLD",
                    defaults.consumer.error_threshold,
                ),
                base_backoff: Duration::from_millis(parse_or("STREAM_BASE_BACKOFF_MS", 2000)),
                max_backoff: Duration::from_millis(parse_or("STREAM_MAX_BACKOFF_MS", 60_000)),
                batch_size: parse_or("CONSUMER_BATCH_SIZE", defaults.consumer.batch_size),
                fetch_wait: Duration::from_millis(parse_or("CONSUMER_FETCH_WAIT_MS", 500)),
                ack_wait: Duration::from_millis(parse_or("CONSUMER_ACK_WAIT_MS", 30_000)),
            },
            reconcile_interval: Duration::from_secs(parse_or("RECONCILE_INTERVAL_SECONDS", 60)),
            gate_daily_cost_limit_usd: parse_or("GATE_DAILY_COST_LIMIT_USD", 10.0),
            gate_cost_alert_threshold: parse_or("GATE_COST_ALERT_THRESHOLD", 0.8),
            secrets: secrets_from(env::vars()),
        }
    }

    /// HMAC secret configured for a source, if any.
    pub fn secret_for(&self, source: &str) -> Option<&str> {
        self.secrets.get(&source.to_ascii_lowercase()).map(String::as_str)
    }

    /// Test hook: install a per-source secret.
    pub fn set_secret(&mut self, source: &str, secret: &str) {
        self.secrets
            .insert(source.to_ascii_lowercase(), secret.to_owned());
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_owned())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    format!("/{trimmed}")
}

/// Parse a `<count>/<unit>` limit spec. Unknown units are rejected.
pub fn parse_rate_limit(spec: &str) -> Option<RateLimitSpec> {
    let (count, unit) = spec.split_once('/')?;
    let max: u64 = count.trim().parse().ok()?;
    let window = match unit.trim().to_ascii_lowercase().as_str() {
        "second" | "sec" | "s" => Duration::from_secs(1),
        "minute" | "min" | "m" => Duration::from_secs(60),
        "hour" | "h" => Duration::from_secs(3600),
        _ => return None,
    };
    Some(RateLimitSpec { max, window })
}

/// Collect `<SOURCE>_SECRET` environment variables into a source → secret map.
fn secrets_from(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
    vars.filter_map(|(key, value)| {
        let source = key.strip_suffix("_SECRET")?;
        if source.is_empty() || value.is_empty() {
            return None;
        }
        Some((source.to_ascii_lowercase(), value))
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_specs_parse() {
        assert_eq!(
            parse_rate_limit("200/minute"),
            Some(RateLimitSpec {
                max: 200,
                window: Duration::from_secs(60)
            })
        );
        assert_eq!(
            parse_rate_limit("5/second"),
            Some(RateLimitSpec {
                max: 5,
                window: Duration::from_secs(1)
            })
        );
        assert_eq!(parse_rate_limit("10/fortnight"), None);
        assert_eq!(parse_rate_limit("banana"), None);
    }

    #[test]
    fn secrets_are_discovered_by_suffix() {
        let vars = vec![
            ("GITHUB_SECRET".to_owned(), "gh-secret".to_owned()),
            ("STRIPE_SECRET".to_owned(), "whsec_x".to_owned()),
            ("DATABASE_URL".to_owned(), "postgres://".to_owned()),
            ("_SECRET".to_owned(), "orphan".to_owned()),
        ];
        let secrets = secrets_from(vars.into_iter());
        assert_eq!(secrets.get("github").map(String::as_str), Some("gh-secret"));
        assert_eq!(secrets.get("stripe").map(String::as_str), Some("whsec_x"));
        assert_eq!(secrets.len(), 2);
    }

    #[test]
    fn secret_lookup_is_case_insensitive_on_source() {
        let mut settings = Settings::default();
        settings.set_secret("GitHub", "s");
        assert_eq!(settings.secret_for("github"), Some("s"));
        assert_eq!(settings.secret_for("GITHUB"), Some("s"));
        assert_eq!(settings.secret_for("stripe"), None);
    }

    #[test]
    fn prefix_is_normalized_to_a_single_leading_slash() {
        assert_eq!(normalize_prefix("langhook/"), "/langhook");
        assert_eq!(normalize_prefix("/api/hooks"), "/api/hooks");
    }
}
