//! Single-attempt webhook delivery.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{info, warn};

/// Parsed `channel_config` JSON for a webhook channel.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookChannel {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl WebhookChannel {
    /// Parse from the subscription's `channel_config` text column.
    pub fn from_config(channel_type: Option<&str>, config: Option<&str>) -> Option<Self> {
        if channel_type.is_some_and(|t| t != "webhook") {
            return None;
        }
        serde_json::from_str(config?).ok()
    }
}

#[derive(Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client) -> Self {
        WebhookSink { client }
    }

    /// POST (or the configured method) the payload exactly once.
    ///
    /// Returns the HTTP status code; transport errors are reported as
    /// `None`. No retries — the outcome is recorded and the event moves on.
    pub async fn deliver(&self, channel: &WebhookChannel, body: &serde_json::Value) -> Option<u16> {
        let method = channel
            .method
            .as_deref()
            .and_then(|m| m.to_uppercase().parse::<reqwest::Method>().ok())
            .unwrap_or(reqwest::Method::POST);

        let mut request = self.client.request(method, &channel.url).json(body);
        for (name, value) in &channel.headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                info!(url = %channel.url, status, "webhook delivered");
                Some(status)
            }
            Err(e) => {
                warn!(url = %channel.url, error = %e, "webhook delivery failed");
                None
            }
        }
    }
}
