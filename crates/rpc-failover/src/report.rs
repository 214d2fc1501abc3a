//! Error-reporting capability for degraded conditions.
//!
//! Reports are fire-and-forget; a reporter must never block the scheduler.

use serde::Serialize;

/// Event names emitted by this crate.
pub mod events {
    pub const NO_SUCCESSFUL_PROBES: &str = "no_successful_probes";
    pub const PERSIST_FAILED: &str = "persist_failed";
    pub const UNKNOWN_CHAIN: &str = "unknown_chain";
}

/// Sink for anomaly events.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, event: &str, fields: &[(&str, String)]);
}

/// Default reporter: one `warn!` line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, event: &str, fields: &[(&str, String)]) {
        let fields = fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::warn!(event = %event, fields = %fields, "rpc failover anomaly");
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyWebhook {
    pub event: String,
    pub fields: std::collections::BTreeMap<String, String>,
    pub timestamp: i64,
}

/// Posts each event as JSON to every configured URL.
///
/// Also logs through [`TracingReporter`] so events are never silent.
#[derive(Debug, Clone)]
pub struct WebhookReporter {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl WebhookReporter {
    pub fn new(urls: Vec<String>) -> Self {
        for url in &urls {
            if !url.starts_with("https://") {
                tracing::warn!(
                    url = %url,
                    "webhook URL does not use HTTPS; payloads will be sent in cleartext"
                );
            }
        }
        Self {
            client: reqwest::Client::new(),
            urls,
        }
    }
}

impl ErrorReporter for WebhookReporter {
    fn report(&self, event: &str, fields: &[(&str, String)]) {
        TracingReporter.report(event, fields);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(event = %event, "no async runtime, webhook not sent");
            return;
        };

        let webhook = AnomalyWebhook {
            event: event.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        let body = match serde_json::to_vec(&webhook) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize webhook payload");
                return;
            }
        };

        for url in &self.urls {
            let client = self.client.clone();
            let url = url.clone();
            let body = body.clone();

            runtime.spawn(async move {
                let result = client
                    .post(&url)
                    .header("content-type", "application/json")
                    .timeout(std::time::Duration::from_secs(5))
                    .body(body)
                    .send()
                    .await;
                match result {
                    Ok(resp) => {
                        tracing::debug!(url = %url, status = %resp.status(), "webhook delivered")
                    }
                    Err(e) => tracing::warn!(url = %url, error = %e, "webhook delivery failed"),
                }
            });
        }
    }
}
