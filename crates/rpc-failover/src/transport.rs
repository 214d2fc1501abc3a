//! Transport capability: one JSON POST with a deadline.

use std::future::Future;
use std::time::Duration;

use crate::error::{FailoverError, Result};

/// Anything that can POST a JSON payload to a URL and hand back the decoded
/// JSON body. Dropping the returned future must release the connection.
pub trait RpcTransport: Send + Sync + 'static {
    fn post(
        &self,
        url: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> impl Future<Output = Result<serde_json::Value>> + Send;
}

/// HTTP transport backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let resp = self
            .http
            .post(url)
            .header("content-type", "application/json")
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FailoverError::Timeout(timeout)
                } else {
                    FailoverError::Transport(format!("request failed: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FailoverError::Transport(format!("http status {status}")));
        }

        resp.json()
            .await
            .map_err(|e| FailoverError::InvalidResponse(format!("failed to decode body: {e}")))
    }
}
