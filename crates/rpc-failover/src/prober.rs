//! One timed, cancellable health check against one candidate endpoint.
//!
//! The probe is a two-call JSON-RPC batch: the height query supplies the
//! freshness counter, the sample query proves the node serves real data
//! rather than an empty 200. Every failure mode is folded into a failed
//! [`ProbeResult`]; nothing escapes [`Prober::probe`] as an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::clock::Clock;
use crate::config::ProbeQuery;
use crate::endpoint::{CandidateEndpoint, ProbeResult};
use crate::error::{FailoverError, Result};
use crate::metrics;
use crate::transport::RpcTransport;

const HEIGHT_ID: u64 = 1;
const SAMPLE_ID: u64 = 2;

/// Issues health-check probes over a shared transport.
///
/// Holds no mutable state, so any number of probes may run in parallel.
pub struct Prober<T: RpcTransport> {
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    payload: Value,
}

impl<T: RpcTransport> Prober<T> {
    pub fn new(transport: Arc<T>, clock: Arc<dyn Clock>, query: &ProbeQuery) -> Self {
        Self {
            transport,
            clock,
            payload: batch_payload(query),
        }
    }

    /// The request body sent to every candidate.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Probe `endpoint`, giving up after `deadline`.
    pub async fn probe(
        &self,
        endpoint: &CandidateEndpoint,
        chain_id: &str,
        deadline: Duration,
    ) -> ProbeResult {
        let started_at = self.clock.now_millis();
        let start = Instant::now();

        // Dropping the transport future on timeout releases its connection.
        let request = self.transport.post(&endpoint.url, &self.payload, deadline);
        let outcome = match tokio::time::timeout(deadline, request).await {
            Ok(Ok(body)) => parse_batch(&body),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FailoverError::Timeout(deadline)),
        };
        let elapsed = start.elapsed();

        match outcome {
            Ok(height) => {
                let round_trip_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                tracing::debug!(
                    chain_id = %chain_id,
                    url = %endpoint.url,
                    height,
                    round_trip_ms,
                    "probe succeeded"
                );
                metrics::PROBES.with_label_values(&[chain_id, "ok"]).inc();
                metrics::PROBE_LATENCY
                    .with_label_values(&[chain_id])
                    .observe(elapsed.as_secs_f64());
                ProbeResult::success(endpoint, round_trip_ms, height, started_at)
            }
            Err(e) => {
                let label = match &e {
                    FailoverError::Timeout(_) => "timeout",
                    FailoverError::InvalidResponse(_) => "invalid",
                    _ => "error",
                };
                tracing::debug!(
                    chain_id = %chain_id,
                    url = %endpoint.url,
                    error = %e,
                    "probe failed"
                );
                metrics::PROBES.with_label_values(&[chain_id, label]).inc();
                ProbeResult::failure(endpoint, e.to_string(), started_at)
            }
        }
    }
}

fn batch_payload(query: &ProbeQuery) -> Value {
    json!([
        {
            "jsonrpc": "2.0",
            "id": HEIGHT_ID,
            "method": query.height_method,
            "params": params_or_empty(&query.height_params),
        },
        {
            "jsonrpc": "2.0",
            "id": SAMPLE_ID,
            "method": query.sample_method,
            "params": params_or_empty(&query.sample_params),
        },
    ])
}

fn params_or_empty(params: &Value) -> Value {
    if params.is_null() {
        json!([])
    } else {
        params.clone()
    }
}

/// Extract the observed height from a batch response.
///
/// Entries are matched by id since servers may reorder batch replies.
fn parse_batch(body: &Value) -> Result<u64> {
    let entries = body
        .as_array()
        .ok_or_else(|| FailoverError::InvalidResponse("expected a batch array".into()))?;

    let height = parse_height(result_for(entries, HEIGHT_ID)?)?;
    result_for(entries, SAMPLE_ID)?;
    Ok(height)
}

fn result_for(entries: &[Value], id: u64) -> Result<&Value> {
    let entry = entries
        .iter()
        .find(|e| e.get("id").and_then(Value::as_u64) == Some(id))
        .ok_or_else(|| FailoverError::InvalidResponse(format!("missing reply for id {id}")))?;
    if let Some(err) = entry.get("error").filter(|e| !e.is_null()) {
        return Err(FailoverError::InvalidResponse(format!("rpc error: {err}")));
    }
    match entry.get("result") {
        Some(v) if !v.is_null() => Ok(v),
        _ => Err(FailoverError::InvalidResponse(format!(
            "empty result for id {id}"
        ))),
    }
}

/// Accepts a JSON integer, a `0x`-prefixed hex string, or a decimal string.
fn parse_height(value: &Value) -> Result<u64> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    };
    parsed.ok_or_else(|| FailoverError::InvalidResponse(format!("unparseable height: {value}")))
}
