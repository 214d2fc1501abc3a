//! Endpoint and probe data types shared across the crate.

use serde::{Deserialize, Serialize};

/// One reachable network address for a chain.
///
/// Built once from configuration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateEndpoint {
    pub url: String,
    /// Privileged/paid access tier rather than public shared access.
    #[serde(default)]
    pub is_private: bool,
}

impl CandidateEndpoint {
    pub fn public(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            is_private: false,
        }
    }

    pub fn private(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            is_private: true,
        }
    }
}

/// Outcome of one health check against one candidate.
///
/// A failed result never carries `round_trip_ms` or `observed_height`; use
/// [`ProbeResult::success`] and [`ProbeResult::failure`] to build one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub url: String,
    pub succeeded: bool,
    pub round_trip_ms: Option<u64>,
    pub observed_height: Option<u64>,
    pub is_private: bool,
    pub timestamp_millis: i64,
    /// Diagnostic for failed probes.
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn success(
        endpoint: &CandidateEndpoint,
        round_trip_ms: u64,
        observed_height: u64,
        timestamp_millis: i64,
    ) -> Self {
        Self {
            url: endpoint.url.clone(),
            succeeded: true,
            round_trip_ms: Some(round_trip_ms),
            observed_height: Some(observed_height),
            is_private: endpoint.is_private,
            timestamp_millis,
            error: None,
        }
    }

    pub fn failure(
        endpoint: &CandidateEndpoint,
        error: impl Into<String>,
        timestamp_millis: i64,
    ) -> Self {
        Self {
            url: endpoint.url.clone(),
            succeeded: false,
            round_trip_ms: None,
            observed_height: None,
            is_private: endpoint.is_private,
            timestamp_millis,
            error: Some(error.into()),
        }
    }

    pub(crate) fn height(&self) -> u64 {
        self.observed_height.unwrap_or(0)
    }

    pub(crate) fn latency(&self) -> u64 {
        self.round_trip_ms.unwrap_or(u64::MAX)
    }
}

/// The endpoints a caller should use right now for a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub primary: String,
    pub secondary: String,
}

impl Endpoints {
    pub fn new(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
        }
    }

    /// Both slots pointing at the same endpoint (degraded mode).
    pub fn both(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            primary: url.clone(),
            secondary: url,
        }
    }
}
