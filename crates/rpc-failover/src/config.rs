//! Failover configuration from environment variables or JSON.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::constants::{
    DEFAULT_URL, FUTURE_THRESHOLD, HEIGHT_METHOD, IDLE_TIMEOUT, LAG_THRESHOLD,
    MAX_CONCURRENT_PROBES, PROBE_INTERVAL, PROBE_TIMEOUT, SAMPLE_METHOD, SELECTION_TTL,
};
use crate::endpoint::CandidateEndpoint;
use crate::error::{FailoverError, Result};

/// Static endpoint configuration for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: String,
    pub candidates: Vec<CandidateEndpoint>,
    /// Always-available endpoint outside the probe pool. Used as the public
    /// secondary and as both slots when every probe fails.
    pub fallback_url: String,
}

impl ChainConfig {
    pub fn new(
        chain_id: impl Into<String>,
        candidates: Vec<CandidateEndpoint>,
        fallback_url: impl Into<String>,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            candidates,
            fallback_url: fallback_url.into(),
        }
    }

    /// Parse a JSON array of chain configs.
    pub fn list_from_json(json: &str) -> Result<Vec<Self>> {
        Ok(serde_json::from_str(json)?)
    }

    /// True when the fallback URL is also a probed candidate, in which case
    /// primary and secondary may coincide.
    pub fn fallback_in_pool(&self) -> bool {
        self.candidates.iter().any(|c| c.url == self.fallback_url)
    }

    /// First candidate suited to the account tier, or the first candidate at all.
    pub fn default_candidate(&self, prefer_private: bool) -> Option<&CandidateEndpoint> {
        self.candidates
            .iter()
            .find(|c| c.is_private == prefer_private)
            .or_else(|| self.candidates.first())
    }
}

/// The fixed, idempotent health-check query sent to every candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeQuery {
    pub height_method: String,
    #[serde(default)]
    pub height_params: serde_json::Value,
    pub sample_method: String,
    #[serde(default)]
    pub sample_params: serde_json::Value,
}

impl Default for ProbeQuery {
    fn default() -> Self {
        Self {
            height_method: HEIGHT_METHOD.to_string(),
            height_params: serde_json::json!([]),
            sample_method: SAMPLE_METHOD.to_string(),
            sample_params: serde_json::json!([]),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub chains: Vec<ChainConfig>,
    /// Scheduler wake-up interval (env: RPC_FAILOVER_INTERVAL_SECS, default: 10).
    pub probe_interval: Duration,
    /// Per-probe deadline (env: RPC_FAILOVER_TIMEOUT_SECS, default: 10).
    pub probe_timeout: Duration,
    /// Skip chains unused for this long (env: RPC_FAILOVER_IDLE_SECS, default: 60).
    pub idle_timeout: Duration,
    /// Expiry of the persisted selection record (default: 5 minutes).
    pub selection_ttl: Duration,
    pub future_threshold: u64,
    pub lag_threshold: u64,
    /// Per-chain fan-out bound (env: RPC_FAILOVER_MAX_CONCURRENCY, default: 8).
    pub max_concurrent_probes: usize,
    /// Initial account tier (env: RPC_FAILOVER_PREFER_PRIVATE, default: false).
    pub prefer_private: bool,
    /// Returned for chain ids that were never configured (env: RPC_FAILOVER_DEFAULT_URL).
    pub default_url: String,
    pub query: ProbeQuery,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            chains: Vec::new(),
            probe_interval: PROBE_INTERVAL,
            probe_timeout: PROBE_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            selection_ttl: SELECTION_TTL,
            future_threshold: FUTURE_THRESHOLD,
            lag_threshold: LAG_THRESHOLD,
            max_concurrent_probes: MAX_CONCURRENT_PROBES,
            prefer_private: false,
            default_url: DEFAULT_URL.to_string(),
            query: ProbeQuery::default(),
        }
    }
}

impl FailoverConfig {
    pub fn new(chains: Vec<ChainConfig>) -> Self {
        Self {
            chains,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Chains come from `RPC_FAILOVER_CHAINS_FILE` (a JSON array of
    /// [`ChainConfig`]) when set, otherwise from `RPC_FAILOVER_CHAINS` plus
    /// the per-chain `RPC_FAILOVER_<CHAIN>_ENDPOINTS`,
    /// `RPC_FAILOVER_<CHAIN>_PRIVATE_ENDPOINTS` and
    /// `RPC_FAILOVER_<CHAIN>_FALLBACK_URL` variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());
        let secs = |key: &str| var(key).and_then(|s| s.trim().parse::<u64>().ok());

        let chains = match var("RPC_FAILOVER_CHAINS_FILE") {
            Some(path) => {
                let json = std::fs::read_to_string(&path).map_err(|e| {
                    FailoverError::Config(format!("cannot read chains file {path}: {e}"))
                })?;
                ChainConfig::list_from_json(&json)?
            }
            None => {
                let ids = var("RPC_FAILOVER_CHAINS")
                    .ok_or_else(|| FailoverError::Config("RPC_FAILOVER_CHAINS is not set".into()))?;
                split_list(&ids)
                    .into_iter()
                    .map(|chain_id| {
                        let prefix = format!("RPC_FAILOVER_{}", env_segment(&chain_id));
                        let mut candidates: Vec<CandidateEndpoint> =
                            split_list(&var(&format!("{prefix}_ENDPOINTS")).unwrap_or_default())
                                .into_iter()
                                .map(CandidateEndpoint::public)
                                .collect();
                        candidates.extend(
                            split_list(
                                &var(&format!("{prefix}_PRIVATE_ENDPOINTS")).unwrap_or_default(),
                            )
                            .into_iter()
                            .map(CandidateEndpoint::private),
                        );
                        let fallback_url = var(&format!("{prefix}_FALLBACK_URL"))
                            .or_else(|| candidates.first().map(|c| c.url.clone()))
                            .unwrap_or_default();
                        ChainConfig::new(chain_id, candidates, fallback_url)
                    })
                    .collect()
            }
        };

        let defaults = Self::default();
        let mut query = ProbeQuery::default();
        if let Some(m) = var("RPC_FAILOVER_HEIGHT_METHOD") {
            query.height_method = m;
        }
        if let Some(m) = var("RPC_FAILOVER_SAMPLE_METHOD") {
            query.sample_method = m;
        }

        let config = Self {
            chains,
            probe_interval: secs("RPC_FAILOVER_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.probe_interval),
            probe_timeout: secs("RPC_FAILOVER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.probe_timeout),
            idle_timeout: secs("RPC_FAILOVER_IDLE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            max_concurrent_probes: secs("RPC_FAILOVER_MAX_CONCURRENCY")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_concurrent_probes),
            prefer_private: var("RPC_FAILOVER_PREFER_PRIVATE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            default_url: var("RPC_FAILOVER_DEFAULT_URL").unwrap_or_else(|| DEFAULT_URL.to_string()),
            query,
            ..defaults
        };
        config.validate()
    }

    /// Check invariants and normalize candidate lists.
    ///
    /// Misconfiguration is fatal here and only here: a chain with no
    /// candidates, a bad URL, or an empty fallback never reaches steady state.
    pub fn validate(mut self) -> Result<Self> {
        if self.chains.is_empty() {
            return Err(FailoverError::Config("no chains configured".into()));
        }
        if self.max_concurrent_probes == 0 {
            return Err(FailoverError::Config(
                "max_concurrent_probes must be at least 1".into(),
            ));
        }

        let mut seen_chains = HashSet::new();
        for chain in &mut self.chains {
            if !seen_chains.insert(chain.chain_id.clone()) {
                return Err(FailoverError::Config(format!(
                    "chain {} configured twice",
                    chain.chain_id
                )));
            }
            if chain.candidates.is_empty() {
                return Err(FailoverError::Config(format!(
                    "chain {} has no candidate endpoints",
                    chain.chain_id
                )));
            }
            if chain.fallback_url.is_empty() {
                return Err(FailoverError::Config(format!(
                    "chain {} has no fallback URL",
                    chain.chain_id
                )));
            }

            if chain.fallback_in_pool() {
                tracing::warn!(
                    chain_id = %chain.chain_id,
                    fallback_url = %chain.fallback_url,
                    "fallback URL is also a candidate; set a dedicated fallback"
                );
            }

            let mut seen = HashSet::new();
            chain.candidates.retain(|c| {
                let fresh = seen.insert(c.url.clone());
                if !fresh {
                    tracing::warn!(
                        chain_id = %chain.chain_id,
                        url = %c.url,
                        "duplicate candidate endpoint ignored"
                    );
                }
                fresh
            });

            for url in chain
                .candidates
                .iter()
                .map(|c| c.url.as_str())
                .chain(std::iter::once(chain.fallback_url.as_str()))
            {
                Url::parse(url).map_err(|e| {
                    FailoverError::Config(format!(
                        "chain {}: invalid endpoint URL {url}: {e}",
                        chain.chain_id
                    ))
                })?;
            }
        }
        Ok(self)
    }

    pub fn chain(&self, chain_id: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_segment(chain_id: &str) -> String {
    chain_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
