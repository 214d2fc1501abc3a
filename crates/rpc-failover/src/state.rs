//! In-memory per-chain tracking state.
//!
//! One DashMap entry per chain. Every operation touches a single entry for a
//! short critical section, so chains never contend with each other. The
//! scheduler is the only writer of selections; readers may run concurrently.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::ChainConfig;
use crate::endpoint::{CandidateEndpoint, Endpoints, ProbeResult};

const NEVER: i64 = i64::MIN;

struct ChainState {
    config: ChainConfig,
    endpoints: Endpoints,
    last_used_at: AtomicI64,
    last_probe_at: Option<i64>,
    last_results: Vec<ProbeResult>,
    best_height_gap: Option<u64>,
    degraded: bool,
}

/// Point-in-time view of one chain, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSnapshot {
    pub chain_id: String,
    pub candidates: Vec<CandidateEndpoint>,
    pub fallback_url: String,
    pub endpoints: Endpoints,
    pub last_used_at: Option<i64>,
    pub last_probe_at: Option<i64>,
    pub last_results: Vec<ProbeResult>,
    pub best_height_gap: Option<u64>,
    /// True while both slots hold the fallback because every probe failed.
    pub degraded: bool,
}

#[derive(Default)]
pub struct StateStore {
    chains: DashMap<String, ChainState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a chain. Re-initializing replaces the previous state.
    pub fn initialize(&self, config: ChainConfig, initial: Endpoints) {
        let chain_id = config.chain_id.clone();
        self.chains.insert(
            chain_id,
            ChainState {
                config,
                endpoints: initial,
                last_used_at: AtomicI64::new(NEVER),
                last_probe_at: None,
                last_results: Vec::new(),
                best_height_gap: None,
                degraded: false,
            },
        );
    }

    pub fn contains(&self, chain_id: &str) -> bool {
        self.chains.contains_key(chain_id)
    }

    pub fn chain_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.chains.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn config(&self, chain_id: &str) -> Option<ChainConfig> {
        self.chains.get(chain_id).map(|s| s.config.clone())
    }

    /// Stamp the chain as used at `now_millis`. Takes only a shared lock.
    pub fn record_usage(&self, chain_id: &str, now_millis: i64) -> bool {
        match self.chains.get(chain_id) {
            Some(state) => {
                state.last_used_at.store(now_millis, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn last_used_at(&self, chain_id: &str) -> Option<i64> {
        self.chains.get(chain_id).and_then(|s| {
            let at = s.last_used_at.load(Ordering::Relaxed);
            (at != NEVER).then_some(at)
        })
    }

    pub fn endpoints(&self, chain_id: &str) -> Option<Endpoints> {
        self.chains.get(chain_id).map(|s| s.endpoints.clone())
    }

    /// Replace both slots at once. Returns the previous endpoints, or `None`
    /// if the chain is not tracked.
    pub fn apply_selection(&self, chain_id: &str, endpoints: Endpoints) -> Option<Endpoints> {
        let mut state = self.chains.get_mut(chain_id)?;
        Some(std::mem::replace(&mut state.endpoints, endpoints))
    }

    /// Keep the last cycle's raw results for diagnostics.
    pub fn record_cycle(
        &self,
        chain_id: &str,
        results: Vec<ProbeResult>,
        best_height_gap: Option<u64>,
        at_millis: i64,
    ) {
        if let Some(mut state) = self.chains.get_mut(chain_id) {
            state.degraded = best_height_gap.is_none();
            state.last_results = results;
            state.best_height_gap = best_height_gap;
            state.last_probe_at = Some(at_millis);
        }
    }

    pub fn snapshot(&self, chain_id: &str) -> Option<ChainSnapshot> {
        self.chains.get(chain_id).map(|s| {
            let last_used_at = s.last_used_at.load(Ordering::Relaxed);
            ChainSnapshot {
                chain_id: s.config.chain_id.clone(),
                candidates: s.config.candidates.clone(),
                fallback_url: s.config.fallback_url.clone(),
                endpoints: s.endpoints.clone(),
                last_used_at: (last_used_at != NEVER).then_some(last_used_at),
                last_probe_at: s.last_probe_at,
                last_results: s.last_results.clone(),
                best_height_gap: s.best_height_gap,
                degraded: s.degraded,
            }
        })
    }
}
