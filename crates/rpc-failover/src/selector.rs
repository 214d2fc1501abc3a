//! Turns one cycle's probe results into a primary/secondary decision.
//!
//! Pure and deterministic: identical inputs always produce identical output.
//! Ties on round-trip time go to the result that appears first in the input.

use crate::constants::{FUTURE_THRESHOLD, LAG_THRESHOLD};
use crate::endpoint::ProbeResult;
use crate::error::{FailoverError, Result};

/// Height thresholds used to discard implausible or stale endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorPolicy {
    /// Max lead of the highest report over the runner-up before the leader is
    /// treated as reporting from the future.
    pub future_threshold: u64,
    /// Max deficit behind the accepted best height before a node is stale.
    pub lag_threshold: u64,
}

impl Default for SelectorPolicy {
    fn default() -> Self {
        Self {
            future_threshold: FUTURE_THRESHOLD,
            lag_threshold: LAG_THRESHOLD,
        }
    }
}

/// Outcome of a successful selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub primary_url: String,
    pub secondary_url: String,
    /// Freshest valid height minus the primary's height. Informational only.
    pub best_height_gap: u64,
    /// Endpoint discarded for reporting an implausibly high height.
    pub future_rejected: Option<String>,
    /// Endpoints discarded for lagging the accepted best height.
    pub lagging: Vec<String>,
}

/// Pick primary and secondary endpoints for `chain_id`.
///
/// Returns [`FailoverError::NoSuccessfulProbes`] when nothing usable is left;
/// the caller then falls back to `fallback_url` for both slots.
pub fn select(
    chain_id: &str,
    results: &[ProbeResult],
    prefer_private: bool,
    fallback_url: &str,
    policy: SelectorPolicy,
) -> Result<Selection> {
    let no_success = || FailoverError::NoSuccessfulProbes {
        chain_id: chain_id.to_string(),
    };

    let succeeded: Vec<&ProbeResult> = results.iter().filter(|r| r.succeeded).collect();
    if succeeded.is_empty() {
        return Err(no_success());
    }

    // Indices into `succeeded`, highest height first. Stable, so equal
    // heights keep input order.
    let mut by_height: Vec<usize> = (0..succeeded.len()).collect();
    by_height.sort_by(|&a, &b| succeeded[b].height().cmp(&succeeded[a].height()));

    let mut best = by_height[0];
    let mut future_rejected = None;
    if let Some(&second) = by_height.get(1) {
        let lead = succeeded[best].height() - succeeded[second].height();
        if lead > policy.future_threshold {
            future_rejected = Some(best);
            best = second;
        }
    }
    let best_height = succeeded[best].height();

    let mut lagging = Vec::new();
    let valid: Vec<&ProbeResult> = succeeded
        .iter()
        .enumerate()
        .filter(|&(i, r)| {
            if Some(i) == future_rejected {
                return false;
            }
            let stale = best_height.saturating_sub(r.height()) > policy.lag_threshold;
            if stale {
                lagging.push(r.url.clone());
            }
            !stale
        })
        .map(|(_, r)| *r)
        .collect();

    // min_by_key/max_by_key resolve ties differently; fold keeps the first.
    let fastest = first_by(&valid, |candidate, current| {
        candidate.latency() < current.latency()
    })
    .ok_or_else(no_success)?;
    let freshest = first_by(&valid, |candidate, current| {
        candidate.height() > current.height()
    })
    .ok_or_else(no_success)?;

    let (primary, secondary_url) = if prefer_private {
        let private: Vec<&ProbeResult> = valid.iter().copied().filter(|r| r.is_private).collect();
        let primary = first_by(&private, |candidate, current| {
            candidate.latency() < current.latency()
        })
        .unwrap_or(fastest);
        (primary, fastest.url.clone())
    } else {
        (fastest, fallback_url.to_string())
    };

    Ok(Selection {
        primary_url: primary.url.clone(),
        secondary_url,
        best_height_gap: freshest.height().saturating_sub(primary.height()),
        future_rejected: future_rejected.map(|i| succeeded[i].url.clone()),
        lagging,
    })
}

/// First element for which no later element is strictly `better`.
fn first_by<'a>(
    results: &[&'a ProbeResult],
    better: impl Fn(&ProbeResult, &ProbeResult) -> bool,
) -> Option<&'a ProbeResult> {
    results.iter().copied().fold(None, |current, r| match current {
        Some(c) if !better(r, c) => Some(c),
        _ => Some(r),
    })
}
