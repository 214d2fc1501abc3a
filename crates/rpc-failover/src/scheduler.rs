//! The probe loop: plan → probe → select → apply, then sleep.
//!
//! At most one cycle is in flight at a time. A cycle first probes every
//! eligible chain concurrently and only then applies results, so a shutdown
//! arriving mid-probe drops the in-flight requests and skips persistence.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;

use crate::clock::{millis, Clock};
use crate::config::FailoverConfig;
use crate::endpoint::{CandidateEndpoint, Endpoints, ProbeResult};
use crate::metrics;
use crate::notify::Notifier;
use crate::prober::Prober;
use crate::report::{events, ErrorReporter};
use crate::selector::{self, SelectorPolicy};
use crate::state::StateStore;
use crate::storage::{selection_key, store_selection, Storage};
use crate::transport::RpcTransport;

/// Work for one chain in one cycle.
#[derive(Debug, Clone)]
struct ProbePlan {
    chain_id: String,
    candidates: Vec<CandidateEndpoint>,
    fallback_url: String,
}

/// What a cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Chains probed and applied, in chain-id order.
    pub probed: Vec<String>,
    /// Chains skipped as idle or single-candidate.
    pub skipped: Vec<String>,
    /// Chains that fell back because nothing answered usefully.
    pub degraded: Vec<String>,
    /// Shutdown interrupted the probe phase; nothing was applied.
    pub cancelled: bool,
}

pub struct Scheduler<T: RpcTransport> {
    config: FailoverConfig,
    prober: Prober<T>,
    state: Arc<StateStore>,
    storage: Arc<dyn Storage>,
    reporter: Arc<dyn ErrorReporter>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    policy: SelectorPolicy,
    prefer_private: AtomicBool,
    cycle_lock: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl<T: RpcTransport> Scheduler<T> {
    pub(crate) fn new(
        config: FailoverConfig,
        transport: Arc<T>,
        state: Arc<StateStore>,
        storage: Arc<dyn Storage>,
        reporter: Arc<dyn ErrorReporter>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let prober = Prober::new(transport, Arc::clone(&clock), &config.query);
        let policy = SelectorPolicy {
            future_threshold: config.future_threshold,
            lag_threshold: config.lag_threshold,
        };
        let prefer_private = AtomicBool::new(config.prefer_private);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            prober,
            state,
            storage,
            reporter,
            notifier,
            clock,
            policy,
            prefer_private,
            cycle_lock: tokio::sync::Mutex::new(()),
            shutdown,
        }
    }

    pub fn prefer_private(&self) -> bool {
        self.prefer_private.load(Ordering::Relaxed)
    }

    /// Switch account tier. Takes effect from the next cycle.
    pub fn set_prefer_private(&self, prefer_private: bool) {
        self.prefer_private.store(prefer_private, Ordering::Relaxed);
    }

    pub(crate) fn reporter(&self) -> &Arc<dyn ErrorReporter> {
        &self.reporter
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Clear a previous stop request so the loop can run again.
    pub(crate) fn arm(&self) {
        self.shutdown.send_replace(false);
    }

    /// Ask the loop (and any in-flight cycle) to stop.
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run cycles until shutdown. The first cycle runs in warm-up mode.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!(
            chains = self.state.chain_ids().len(),
            interval_ms = self.config.probe_interval.as_millis() as u64,
            prefer_private = self.prefer_private(),
            "rpc failover scheduler started"
        );

        let mut warm_up = true;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.cycle(warm_up, wait_for_shutdown(&mut shutdown)).await;
            if report.cancelled {
                break;
            }
            warm_up = false;

            // A fresh timer per cycle: a slow cycle delays the next one
            // instead of stacking up ticks.
            tokio::select! {
                _ = tokio::time::sleep(self.config.probe_interval) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        tracing::info!("rpc failover scheduler stopped");
    }

    /// Run one cycle now. Waits for any cycle already in flight.
    ///
    /// Works whether or not the background loop is running. Only a stop
    /// requested after the call begins cancels it.
    pub async fn run_cycle(&self, warm_up: bool) -> CycleReport {
        let mut shutdown = self.shutdown.subscribe();
        self.cycle(warm_up, wait_for_new_shutdown(&mut shutdown)).await
    }

    async fn cycle(&self, warm_up: bool, shutdown: impl Future<Output = ()>) -> CycleReport {
        let _in_flight = self.cycle_lock.lock().await;
        let prefer_private = self.prefer_private();
        let (plans, skipped) = self.plan(warm_up, prefer_private);

        let mut report = CycleReport {
            skipped,
            ..Default::default()
        };
        if plans.is_empty() {
            tracing::debug!(warm_up, "no chains eligible for probing");
            return report;
        }

        let probing = join_all(plans.iter().map(|plan| self.probe_chain(plan)));
        let batches = tokio::select! {
            batches = probing => batches,
            _ = shutdown => {
                tracing::info!("shutdown during probe cycle, discarding partial results");
                report.cancelled = true;
                return report;
            }
        };

        for (plan, results) in plans.iter().zip(batches) {
            if !self.apply(plan, results, prefer_private) {
                report.degraded.push(plan.chain_id.clone());
            }
            report.probed.push(plan.chain_id.clone());
        }
        report
    }

    /// Split tracked chains into those to probe now and those to skip.
    fn plan(&self, warm_up: bool, prefer_private: bool) -> (Vec<ProbePlan>, Vec<String>) {
        let now = self.clock.now_millis();
        let idle_ms = millis(self.config.idle_timeout);
        let mut plans = Vec::new();
        let mut skipped = Vec::new();

        for chain_id in self.state.chain_ids() {
            let Some(config) = self.state.config(&chain_id) else {
                continue;
            };
            let recently_used = self
                .state
                .last_used_at(&chain_id)
                .is_some_and(|at| now.saturating_sub(at) < idle_ms);

            // Private endpoints are only worth probing for accounts that use them.
            let candidates: Vec<CandidateEndpoint> = config
                .candidates
                .iter()
                .filter(|c| prefer_private || !c.is_private)
                .cloned()
                .collect();

            if config.candidates.len() <= 1 || candidates.is_empty() || !(warm_up || recently_used)
            {
                tracing::trace!(chain_id = %chain_id, warm_up, recently_used, "chain skipped");
                skipped.push(chain_id);
                continue;
            }

            plans.push(ProbePlan {
                chain_id,
                candidates,
                fallback_url: config.fallback_url,
            });
        }
        (plans, skipped)
    }

    /// Probe every candidate of one chain with bounded concurrency.
    ///
    /// Results come back in candidate order regardless of completion order,
    /// which the selector's tie-break relies on.
    async fn probe_chain(&self, plan: &ProbePlan) -> Vec<ProbeResult> {
        let probes: Vec<_> = plan
            .candidates
            .iter()
            .map(|candidate| {
                self.prober
                    .probe(candidate, &plan.chain_id, self.config.probe_timeout)
            })
            .collect();
        stream::iter(probes)
            .buffered(self.config.max_concurrent_probes)
            .collect()
            .await
    }

    /// Apply one chain's results. Returns false when the chain fell back.
    fn apply(&self, plan: &ProbePlan, results: Vec<ProbeResult>, prefer_private: bool) -> bool {
        let chain_id = plan.chain_id.as_str();
        let now = self.clock.now_millis();

        let outcome = selector::select(
            chain_id,
            &results,
            prefer_private,
            &plan.fallback_url,
            self.policy,
        );

        let healthy = match outcome {
            Ok(selection) => {
                if let Some(url) = &selection.future_rejected {
                    tracing::warn!(
                        chain_id = %chain_id,
                        url = %url,
                        "endpoint reports implausible height, ignored"
                    );
                }
                if !selection.lagging.is_empty() {
                    tracing::debug!(
                        chain_id = %chain_id,
                        lagging = ?selection.lagging,
                        "stale endpoints excluded"
                    );
                }

                let endpoints = Endpoints::new(selection.primary_url, selection.secondary_url);
                self.commit(chain_id, endpoints.clone());
                self.state
                    .record_cycle(chain_id, results, Some(selection.best_height_gap), now);

                let key = selection_key(chain_id, prefer_private);
                if let Err(e) = store_selection(self.storage.as_ref(), &key, &endpoints.primary, now)
                {
                    tracing::error!(chain_id = %chain_id, error = %e, "failed to persist selection");
                    self.reporter.report(
                        events::PERSIST_FAILED,
                        &[("chain_id", chain_id.to_string()), ("error", e.to_string())],
                    );
                }

                metrics::SELECTIONS.with_label_values(&[chain_id, "ok"]).inc();
                metrics::HEIGHT_GAP
                    .with_label_values(&[chain_id])
                    .set(i64::try_from(selection.best_height_gap).unwrap_or(i64::MAX));
                true
            }
            Err(e) => {
                let attempted = results.len();
                self.commit(chain_id, Endpoints::both(plan.fallback_url.clone()));
                self.state.record_cycle(chain_id, results, None, now);

                self.reporter.report(
                    events::NO_SUCCESSFUL_PROBES,
                    &[
                        ("chain_id", chain_id.to_string()),
                        ("attempted", attempted.to_string()),
                        ("fallback", plan.fallback_url.clone()),
                        ("error", e.to_string()),
                    ],
                );
                metrics::SELECTIONS
                    .with_label_values(&[chain_id, "fallback"])
                    .inc();
                false
            }
        };

        self.notifier.notify(chain_id);
        healthy
    }

    fn commit(&self, chain_id: &str, endpoints: Endpoints) {
        let previous = self.state.apply_selection(chain_id, endpoints.clone());
        if previous.as_ref() != Some(&endpoints) {
            tracing::info!(
                chain_id = %chain_id,
                primary = %endpoints.primary,
                secondary = %endpoints.secondary,
                "rpc selection changed"
            );
        }
    }
}

/// Resolves on the next shutdown request, ignoring one already in effect.
async fn wait_for_new_shutdown(rx: &mut watch::Receiver<bool>) {
    while rx.changed().await.is_ok() {
        if *rx.borrow_and_update() {
            return;
        }
    }
    std::future::pending::<()>().await;
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let sender_alive = rx.wait_for(|stop| *stop).await.is_ok();
    if !sender_alive {
        std::future::pending::<()>().await;
    }
}
