//! Public query and lifecycle surface.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::{ChainConfig, FailoverConfig};
use crate::endpoint::Endpoints;
use crate::error::Result;
use crate::notify::{ChangeEvent, Notifier, Subscription};
use crate::report::{events, ErrorReporter, TracingReporter};
use crate::scheduler::{CycleReport, Scheduler};
use crate::state::{ChainSnapshot, StateStore};
use crate::storage::{load_selection, selection_key, InMemoryStorage, Storage};
use crate::transport::{HttpTransport, RpcTransport};

/// Builder for [`RpcFailover`].
pub struct FailoverBuilder<T: RpcTransport> {
    config: FailoverConfig,
    transport: Arc<T>,
    storage: Arc<dyn Storage>,
    reporter: Arc<dyn ErrorReporter>,
    clock: Arc<dyn Clock>,
}

impl<T: RpcTransport> FailoverBuilder<T> {
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and initialize every chain.
    ///
    /// Each chain starts on its persisted primary when a fresh record exists
    /// and still names a configured candidate, otherwise on the first
    /// candidate of the account's tier.
    pub fn build(self) -> Result<RpcFailover<T>> {
        let config = self.config.validate()?;
        let state = Arc::new(StateStore::new());
        let now = self.clock.now_millis();

        for chain in &config.chains {
            let initial = initial_endpoints(
                chain,
                self.storage.as_ref(),
                config.prefer_private,
                now,
                config.selection_ttl,
            );
            tracing::debug!(
                chain_id = %chain.chain_id,
                primary = %initial.primary,
                secondary = %initial.secondary,
                "chain initialized"
            );
            state.initialize(chain.clone(), initial);
        }

        let notifier = Notifier::new();
        let default_url = config.default_url.clone();
        let scheduler = Arc::new(Scheduler::new(
            config,
            self.transport,
            Arc::clone(&state),
            self.storage,
            self.reporter,
            notifier.clone(),
            self.clock,
        ));

        Ok(RpcFailover {
            state,
            notifier,
            scheduler,
            default_url,
            unknown_reported: DashMap::new(),
            task: Mutex::new(None),
        })
    }
}

fn initial_endpoints(
    chain: &ChainConfig,
    storage: &dyn Storage,
    prefer_private: bool,
    now: i64,
    ttl: std::time::Duration,
) -> Endpoints {
    let key = selection_key(&chain.chain_id, prefer_private);
    let cached = load_selection(storage, &key, now, ttl)
        .filter(|url| chain.candidates.iter().any(|c| &c.url == url));

    let primary = cached
        .or_else(|| chain.default_candidate(prefer_private).map(|c| c.url.clone()))
        .unwrap_or_else(|| chain.fallback_url.clone());

    let secondary = if prefer_private {
        chain
            .candidates
            .iter()
            .find(|c| !c.is_private && c.url != primary)
            .map(|c| c.url.clone())
            .unwrap_or_else(|| chain.fallback_url.clone())
    } else {
        chain.fallback_url.clone()
    };
    Endpoints::new(primary, secondary)
}

/// Tracks endpoint health for every configured chain and publishes the
/// primary/secondary pair callers should use.
///
/// Queries never block on the network and never fail. Probing runs on a
/// background task between [`start`](Self::start) and [`stop`](Self::stop).
pub struct RpcFailover<T: RpcTransport = HttpTransport> {
    state: Arc<StateStore>,
    notifier: Notifier,
    scheduler: Arc<Scheduler<T>>,
    default_url: String,
    unknown_reported: DashMap<String, ()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcFailover<HttpTransport> {
    /// HTTP transport, in-memory storage, system clock, tracing reporter.
    pub fn http(config: FailoverConfig) -> Result<Self> {
        Self::builder(config, HttpTransport::new()).build()
    }
}

impl<T: RpcTransport> RpcFailover<T> {
    pub fn builder(config: FailoverConfig, transport: T) -> FailoverBuilder<T> {
        FailoverBuilder {
            config,
            transport: Arc::new(transport),
            storage: Arc::new(InMemoryStorage::new()),
            reporter: Arc::new(TracingReporter),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn new(config: FailoverConfig, transport: T, storage: Arc<dyn Storage>) -> Result<Self> {
        Self::builder(config, transport).with_storage(storage).build()
    }

    /// Endpoints to use for `chain_id` right now. Marks the chain as in use.
    ///
    /// Unknown chain ids get the configured default URL in both slots.
    pub fn current_endpoints(&self, chain_id: &str) -> Endpoints {
        let now = self.scheduler.clock().now_millis();
        if self.state.record_usage(chain_id, now) {
            if let Some(endpoints) = self.state.endpoints(chain_id) {
                return endpoints;
            }
        }

        if self
            .unknown_reported
            .insert(chain_id.to_string(), ())
            .is_none()
        {
            self.scheduler.reporter().report(
                events::UNKNOWN_CHAIN,
                &[
                    ("chain_id", chain_id.to_string()),
                    ("default_url", self.default_url.clone()),
                ],
            );
        }
        Endpoints::both(self.default_url.clone())
    }

    /// Register a listener called with the chain id after every applied
    /// selection. Listener order is unspecified.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(listener)
    }

    /// Async stream of change events.
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.notifier.changes()
    }

    pub fn snapshot(&self, chain_id: &str) -> Option<ChainSnapshot> {
        self.state.snapshot(chain_id)
    }

    pub fn chain_ids(&self) -> Vec<String> {
        self.state.chain_ids()
    }

    pub fn prefer_private(&self) -> bool {
        self.scheduler.prefer_private()
    }

    /// Switch account tier; the next cycle probes and selects accordingly.
    pub fn set_prefer_private(&self, prefer_private: bool) {
        self.scheduler.set_prefer_private(prefer_private);
    }

    /// Run one probe cycle immediately, outside the background loop.
    pub async fn run_cycle(&self, warm_up: bool) -> CycleReport {
        self.scheduler.run_cycle(warm_up).await
    }

    /// Spawn the background loop. Must be called inside a tokio runtime.
    /// Calling it while already running is a no-op.
    pub fn start(&self) {
        let mut task = self.lock_task();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::debug!("rpc failover already running");
            return;
        }
        self.scheduler.arm();
        *task = Some(tokio::spawn(Arc::clone(&self.scheduler).run()));
    }

    /// Stop the background loop, cancelling in-flight probes. Results of an
    /// interrupted cycle are discarded and not persisted.
    pub async fn stop(&self) {
        self.scheduler.request_shutdown();
        let handle = self.lock_task().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "rpc failover task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_task().as_ref().is_some_and(|t| !t.is_finished())
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.task.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: RpcTransport> Drop for RpcFailover<T> {
    fn drop(&mut self) {
        self.scheduler.request_shutdown();
    }
}
