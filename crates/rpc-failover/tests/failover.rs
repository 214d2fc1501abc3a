use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use rpc_failover::storage::{selection_key, store_selection};
use rpc_failover::{
    CandidateEndpoint, ChainConfig, Clock, ErrorReporter, FailoverConfig, FailoverError,
    InMemoryStorage, ManualClock, RpcFailover, RpcTransport, Storage,
};

const START: i64 = 1_700_000_000_000;
const FALLBACK: &str = "https://fallback.example";

#[derive(Clone)]
enum Behavior {
    Healthy { height: u64, delay: Duration },
    Down,
    Hang,
}

#[derive(Clone, Default)]
struct MockTransport {
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockTransport {
    fn set(&self, url: &str, behavior: Behavior) -> &Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(url.to_string(), behavior);
        self
    }

    fn healthy(&self, url: &str, height: u64, delay_ms: u64) -> &Self {
        self.set(
            url,
            Behavior::Healthy {
                height,
                delay: Duration::from_millis(delay_ms),
            },
        )
    }

    fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

impl RpcTransport for MockTransport {
    async fn post(
        &self,
        url: &str,
        _payload: &Value,
        _timeout: Duration,
    ) -> rpc_failover::Result<Value> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let behavior = self.behaviors.lock().unwrap().get(url).cloned();
        let behavior = behavior.unwrap_or(Behavior::Down);

        match behavior {
            Behavior::Healthy { height, delay } => {
                tokio::time::sleep(delay).await;
                Ok(json!([
                    {"jsonrpc": "2.0", "id": 1, "result": format!("0x{height:x}")},
                    {"jsonrpc": "2.0", "id": 2, "result": "0x3b9aca00"},
                ]))
            }
            Behavior::Down => Err(FailoverError::Transport("connection refused".into())),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

#[derive(Clone, Default)]
struct RecordingReporter {
    events: Arc<Mutex<Vec<(String, Vec<(String, String)>)>>>,
}

impl RecordingReporter {
    fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(e, _)| e.clone())
            .collect()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, event: &str, fields: &[(&str, String)]) {
        self.events.lock().unwrap().push((
            event.to_string(),
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        ));
    }
}

struct Harness {
    failover: RpcFailover<MockTransport>,
    transport: MockTransport,
    storage: Arc<InMemoryStorage>,
    reporter: RecordingReporter,
    clock: Arc<ManualClock>,
}

fn config(chains: Vec<ChainConfig>) -> FailoverConfig {
    let mut config = FailoverConfig::new(chains);
    config.probe_timeout = Duration::from_millis(200);
    config.probe_interval = Duration::from_millis(50);
    config
}

fn chain(id: &str, candidates: Vec<CandidateEndpoint>) -> ChainConfig {
    ChainConfig::new(id, candidates, FALLBACK)
}

fn public(urls: &[&str]) -> Vec<CandidateEndpoint> {
    urls.iter().map(|u| CandidateEndpoint::public(*u)).collect()
}

fn harness_with(
    config: FailoverConfig,
    transport: MockTransport,
    storage: Arc<InMemoryStorage>,
    clock: Arc<ManualClock>,
) -> Harness {
    let reporter = RecordingReporter::default();
    let failover = RpcFailover::builder(config, transport.clone())
        .with_storage(storage.clone())
        .with_reporter(Arc::new(reporter.clone()))
        .with_clock(clock.clone())
        .build()
        .unwrap();
    Harness {
        failover,
        transport,
        storage,
        reporter,
        clock,
    }
}

fn harness(config: FailoverConfig, transport: MockTransport) -> Harness {
    harness_with(
        config,
        transport,
        Arc::new(InMemoryStorage::new()),
        Arc::new(ManualClock::new(START)),
    )
}

#[tokio::test]
async fn test_fastest_of_equal_height_public_wins() {
    let transport = MockTransport::default();
    transport
        .healthy("https://slow.example", 5000, 120)
        .healthy("https://fast.example", 5000, 10);

    let h = harness(
        config(vec![chain(
            "1",
            public(&["https://slow.example", "https://fast.example"]),
        )]),
        transport,
    );

    let report = h.failover.run_cycle(true).await;
    assert_eq!(report.probed, vec!["1".to_string()]);
    assert!(report.degraded.is_empty());

    let endpoints = h.failover.current_endpoints("1");
    assert_eq!(endpoints.primary, "https://fast.example");
    assert_eq!(endpoints.secondary, FALLBACK);

    // The new primary is persisted under the public-tier key
    let raw = h
        .storage
        .get(&selection_key("1", false))
        .unwrap()
        .unwrap();
    let record: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(record["rpcUrl"], "https://fast.example");
    assert_eq!(record["timestampMillis"], START);
}

#[tokio::test]
async fn test_idle_chain_is_not_probed() {
    let transport = MockTransport::default();
    transport
        .healthy("https://a.example", 10, 1)
        .healthy("https://b.example", 10, 1);
    let h = harness(
        config(vec![chain("1", public(&["https://a.example", "https://b.example"]))]),
        transport,
    );

    // Never used and not warming up: skipped.
    let report = h.failover.run_cycle(false).await;
    assert_eq!(report.skipped, vec!["1".to_string()]);
    assert_eq!(h.transport.total_calls(), 0);

    // Used recently: probed.
    h.failover.current_endpoints("1");
    h.clock.advance(Duration::from_secs(30));
    h.failover.run_cycle(false).await;
    assert_eq!(h.transport.calls("https://a.example"), 1);
    assert_eq!(h.transport.calls("https://b.example"), 1);

    // Idle past the timeout: skipped again.
    h.clock.advance(Duration::from_secs(31));
    let report = h.failover.run_cycle(false).await;
    assert!(report.probed.is_empty());
    assert_eq!(h.transport.total_calls(), 2);

    // Warm-up ignores idleness.
    h.failover.run_cycle(true).await;
    assert_eq!(h.transport.total_calls(), 4);
}

#[tokio::test]
async fn test_single_candidate_chain_is_never_probed() {
    let transport = MockTransport::default();
    transport.healthy("https://only.example", 10, 1);
    let h = harness(
        config(vec![chain("solo", public(&["https://only.example"]))]),
        transport,
    );

    let report = h.failover.run_cycle(true).await;
    assert_eq!(report.skipped, vec!["solo".to_string()]);
    assert_eq!(h.transport.total_calls(), 0);
    assert_eq!(
        h.failover.current_endpoints("solo").primary,
        "https://only.example"
    );
}

#[tokio::test]
async fn test_timeout_and_future_height_anomaly() {
    let transport = MockTransport::default();
    transport
        .set("https://hang.example", Behavior::Hang)
        .healthy("https://future.example", 51_200, 5)
        .healthy("https://sane.example", 50_000, 40);

    let h = harness(
        config(vec![chain(
            "1",
            public(&[
                "https://hang.example",
                "https://future.example",
                "https://sane.example",
            ]),
        )]),
        transport,
    );

    let started = Instant::now();
    h.failover.run_cycle(true).await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(
        h.failover.current_endpoints("1").primary,
        "https://sane.example"
    );

    let snapshot = h.failover.snapshot("1").unwrap();
    assert_eq!(snapshot.last_results.len(), 3);
    let hung = &snapshot.last_results[0];
    assert_eq!(hung.url, "https://hang.example");
    assert!(!hung.succeeded);
    assert!(hung.round_trip_ms.is_none());
    assert!(hung.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(snapshot.best_height_gap, Some(0));
}

#[tokio::test]
async fn test_all_probes_failing_degrades_to_fallback() {
    let transport = MockTransport::default();
    transport
        .set("https://a.example", Behavior::Down)
        .set("https://b.example", Behavior::Down);
    let h = harness(
        config(vec![chain("1", public(&["https://a.example", "https://b.example"]))]),
        transport,
    );

    let notified = Arc::new(AtomicUsize::new(0));
    let _sub = {
        let notified = Arc::clone(&notified);
        h.failover.subscribe(move |e| {
            assert_eq!(e.chain_id, "1");
            notified.fetch_add(1, Ordering::SeqCst);
        })
    };

    let report = h.failover.run_cycle(true).await;
    assert_eq!(report.degraded, vec!["1".to_string()]);

    let endpoints = h.failover.current_endpoints("1");
    assert_eq!(endpoints.primary, FALLBACK);
    assert_eq!(endpoints.secondary, FALLBACK);
    assert!(h.failover.snapshot("1").unwrap().degraded);

    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(h.reporter.events(), vec!["no_successful_probes".to_string()]);
    // Fallback choices are not persisted.
    assert!(h.storage.get(&selection_key("1", false)).unwrap().is_none());

    // Recovery on the next cycle
    h.transport.healthy("https://b.example", 100, 1);
    h.failover.run_cycle(true).await;
    assert_eq!(h.failover.current_endpoints("1").primary, "https://b.example");
    assert!(!h.failover.snapshot("1").unwrap().degraded);
    assert_eq!(notified.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_restart_uses_fresh_persisted_selection_only() {
    let storage = Arc::new(InMemoryStorage::new());
    let chains = vec![chain("1", public(&["https://a.example", "https://b.example"]))];

    // A previous process chose b one minute ago.
    store_selection(
        storage.as_ref(),
        &selection_key("1", false),
        "https://b.example",
        START - 60_000,
    )
    .unwrap();
    let fresh = harness_with(
        config(chains.clone()),
        MockTransport::default(),
        storage.clone(),
        Arc::new(ManualClock::new(START)),
    );
    assert_eq!(
        fresh.failover.current_endpoints("1").primary,
        "https://b.example"
    );

    // Ten minutes old: ignored, first candidate instead.
    let stale = harness_with(
        config(chains),
        MockTransport::default(),
        storage,
        Arc::new(ManualClock::new(START + 9 * 60_000)),
    );
    assert_eq!(
        stale.failover.current_endpoints("1").primary,
        "https://a.example"
    );
}

#[tokio::test]
async fn test_private_tier_prefers_private_and_gates_probing() {
    let transport = MockTransport::default();
    transport
        .healthy("https://public.example", 700, 5)
        .healthy("https://paid.example", 700, 60);

    let h = harness(
        config(vec![chain(
            "1",
            vec![
                CandidateEndpoint::public("https://public.example"),
                CandidateEndpoint::private("https://paid.example"),
            ],
        )]),
        transport,
    );

    // Public tier never probes private endpoints.
    h.failover.run_cycle(true).await;
    assert_eq!(h.transport.calls("https://paid.example"), 0);
    assert_eq!(
        h.failover.current_endpoints("1"),
        rpc_failover::Endpoints::new("https://public.example", FALLBACK)
    );

    h.failover.set_prefer_private(true);
    h.failover.run_cycle(true).await;
    assert_eq!(h.transport.calls("https://paid.example"), 1);
    assert_eq!(
        h.failover.current_endpoints("1"),
        rpc_failover::Endpoints::new("https://paid.example", "https://public.example")
    );
    assert!(h
        .storage
        .get(&selection_key("1", true))
        .unwrap()
        .unwrap()
        .contains("https://paid.example"));
}

#[tokio::test]
async fn test_unknown_chain_gets_default_and_is_reported_once() {
    let h = harness(
        config(vec![chain("1", public(&["https://a.example", "https://b.example"]))]),
        MockTransport::default(),
    );

    let endpoints = h.failover.current_endpoints("nope");
    assert_eq!(endpoints.primary, rpc_failover::constants::DEFAULT_URL);
    assert_eq!(endpoints.secondary, rpc_failover::constants::DEFAULT_URL);
    h.failover.current_endpoints("nope");
    assert_eq!(h.reporter.events(), vec!["unknown_chain".to_string()]);
}

#[tokio::test]
async fn test_chains_are_independent() {
    let transport = MockTransport::default();
    transport
        .healthy("https://a1.example", 10, 1)
        .healthy("https://b1.example", 10, 30)
        .set("https://a2.example", Behavior::Down)
        .set("https://b2.example", Behavior::Down);

    let h = harness(
        config(vec![
            chain("one", public(&["https://a1.example", "https://b1.example"])),
            chain("two", public(&["https://a2.example", "https://b2.example"])),
        ]),
        transport,
    );

    let report = h.failover.run_cycle(true).await;
    assert_eq!(report.probed, vec!["one".to_string(), "two".to_string()]);
    assert_eq!(report.degraded, vec!["two".to_string()]);
    assert_eq!(h.failover.current_endpoints("one").primary, "https://a1.example");
    assert_eq!(h.failover.current_endpoints("two").primary, FALLBACK);
}

#[tokio::test]
async fn test_background_loop_warms_up_and_stops() {
    let transport = MockTransport::default();
    transport
        .healthy("https://a.example", 10, 20)
        .healthy("https://b.example", 10, 1);
    let h = harness(
        config(vec![chain("1", public(&["https://a.example", "https://b.example"]))]),
        transport,
    );

    let mut changes = h.failover.changes();
    h.failover.start();
    assert!(h.failover.is_running());

    let event = tokio::time::timeout(Duration::from_secs(2), changes.recv())
        .await
        .expect("warm-up cycle should notify")
        .unwrap();
    assert_eq!(event.chain_id, "1");
    assert_eq!(h.failover.current_endpoints("1").primary, "https://b.example");

    h.failover.stop().await;
    assert!(!h.failover.is_running());

    // Nothing probes after stop.
    let calls = h.transport.total_calls();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.transport.total_calls(), calls);
}

#[tokio::test]
async fn test_stop_cancels_in_flight_probes_without_persisting() {
    let transport = MockTransport::default();
    transport
        .set("https://a.example", Behavior::Hang)
        .set("https://b.example", Behavior::Hang);

    let mut cfg = config(vec![chain("1", public(&["https://a.example", "https://b.example"]))]);
    cfg.probe_timeout = Duration::from_secs(30);
    let h = harness(cfg, transport);

    let notified = Arc::new(AtomicUsize::new(0));
    let _sub = {
        let notified = Arc::clone(&notified);
        h.failover
            .subscribe(move |_| {
                notified.fetch_add(1, Ordering::SeqCst);
            })
    };

    h.failover.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.total_calls(), 2);

    let started = Instant::now();
    h.failover.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(notified.load(Ordering::SeqCst), 0);
    assert!(h.storage.get(&selection_key("1", false)).unwrap().is_none());
    assert_eq!(h.failover.snapshot("1").unwrap().last_probe_at, None);
}

#[tokio::test]
async fn test_manual_cycle_runs_after_stop() {
    let transport = MockTransport::default();
    transport
        .healthy("https://a.example", 10, 15)
        .healthy("https://b.example", 10, 1);
    let h = harness(
        config(vec![chain("1", public(&["https://a.example", "https://b.example"]))]),
        transport,
    );

    h.failover.start();
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.failover.stop().await;
    let calls = h.transport.total_calls();

    let report = h.failover.run_cycle(true).await;
    assert!(!report.cancelled);
    assert_eq!(report.probed, vec!["1".to_string()]);
    assert_eq!(h.transport.total_calls(), calls + 2);
    assert!(!h.failover.is_running());
}

#[tokio::test]
async fn test_panicking_listener_keeps_loop_alive() {
    let transport = MockTransport::default();
    transport
        .healthy("https://a.example", 10, 1)
        .healthy("https://b.example", 10, 1);
    let h = harness(
        config(vec![chain("1", public(&["https://a.example", "https://b.example"]))]),
        transport,
    );

    h.failover.subscribe(|_| panic!("consumer bug")).detach();
    let notified = Arc::new(AtomicUsize::new(0));
    let _sub = {
        let notified = Arc::clone(&notified);
        h.failover.subscribe(move |_| {
            notified.fetch_add(1, Ordering::SeqCst);
        })
    };

    // Keep the chain out of the idle window so later cycles probe it too.
    h.failover.current_endpoints("1");
    h.failover.start();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(h.failover.is_running());
    assert!(notified.load(Ordering::SeqCst) >= 2);
    assert!(h.transport.total_calls() >= 4);

    h.failover.stop().await;
}

struct ReadOnlyStorage;

impl Storage for ReadOnlyStorage {
    fn get(&self, _key: &str) -> rpc_failover::Result<Option<String>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &str) -> rpc_failover::Result<()> {
        Err(FailoverError::Storage("disk full".into()))
    }
}

#[tokio::test]
async fn test_persist_failure_does_not_abort_cycle() {
    let transport = MockTransport::default();
    transport
        .healthy("https://a.example", 10, 40)
        .healthy("https://b.example", 10, 1);
    let reporter = RecordingReporter::default();
    let failover = RpcFailover::builder(
        config(vec![chain("1", public(&["https://a.example", "https://b.example"]))]),
        transport,
    )
    .with_storage(Arc::new(ReadOnlyStorage))
    .with_reporter(Arc::new(reporter.clone()))
    .with_clock(Arc::new(ManualClock::new(START)))
    .build()
    .unwrap();

    let notified = Arc::new(AtomicUsize::new(0));
    let _sub = {
        let notified = Arc::clone(&notified);
        failover.subscribe(move |_| {
            notified.fetch_add(1, Ordering::SeqCst);
        })
    };

    let report = failover.run_cycle(true).await;
    assert!(report.degraded.is_empty());
    assert_eq!(failover.current_endpoints("1").primary, "https://b.example");
    assert_eq!(reporter.events(), vec!["persist_failed".to_string()]);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_future_dated_persisted_selection_is_ignored() {
    let storage = Arc::new(InMemoryStorage::new());
    store_selection(
        storage.as_ref(),
        &selection_key("1", false),
        "https://b.example",
        START + 365 * 24 * 3_600_000,
    )
    .unwrap();

    let h = harness_with(
        config(vec![chain("1", public(&["https://a.example", "https://b.example"]))]),
        MockTransport::default(),
        storage,
        Arc::new(ManualClock::new(START)),
    );
    assert_eq!(h.failover.current_endpoints("1").primary, "https://a.example");
}

#[tokio::test]
async fn test_usage_is_stamped_with_clock() {
    let h = harness(
        config(vec![chain("1", public(&["https://a.example", "https://b.example"]))]),
        MockTransport::default(),
    );
    assert_eq!(h.failover.snapshot("1").unwrap().last_used_at, None);
    h.clock.advance(Duration::from_millis(1500));
    h.failover.current_endpoints("1");
    assert_eq!(
        h.failover.snapshot("1").unwrap().last_used_at,
        Some(h.clock.now_millis())
    );
}

#[test]
fn test_config_errors_fail_at_build() {
    let result = RpcFailover::builder(
        FailoverConfig::new(vec![chain("1", vec![])]),
        MockTransport::default(),
    )
    .build();
    assert!(matches!(result, Err(FailoverError::Config(_))));
}
