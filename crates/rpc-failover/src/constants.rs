use std::time::Duration;

/// How often the scheduler wakes to probe tracked chains.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Per-probe deadline. A probe still in flight after this is dropped.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Chains not queried for this long are skipped outside warm-up.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Persisted selections older than this are ignored at startup.
pub const SELECTION_TTL: Duration = Duration::from_secs(5 * 60);

/// Height lead over the runner-up beyond which the leader is treated as bogus.
pub const FUTURE_THRESHOLD: u64 = 1000;

/// Height deficit behind the accepted best beyond which a node is stale.
pub const LAG_THRESHOLD: u64 = 50;

/// Upper bound on concurrent probes within one chain.
pub const MAX_CONCURRENT_PROBES: usize = 8;

/// JSON-RPC method returning the freshness counter.
pub const HEIGHT_METHOD: &str = "eth_blockNumber";

/// JSON-RPC method used as a real-data sanity sample.
pub const SAMPLE_METHOD: &str = "eth_gasPrice";

/// Storage key namespace for persisted selections.
pub const STORAGE_PREFIX: &str = "rpc-failover";

/// Answer for chain ids that were never configured.
pub const DEFAULT_URL: &str = "http://127.0.0.1:8545";
