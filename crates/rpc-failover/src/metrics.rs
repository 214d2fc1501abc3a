use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use std::sync::LazyLock;

pub static PROBES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "rpc_failover_probe_total",
        "Total endpoint probes",
        &["chain", "result"]
    )
    .unwrap()
});

pub static PROBE_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "rpc_failover_probe_duration_seconds",
        "Round-trip time of successful probes in seconds",
        &["chain"],
        vec![0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap()
});

pub static SELECTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "rpc_failover_selection_total",
        "Selection outcomes per probe cycle",
        &["chain", "outcome"]
    )
    .unwrap()
});

pub static HEIGHT_GAP: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "rpc_failover_height_gap",
        "Blocks between the freshest valid endpoint and the chosen primary",
        &["chain"]
    )
    .unwrap()
});

pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
