//! Prometheus metrics for observability.
//!
//! The registry exposes the operational HTTP metrics recorded here together
//! with every collector from `harvester_core::metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "harvester_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("harvester_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "harvester_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Worker State (collected on scrape)
// =============================================================================

/// Registered processors.
pub static PROCESSORS_REGISTERED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "harvester_processors_registered",
        "Number of processors that passed discovery",
    )
    .unwrap()
});

/// Broker session state (1 = connected, 0 = recovering or closed).
pub static BROKER_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "harvester_broker_connected",
        "Whether the broker session is connected (1) or not (0)",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // Worker
    registry
        .register(Box::new(PROCESSORS_REGISTERED.clone()))
        .unwrap();
    registry
        .register(Box::new(BROKER_CONNECTED.clone()))
        .unwrap();

    // Core metrics (messages, processor runs, gateway, broker)
    for metric in harvester_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Refreshes gauges that mirror application state.
pub fn collect_dynamic_metrics(state: &crate::state::AppState) {
    PROCESSORS_REGISTERED.set(state.registry().len() as i64);
    let connected = state.broker_status() == harvester_core::SessionStatus::Connected;
    BROKER_CONNECTED.set(i64::from(connected));
}
