//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Message handling (outcomes, artifact cleanup)
//! - Processor runs (results, duration, records)
//! - Gateway delivery (batches, latency)
//! - Broker session recovery

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};

// =============================================================================
// Message Handling
// =============================================================================

/// Messages settled, by outcome.
pub static MESSAGES_HANDLED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "harvester_messages_handled_total",
            "Total broker messages settled",
        ),
        // "processed", "processing_failed", "delivery_failed", "unsupported",
        // "undecodable", "requeued"
        &["outcome"],
    )
    .unwrap()
});

/// Artifact deletions after successful processing.
pub static ARTIFACTS_DELETED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "harvester_artifacts_deleted_total",
            "Processed artifacts removed from disk",
        ),
        &["result"], // "deleted", "failed"
    )
    .unwrap()
});

// =============================================================================
// Processor Runs
// =============================================================================

/// Processor runs by processor and result.
pub static PROCESSOR_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("harvester_processor_runs_total", "Total processor runs"),
        &["processor", "result"], // "completed", "failed"
    )
    .unwrap()
});

/// Processor run duration in seconds.
pub static PROCESSOR_RUN_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "harvester_processor_run_duration_seconds",
            "Wall-clock duration of a processor run",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["processor"],
    )
    .unwrap()
});

/// Records emitted by processors.
pub static RECORDS_EMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "harvester_records_emitted_total",
            "Records parsed from processor output and delivered",
        ),
        &["processor"],
    )
    .unwrap()
});

// =============================================================================
// Gateway
// =============================================================================

/// Batches sent to the metrics gateway by result.
pub static BATCHES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("harvester_batches_sent_total", "Batches sent to the gateway"),
        &["result"], // "success", "rejected", "error"
    )
    .unwrap()
});

/// Gateway request duration in seconds.
pub static BATCH_SEND_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "harvester_batch_send_duration_seconds",
            "Duration of gateway requests",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["result"],
    )
    .unwrap()
});

// =============================================================================
// Broker
// =============================================================================

/// Recovery attempts by layer ("connection", "channel") and result.
pub static BROKER_RECOVERIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "harvester_broker_recoveries_total",
            "Broker reconnect and channel recreation attempts",
        ),
        &["layer", "result"], // "success", "failure"
    )
    .unwrap()
});

/// Link failures reported by the broker transport.
pub static BROKER_LINK_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "harvester_broker_link_failures_total",
            "Connection and channel failures reported by the broker",
        ),
        &["layer"],
    )
    .unwrap()
});

/// Returns all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        Box::new(MESSAGES_HANDLED.clone()),
        Box::new(ARTIFACTS_DELETED.clone()),
        Box::new(PROCESSOR_RUNS.clone()),
        Box::new(PROCESSOR_RUN_DURATION.clone()),
        Box::new(RECORDS_EMITTED.clone()),
        Box::new(BATCHES_SENT.clone()),
        Box::new(BATCH_SEND_DURATION.clone()),
        Box::new(BROKER_RECOVERIES.clone()),
        Box::new(BROKER_LINK_FAILURES.clone()),
    ]
}
