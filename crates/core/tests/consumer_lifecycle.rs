//! Consumer lifecycle integration tests.
//!
//! Messages go through the in-memory broker and a real broker session into
//! the consumer; processors and the gateway are scripted.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use harvester_core::{
    config::BrokerConfig,
    runner::{FailureCause, RunFailure},
    testing::{fixtures, AckRecord, MemoryBroker, RecordingSink, ScriptedRunner},
    ProcessingEvent, ProcessorRegistry, Record, ResultConsumer, SessionHandle, SessionManager,
};

const KEY: &str = "cpu-usage/host";

/// Test helper wiring a consumer to an in-memory broker.
struct TestHarness {
    broker: MemoryBroker,
    runner: ScriptedRunner,
    sink: RecordingSink,
    session: SessionHandle,
    temp_dir: TempDir,
}

impl TestHarness {
    async fn new(batch_size: usize) -> Self {
        let broker = MemoryBroker::new();
        let runner = ScriptedRunner::new();
        let sink = RecordingSink::new();

        let registry = Arc::new(ProcessorRegistry::new(vec![fixtures::descriptor(
            "cpu", &[KEY],
        )]));
        let consumer = ResultConsumer::new(
            Arc::clone(&registry),
            Arc::new(runner.clone()),
            Arc::new(sink.clone()),
            batch_size,
        );

        let config = BrokerConfig::default()
            .with_server("memory:5672")
            .with_credentials("worker", "secret");
        let session = SessionManager::new(Arc::new(broker.clone()), config, 4)
            .start(registry.descriptors(), Arc::new(consumer))
            .await
            .expect("session should start");

        Self {
            broker,
            runner,
            sink,
            session,
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Writes an uploaded artifact and returns its path.
    fn artifact(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, "uploaded content").expect("Failed to write artifact");
        path
    }

    fn publish_body(&self, body: &str, path: &PathBuf) -> u64 {
        let path = path.display().to_string();
        let tags = self.broker.publish(
            KEY,
            body.as_bytes(),
            &[("path", path.as_str()), ("accessToken", "tok-1"), ("tenantId", "acme")],
        );
        assert_eq!(tags.len(), 1, "message should reach exactly one consumer");
        tags[0]
    }

    fn publish(&self, path: &PathBuf) -> u64 {
        self.publish_body(&json!({ "dataType": KEY }).to_string(), path)
    }

    /// Waits for the message to settle and the run to end.
    async fn settle(&self, count: usize) -> Vec<AckRecord> {
        let acks = self.broker.wait_for_acks(count).await;
        self.runner.wait_until_idle().await;
        acks
    }
}

fn record(n: u64) -> Record {
    fixtures::record(json!({ "n": n }))
}

fn numbers(batches: &[Vec<Record>]) -> Vec<Vec<u64>> {
    batches
        .iter()
        .map(|b| b.iter().map(|r| r["n"].as_u64().unwrap()).collect())
        .collect()
}

#[tokio::test]
async fn test_flushes_are_contiguous_and_ordered() {
    let cases: [(usize, Vec<Vec<u64>>); 3] = [
        (1, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]),
        (2, vec![vec![0, 1], vec![2, 3], vec![4]]),
        (10, vec![vec![0, 1, 2, 3, 4]]),
    ];
    for (batch_size, expected) in cases {
        let harness = TestHarness::new(batch_size).await;
        harness.runner.push_records((0..5).map(record).collect());

        let artifact = harness.artifact("upload.csv");
        let tag = harness.publish(&artifact);
        let acks = harness.settle(1).await;

        assert_eq!(acks, vec![AckRecord::Acked(tag)]);
        assert_eq!(numbers(&harness.sink.accepted().await), expected);
        assert!(!artifact.exists(), "artifact should be deleted");
        harness.session.shutdown().await;
    }
}

#[tokio::test]
async fn test_two_records_with_batch_size_one() {
    let harness = TestHarness::new(1).await;
    harness.runner.push_records(vec![
        fixtures::record(json!({"a": 1})),
        fixtures::record(json!({"a": 2})),
    ]);

    let artifact = harness.artifact("two.json");
    let tag = harness.publish(&artifact);
    let acks = harness.settle(1).await;

    let batches = harness.sink.batches().await;
    assert_eq!(batches.len(), 2);
    assert_eq!(
        serde_json::to_value(&batches[0].records).unwrap(),
        json!([{"a": 1}])
    );
    assert_eq!(
        serde_json::to_value(&batches[1].records).unwrap(),
        json!([{"a": 2}])
    );
    assert_eq!(acks, vec![AckRecord::Acked(tag)]);
    assert!(!artifact.exists());
}

#[tokio::test]
async fn test_exit_one_flushes_remainder_and_keeps_artifact() {
    let harness = TestHarness::new(10).await;
    harness.runner.push_script(vec![
        ProcessingEvent::Record(fixtures::record(json!({"a": 1}))),
        ProcessingEvent::Failed(RunFailure {
            cause: FailureCause::ExitStatus,
            exit_code: Some(1),
        }),
    ]);

    let artifact = harness.artifact("broken.bin");
    let tag = harness.publish(&artifact);
    let acks = harness.settle(1).await;

    let accepted = harness.sink.accepted().await;
    assert_eq!(accepted.len(), 1);
    assert_eq!(serde_json::to_value(&accepted[0]).unwrap(), json!([{"a": 1}]));
    assert_eq!(acks, vec![AckRecord::Acked(tag)]);
    assert!(artifact.exists(), "artifact must be kept after a failure");
}

#[tokio::test]
async fn test_gateway_failure_mid_stream_rejects_runner_once() {
    let harness = TestHarness::new(1).await;
    harness.sink.fail_after(1).await;
    harness.runner.push_records((0..20).map(record).collect());

    let artifact = harness.artifact("partial.csv");
    let tag = harness.publish(&artifact);
    let acks = harness.settle(1).await;

    let batches = harness.sink.batches().await;
    assert_eq!(batches.len(), 2, "no flush may follow the failed one");
    assert!(batches[0].accepted);
    assert!(!batches[1].accepted);
    let rejections = harness.runner.rejections();
    assert_eq!(rejections.len(), 1);
    assert!(rejections[0].starts_with("batch delivery failed"));
    assert_eq!(harness.runner.stops(), 0);
    assert_eq!(acks, vec![AckRecord::Acked(tag)]);
    assert_eq!(harness.broker.acks().len(), 1);
    assert!(artifact.exists(), "artifact must be kept for reprocessing");
}

#[tokio::test]
async fn test_remainder_flush_failure_keeps_artifact() {
    let harness = TestHarness::new(10).await;
    harness.sink.fail_after(0).await;
    harness.runner.push_records((0..3).map(record).collect());

    let artifact = harness.artifact("rest.csv");
    let tag = harness.publish(&artifact);
    let acks = harness.settle(1).await;

    assert_eq!(harness.sink.calls().await, 1);
    assert_eq!(harness.runner.stops(), 0);
    assert!(harness.runner.rejections().is_empty());
    assert_eq!(acks, vec![AckRecord::Acked(tag)]);
    assert!(artifact.exists());
}

#[tokio::test]
async fn test_processing_metadata_reaches_gateway() {
    let harness = TestHarness::new(10).await;
    harness.runner.push_records(vec![record(1)]);

    let artifact = harness.artifact("meta.csv");
    harness.publish(&artifact);
    harness.settle(1).await;

    let batches = harness.sink.batches().await;
    assert_eq!(batches[0].metadata.access_token.as_deref(), Some("tok-1"));
    assert_eq!(batches[0].metadata.tenant_id.as_deref(), Some("acme"));

    let executions = harness.runner.executions();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].processor, "cpu");
    assert_eq!(executions[0].unit.path(), artifact.as_path());
}

#[tokio::test]
async fn test_no_records_still_deletes_artifact() {
    let harness = TestHarness::new(10).await;

    let artifact = harness.artifact("empty.csv");
    let tag = harness.publish(&artifact);
    let acks = harness.settle(1).await;

    assert_eq!(harness.sink.calls().await, 0);
    assert_eq!(acks, vec![AckRecord::Acked(tag)]);
    assert!(!artifact.exists());
}

#[tokio::test]
async fn test_missing_artifact_is_still_acked() {
    let harness = TestHarness::new(10).await;
    harness.runner.push_records(vec![record(1)]);

    let tag = harness.publish(&harness.temp_dir.path().join("gone.csv"));
    let acks = harness.settle(1).await;

    assert_eq!(acks, vec![AckRecord::Acked(tag)]);
}

#[tokio::test]
async fn test_undecodable_message_is_acked_without_running() {
    let harness = TestHarness::new(10).await;
    let artifact = harness.artifact("junk.bin");

    let tag = harness.publish_body("definitely not json", &artifact);
    let acks = harness.settle(1).await;

    assert_eq!(acks, vec![AckRecord::Acked(tag)]);
    assert!(harness.runner.executions().is_empty());
    assert!(artifact.exists());
}

#[tokio::test]
async fn test_unsupported_content_is_acked_without_running() {
    let harness = TestHarness::new(10).await;
    let artifact = harness.artifact("gpu.csv");

    let tag = harness.publish_body(&json!({"dataType": "gpu/host"}).to_string(), &artifact);
    let acks = harness.settle(1).await;

    assert_eq!(acks, vec![AckRecord::Acked(tag)]);
    assert!(harness.runner.executions().is_empty());
    assert!(artifact.exists());
}

#[tokio::test]
async fn test_legacy_body_is_routed_by_metric_and_category() {
    let harness = TestHarness::new(10).await;
    let artifact = harness.artifact("legacy.csv");

    let body = json!({"metric": "cpu-usage", "category": "host"}).to_string();
    let tag = harness.publish_body(&body, &artifact);
    let acks = harness.settle(1).await;

    assert_eq!(acks, vec![AckRecord::Acked(tag)]);
    assert_eq!(harness.runner.executions().len(), 1);
    assert!(!artifact.exists());
}

#[tokio::test]
async fn test_spawn_failure_is_requeued() {
    let harness = TestHarness::new(10).await;
    harness.runner.fail_spawns(1);

    let artifact = harness.artifact("retry.csv");
    let tag = harness.publish(&artifact);
    let acks = harness.settle(1).await;

    assert_eq!(
        acks,
        vec![AckRecord::Nacked {
            tag,
            requeue: true
        }]
    );
    assert!(artifact.exists());
}

#[tokio::test]
async fn test_events_ending_without_outcome_keep_artifact() {
    let harness = TestHarness::new(10).await;
    harness
        .runner
        .push_script(vec![ProcessingEvent::Record(record(1))]);

    let artifact = harness.artifact("cut.csv");
    let tag = harness.publish(&artifact);
    let acks = harness.settle(1).await;

    assert_eq!(acks, vec![AckRecord::Acked(tag)]);
    assert!(artifact.exists());
}

#[tokio::test]
async fn test_concurrent_messages_are_settled_independently() {
    let harness = TestHarness::new(2).await;
    for _ in 0..3 {
        harness.runner.push_records((0..3).map(record).collect());
    }

    let artifacts: Vec<_> = (0..3)
        .map(|i| harness.artifact(&format!("upload-{}.csv", i)))
        .collect();
    let mut tags: Vec<_> = artifacts.iter().map(|a| harness.publish(a)).collect();
    let acks = harness.settle(3).await;

    let mut acked: Vec<_> = acks.iter().map(AckRecord::tag).collect();
    acked.sort_unstable();
    tags.sort_unstable();
    assert_eq!(acked, tags);
    assert!(acks.iter().all(|a| matches!(a, AckRecord::Acked(_))));
    assert_eq!(harness.sink.calls().await, 6);
    assert!(artifacts.iter().all(|a| !a.exists()));
}
