//! Discovery and process runner tests against the processors in
//! `tests/processors`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use harvester_core::{
    discover,
    runner::{dispatch, FailureCause, ProcessingError},
    testing::ScriptedRunner,
    CommandRunner, ContentMetadata, ContentTypeKey, ProcessingEvent, ProcessingHandle,
    ProcessingMetadata, ProcessorRegistry, ProcessorRunner, UnitOfWork,
};

fn processors_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/processors")
}

async fn registry() -> ProcessorRegistry {
    let descriptors = discover(&processors_dir(), Duration::from_secs(10))
        .await
        .expect("processors directory should be readable");
    ProcessorRegistry::new(descriptors)
}

/// Content file plus the unit of work pointing at it.
struct Content {
    _dir: TempDir,
    path: PathBuf,
}

impl Content {
    fn new(text: &str) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("upload.bin");
        std::fs::write(&path, text).expect("Failed to write content");
        Self { _dir: dir, path }
    }

    fn legacy_unit(&self, metric: &str, category: &str) -> UnitOfWork {
        UnitOfWork::new(
            ContentMetadata::new(ContentTypeKey::from_legacy(metric, category))
                .with_field("metric", metric)
                .with_field("category", category),
            ProcessingMetadata::new(&self.path),
        )
    }

    fn unit(&self, data_type: &str) -> UnitOfWork {
        UnitOfWork::new(
            ContentMetadata::new(data_type).with_field("metric", "inv"),
            ProcessingMetadata::new(&self.path),
        )
    }
}

async fn run(registry: &ProcessorRegistry, unit: &UnitOfWork) -> Vec<ProcessingEvent> {
    let mut handle = dispatch(registry, &CommandRunner::new(), unit).expect("dispatch");
    collect(&mut handle).await
}

async fn collect(handle: &mut ProcessingHandle) -> Vec<ProcessingEvent> {
    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(20), handle.next_event())
        .await
        .expect("run should finish")
    {
        events.push(event);
    }
    events
}

fn records(events: &[ProcessingEvent]) -> Vec<&serde_json::Map<String, serde_json::Value>> {
    events
        .iter()
        .filter_map(|e| match e {
            ProcessingEvent::Record(r) => Some(r),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_discovery_drops_broken_processors() {
    let registry = registry().await;

    let names: Vec<_> = registry.descriptors().iter().map(|d| d.name()).collect();
    assert_eq!(
        names,
        vec![
            "processing-error",
            "produce-invalid-objects",
            "produce-many-objects",
            "produce-two-objects",
            "shared-a",
            "shared-b",
            "slow-stream",
            "unique-names1",
            "with-logging",
        ]
    );
    assert!(registry
        .lookup(&ContentTypeKey::from_legacy("always-error", "always-error"))
        .is_none());
}

#[tokio::test]
async fn test_last_registered_processor_wins() {
    let registry = registry().await;

    let winner = registry
        .lookup(&ContentTypeKey::new("shared/key"))
        .expect("shared key should be registered");
    assert_eq!(winner.name(), "shared-b");

    let content = Content::new("");
    let events = run(&registry, &content.unit("shared/key")).await;
    assert_eq!(records(&events)[0]["processor"], "shared-b");
}

#[tokio::test]
async fn test_unsupported_content_does_not_spawn() {
    let registry = registry().await;
    let runner = ScriptedRunner::new();
    let content = Content::new("");

    let result = dispatch(&registry, &runner, &content.unit("nobody/consumes"));
    match result {
        Err(ProcessingError::UnsupportedContent { key }) => {
            assert_eq!(key.as_str(), "nobody/consumes")
        }
        other => panic!("expected unsupported content, got {:?}", other.map(|_| ())),
    }
    assert!(runner.executions().is_empty());
}

#[tokio::test]
async fn test_produce_two_objects() {
    let registry = registry().await;
    let content = Content::new("send me JSON objects");

    let events = run(
        &registry,
        &content.legacy_unit("produce-two-objects-metric", "produce-two-objects-category"),
    )
    .await;

    let records = records(&events);
    assert_eq!(records.len(), 2);
    for (i, record) in records.iter().enumerate() {
        let n = i + 1;
        assert_eq!(record["metric"], format!("produce-two-objects-metric{}", n));
        assert_eq!(record["category"], format!("produce-two-objects-category{}", n));
    }
    assert_eq!(events.last(), Some(&ProcessingEvent::Completed));
}

#[tokio::test]
async fn test_produce_many_objects_in_order() {
    let registry = registry().await;
    let content = Content::new("send me JSON objects");

    let events = run(
        &registry,
        &content.legacy_unit("produce-many-objects-metric", "produce-many-objects-category"),
    )
    .await;

    let records = records(&events);
    assert_eq!(records.len(), 1000);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record["metric"], format!("produce-many-objects-metric{}", i + 1));
    }
    assert_eq!(events.len(), 1001);
    assert_eq!(events.last(), Some(&ProcessingEvent::Completed));
}

#[tokio::test]
async fn test_processing_error_reports_exit_code() {
    let registry = registry().await;
    let content = Content::new("anything");

    let events = run(
        &registry,
        &content.legacy_unit("processing-error", "processing-error"),
    )
    .await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        ProcessingEvent::Failed(failure) => assert_eq!(failure.exit_code, Some(1)),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_object_stops_records_even_on_clean_exit() {
    let registry = registry().await;
    let content = Content::new("send me JSON objects");

    let events = run(&registry, &content.unit("produce-invalid-objects")).await;

    assert_eq!(events.len(), 2);
    match &events[0] {
        ProcessingEvent::Record(record) => assert_eq!(record["metric"], "inv1"),
        other => panic!("expected a record, got {:?}", other),
    }
    match &events[1] {
        ProcessingEvent::Failed(failure) => {
            assert!(matches!(failure.cause, FailureCause::Parse(_)));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_array_completes_without_records() {
    let registry = registry().await;
    let content = Content::new("");

    for unit in [
        content.legacy_unit("unique-names2", "unique-names3"),
        content.legacy_unit("with-logging", "with-logging"),
    ] {
        let events = run(&registry, &unit).await;
        assert_eq!(events, vec![ProcessingEvent::Completed]);
    }
}

#[tokio::test]
async fn test_stop_suppresses_remaining_output() {
    let registry = registry().await;
    let content = Content::new("");
    let unit = content.unit("slow-stream");

    let processor = registry
        .lookup(unit.key())
        .expect("slow-stream should be registered");
    let mut handle = CommandRunner::new()
        .execute(Arc::clone(&processor), &unit)
        .expect("spawn");

    let first = tokio::time::timeout(Duration::from_secs(10), handle.next_event())
        .await
        .expect("first record should arrive");
    assert!(matches!(first, Some(ProcessingEvent::Record(_))));

    handle.stop();
    handle.stop();

    let rest = collect(&mut handle).await;
    assert_eq!(rest.len(), 1);
    match &rest[0] {
        ProcessingEvent::Failed(failure) => assert_eq!(failure.cause, FailureCause::Stopped),
        other => panic!("expected stop failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reject_fails_run_with_reason() {
    let registry = registry().await;
    let content = Content::new("");
    let unit = content.unit("slow-stream");

    let processor = registry
        .lookup(unit.key())
        .expect("slow-stream should be registered");
    let mut handle = CommandRunner::new()
        .execute(Arc::clone(&processor), &unit)
        .expect("spawn");

    let first = tokio::time::timeout(Duration::from_secs(10), handle.next_event())
        .await
        .expect("first record should arrive");
    assert!(matches!(first, Some(ProcessingEvent::Record(_))));

    handle.reject("record rejected downstream");
    handle.stop();

    let rest = collect(&mut handle).await;
    assert_eq!(rest.len(), 1, "no record may follow a rejection: {:?}", rest);
    match &rest[0] {
        ProcessingEvent::Failed(failure) => {
            assert_eq!(
                failure.cause,
                FailureCause::Rejected("record rejected downstream".to_string())
            );
            assert_eq!(failure.exit_code, None);
        }
        other => panic!("expected rejection failure, got {:?}", other),
    }
}
