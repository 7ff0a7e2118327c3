//! Runs processors as shell commands.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;
use tracing::{debug, info, warn, Instrument};

use super::env::processor_environment;
use super::error::RunnerError;
use super::handle::{Control, ProcessingEvent, ProcessingHandle};
use super::json_stream::JsonArrayStream;
use super::state::{FailureCause, ProcessExit, RunOutcome, RunState};
use super::stderr::relay_stderr;
use super::traits::ProcessorRunner;
use crate::metrics;
use crate::registry::ProcessorDescriptor;
use crate::shell::shell_command;
use crate::work::{Record, UnitOfWork};

const DEFAULT_EVENT_BUFFER: usize = 64;
const DEFAULT_READ_CHUNK: usize = 8 * 1024;

/// Parsed records held back while the consumer is busy. Reading pauses above this.
const OUTBOX_HIGH_WATER: usize = 64;

/// Spawns `sh -c <command>` per unit of work.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    event_buffer: usize,
    read_chunk: usize,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }
}

impl ProcessorRunner for CommandRunner {
    fn execute(
        &self,
        processor: Arc<ProcessorDescriptor>,
        unit: &UnitOfWork,
    ) -> Result<ProcessingHandle, RunnerError> {
        let mut cmd = shell_command(processor.command(), processor.working_directory());
        cmd.envs(processor_environment(&unit.content, LevelFilter::current()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            processor: processor.name().to_string(),
            source,
        })?;

        let missing = |pipe| RunnerError::MissingPipe {
            processor: processor.name().to_string(),
            pipe,
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (events_tx, events_rx) = mpsc::channel(self.event_buffer);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let span = processor.span().clone();

        debug!(
            processor = processor.name(),
            pid = ?child.id(),
            path = %unit.path().display(),
            "Started processor"
        );

        tokio::spawn(relay_stderr(stderr).instrument(span.clone()));
        tokio::spawn(
            feed_stdin(unit.path().to_path_buf(), stdin, control_tx.clone())
                .instrument(span.clone()),
        );

        let run = Run {
            processor: Arc::clone(&processor),
            child,
            stdout: Some(stdout),
            events: events_tx,
            control: control_rx,
            state: RunState::Running,
            parser: JsonArrayStream::new(),
            outbox: VecDeque::new(),
            stream_end: None,
            emitted: 0,
        };
        tokio::spawn(run.drive(self.read_chunk).instrument(span));

        Ok(ProcessingHandle::new(processor.name(), events_rx, control_tx))
    }
}

/// Copies the content file to the child's stdin, then closes it.
async fn feed_stdin(
    path: PathBuf,
    mut stdin: ChildStdin,
    control: mpsc::UnboundedSender<Control>,
) {
    let result: std::io::Result<()> = async {
        let mut file = tokio::fs::File::open(&path).await?;
        tokio::io::copy(&mut file, &mut stdin).await?;
        stdin.shutdown().await
    }
    .await;
    drop(stdin);

    match result {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("Processor closed its input before reading all content")
        }
        Err(e) => {
            warn!(path = %path.display(), "Failed to stream content to processor: {}", e);
            let _ = control.send(Control::Abort(FailureCause::Io(format!(
                "{}: {}",
                path.display(),
                e
            ))));
        }
    }
}

async fn read_stdout(stdout: &mut Option<ChildStdout>, buf: &mut [u8]) -> std::io::Result<usize> {
    match stdout {
        Some(stdout) => stdout.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Result of one wait in the drive loop.
enum Step {
    Control(Option<Control>),
    ConsumerGone,
    Delivered,
    Read(std::io::Result<usize>),
    Exited(std::io::Result<std::process::ExitStatus>),
}

/// Owns the child for the duration of one run.
struct Run {
    processor: Arc<ProcessorDescriptor>,
    child: Child,
    stdout: Option<ChildStdout>,
    events: mpsc::Sender<ProcessingEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    state: RunState,
    parser: JsonArrayStream,
    /// Parsed, not yet delivered.
    outbox: VecDeque<Record>,
    /// How the output ended. Applied once the outbox has drained.
    stream_end: Option<Result<(), FailureCause>>,
    emitted: u64,
}

impl Run {
    async fn drive(mut self, read_chunk: usize) {
        let started = Instant::now();
        let mut buf = vec![0u8; read_chunk];
        let mut control_open = true;
        let mut consumer_gone = false;

        let outcome = loop {
            if self.outbox.is_empty() {
                match self.stream_end.take() {
                    Some(Ok(())) => self.state.on_stream_end(),
                    Some(Err(cause)) => self.abort(cause),
                    None => {}
                }
            }
            if let Some(outcome) = self.state.outcome() {
                break outcome.clone();
            }

            let can_read = self.stdout.is_some()
                && self.stream_end.is_none()
                && self.outbox.len() < OUTBOX_HIGH_WATER;
            let exited = self.state.has_exited();

            let step = tokio::select! {
                message = self.control.recv(), if control_open => Step::Control(message),
                _ = self.events.closed(), if !consumer_gone => Step::ConsumerGone,
                permit = self.events.reserve(), if !self.outbox.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(record) = self.outbox.pop_front() {
                            if self.state.accepts_records() {
                                permit.send(ProcessingEvent::Record(record));
                                self.emitted += 1;
                            }
                        }
                        Step::Delivered
                    }
                    Err(_) => Step::ConsumerGone,
                },
                read = read_stdout(&mut self.stdout, &mut buf), if can_read => Step::Read(read),
                status = self.child.wait(), if !exited => Step::Exited(status),
            };

            match step {
                Step::Control(Some(Control::Stop)) => self.stop(),
                Step::Control(Some(Control::Abort(cause))) => self.abort(cause),
                Step::Control(None) => control_open = false,
                Step::ConsumerGone => {
                    consumer_gone = true;
                    debug!("Event receiver dropped, stopping processor");
                    self.stop();
                    self.outbox.clear();
                    if self.stdout.take().is_some() {
                        self.state.on_stream_end();
                    }
                }
                Step::Delivered => {}
                Step::Read(read) => self.on_read(read, &buf),
                Step::Exited(status) => {
                    let exit = match status {
                        Ok(status) => ProcessExit {
                            code: status.code(),
                        },
                        Err(e) => {
                            warn!("Failed to wait for processor: {}", e);
                            ProcessExit::signalled()
                        }
                    };
                    debug!(exit_code = ?exit.code, "Processor exited");
                    self.state.on_exit(exit);
                }
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        let name = self.processor.name();
        let event = match outcome {
            RunOutcome::Completed => {
                info!(records = self.emitted, elapsed_secs = elapsed, "Processor completed");
                metrics::PROCESSOR_RUNS
                    .with_label_values(&[name, "completed"])
                    .inc();
                ProcessingEvent::Completed
            }
            RunOutcome::Failed(failure) => {
                warn!(
                    records = self.emitted,
                    exit_code = ?failure.exit_code,
                    elapsed_secs = elapsed,
                    "Processor failed: {}",
                    failure.cause
                );
                metrics::PROCESSOR_RUNS
                    .with_label_values(&[name, "failed"])
                    .inc();
                ProcessingEvent::Failed(failure)
            }
        };
        metrics::PROCESSOR_RUN_DURATION
            .with_label_values(&[name])
            .observe(elapsed);
        metrics::RECORDS_EMITTED
            .with_label_values(&[name])
            .inc_by(self.emitted);

        let _ = self.events.send(event).await;
    }

    fn on_read(&mut self, read: std::io::Result<usize>, buf: &[u8]) {
        match read {
            Ok(0) => {
                self.stdout = None;
                self.stream_end = Some(
                    self.parser
                        .finish()
                        .map_err(|e| FailureCause::Parse(e.to_string())),
                );
            }
            Ok(n) => {
                let mut parsed = Vec::new();
                let result = self.parser.feed(&buf[..n], &mut parsed);
                self.outbox.extend(parsed);
                if let Err(e) = result {
                    self.stdout = None;
                    self.stream_end = Some(Err(FailureCause::Parse(e.to_string())));
                }
            }
            Err(e) => {
                self.stdout = None;
                self.stream_end = Some(Err(FailureCause::Io(e.to_string())));
            }
        }
    }

    fn stop(&mut self) {
        let exited = self.state.has_exited();
        if self.state.on_stop() {
            info!("Stopping processor");
            self.wind_down(exited);
        }
    }

    fn abort(&mut self, cause: FailureCause) {
        let exited = self.state.has_exited();
        let reason = cause.to_string();
        if self.state.on_error(cause) {
            warn!("Aborting processor: {}", reason);
            self.wind_down(exited);
        }
    }

    /// Drops pending output and treats the stream as ended.
    fn wind_down(&mut self, exited: bool) {
        self.outbox.clear();
        self.stream_end = None;
        self.stdout = None;
        if !exited {
            if let Err(e) = self.child.start_kill() {
                debug!("Failed to kill processor: {}", e);
            }
        }
        self.state.on_stream_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ContentTypeKey;
    use crate::work::{ContentMetadata, ProcessingMetadata};
    use std::time::Duration;
    use tempfile::TempDir;

    fn processor(dir: &std::path::Path, command: &str) -> Arc<ProcessorDescriptor> {
        Arc::new(ProcessorDescriptor::new(
            "inline",
            command,
            dir,
            vec![ContentTypeKey::new("inline/test")],
        ))
    }

    fn unit(path: &std::path::Path) -> UnitOfWork {
        UnitOfWork::new(
            ContentMetadata::new("inline/test").with_field("metric", "m"),
            ProcessingMetadata::new(path),
        )
    }

    async fn collect(handle: &mut ProcessingHandle) -> Vec<ProcessingEvent> {
        let mut events = Vec::new();
        while let Some(event) =
            tokio::time::timeout(Duration::from_secs(10), handle.next_event())
                .await
                .expect("run should finish")
        {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_records_then_completed() {
        let dir = TempDir::new().unwrap();
        let content = dir.path().join("content");
        std::fs::write(&content, "payload").unwrap();

        let runner = CommandRunner::new();
        let mut handle = runner
            .execute(
                processor(dir.path(), r#"read line; printf '[{"in":"%s","m":"%s"}]' "$line" "$P_METRIC""#),
                &unit(&content),
            )
            .unwrap();

        let events = collect(&mut handle).await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            ProcessingEvent::Record(record) => {
                assert_eq!(record["in"], "payload");
                assert_eq!(record["m"], "m");
            }
            other => panic!("expected a record, got {:?}", other),
        }
        assert_eq!(events[1], ProcessingEvent::Completed);
    }

    #[tokio::test]
    async fn test_missing_content_fails_run() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new();
        let mut handle = runner
            .execute(
                processor(dir.path(), "cat > /dev/null; sleep 1; echo '[]'"),
                &unit(&dir.path().join("does-not-exist")),
            )
            .unwrap();

        let events = collect(&mut handle).await;
        match events.last() {
            Some(ProcessingEvent::Failed(failure)) => {
                assert!(matches!(failure.cause, FailureCause::Io(_)));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_utf8_stderr_does_not_fail_run() {
        let dir = TempDir::new().unwrap();
        let content = dir.path().join("content");
        std::fs::write(&content, "").unwrap();

        let script = r#"cat > /dev/null; printf 'caf\351\n' >&2; sleep 0.2; i=0; while [ $i -lt 2000 ]; do echo "INFO: line $i" >&2; i=$((i+1)); done; printf '[{"a":1}]'"#;
        let mut handle = CommandRunner::new()
            .execute(processor(dir.path(), script), &unit(&content))
            .unwrap();

        let events = collect(&mut handle).await;
        assert_eq!(events.len(), 2, "unexpected events {:?}", events);
        match &events[0] {
            ProcessingEvent::Record(record) => assert_eq!(record["a"], 1),
            other => panic!("expected a record, got {:?}", other),
        }
        assert_eq!(events[1], ProcessingEvent::Completed);
    }

    #[tokio::test]
    async fn test_small_event_buffer_preserves_order() {
        let dir = TempDir::new().unwrap();
        let content = dir.path().join("content");
        std::fs::write(&content, "").unwrap();

        let script = r#"printf '['; i=0; while [ $i -lt 200 ]; do [ $i -gt 0 ] && printf ','; printf '{"n":%d}' $i; i=$((i+1)); done; printf ']'"#;
        let runner = CommandRunner::new().with_event_buffer(1);
        let mut handle = runner
            .execute(processor(dir.path(), script), &unit(&content))
            .unwrap();

        let events = collect(&mut handle).await;
        assert_eq!(events.len(), 201);
        for (i, event) in events[..200].iter().enumerate() {
            match event {
                ProcessingEvent::Record(record) => assert_eq!(record["n"], i as u64),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(events[200], ProcessingEvent::Completed);
    }
}
