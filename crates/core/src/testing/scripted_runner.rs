//! Processor runner that replays scripted events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::registry::ProcessorDescriptor;
use crate::runner::{
    Control, FailureCause, ProcessingEvent, ProcessingHandle, ProcessorRunner, RunFailure,
    RunnerError,
};
use crate::work::{Record, UnitOfWork};

/// One recorded `execute` call.
#[derive(Debug, Clone)]
pub struct Execution {
    pub processor: String,
    pub unit: UnitOfWork,
}

#[derive(Default)]
struct RunnerState {
    scripts: VecDeque<Vec<ProcessingEvent>>,
    spawn_failures: usize,
    executions: Vec<Execution>,
}

/// Replays a queued script of events per execution.
///
/// Stop and reject requests are honoured the way a real process would:
/// emission stops and the run ends with a `Stopped` or `Rejected` failure. Executions without a queued
/// script complete immediately with no records.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<RunnerState>>,
    stops: Arc<AtomicUsize>,
    rejections: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues the events for the next execution.
    pub fn push_script(&self, events: Vec<ProcessingEvent>) {
        self.lock().scripts.push_back(events);
    }

    /// Queues records followed by `Completed`.
    pub fn push_records(&self, records: Vec<Record>) {
        let mut events: Vec<_> = records.into_iter().map(ProcessingEvent::Record).collect();
        events.push(ProcessingEvent::Completed);
        self.push_script(events);
    }

    /// The next `count` executions fail to spawn.
    pub fn fail_spawns(&self, count: usize) {
        self.lock().spawn_failures = count;
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.lock().executions.clone()
    }

    /// Stop requests received across all runs.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Reasons passed to `reject` across all runs.
    pub fn rejections(&self) -> Vec<String> {
        self.rejections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Waits until every run has ended and its handle was dropped.
    pub async fn wait_until_idle(&self) {
        for _ in 0..6000 {
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("ScriptedRunner runs did not finish in time");
    }
}

impl ProcessorRunner for ScriptedRunner {
    fn execute(
        &self,
        processor: Arc<ProcessorDescriptor>,
        unit: &UnitOfWork,
    ) -> Result<ProcessingHandle, RunnerError> {
        let script = {
            let mut state = self.lock();
            if state.spawn_failures > 0 {
                state.spawn_failures -= 1;
                return Err(RunnerError::Spawn {
                    processor: processor.name().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted failure"),
                });
            }
            state.executions.push(Execution {
                processor: processor.name().to_string(),
                unit: unit.clone(),
            });
            state
                .scripts
                .pop_front()
                .unwrap_or_else(|| vec![ProcessingEvent::Completed])
        };

        let (event_tx, event_rx) = mpsc::channel(1);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(replay(
            script,
            event_tx,
            control_rx,
            self.clone(),
        ));

        Ok(ProcessingHandle::new(processor.name(), event_rx, control_tx))
    }
}

async fn replay(
    script: Vec<ProcessingEvent>,
    events: mpsc::Sender<ProcessingEvent>,
    mut control: mpsc::UnboundedReceiver<Control>,
    runner: ScriptedRunner,
) {
    let mut halted: Option<FailureCause> = None;

    for event in script {
        while let Ok(request) = control.try_recv() {
            halted = Some(runner.note(request));
        }
        if halted.is_some() {
            break;
        }
        let terminal = event.is_terminal();
        tokio::select! {
            sent = events.send(event) => {
                if sent.is_err() || terminal {
                    break;
                }
            }
            Some(request) = control.recv() => {
                halted = Some(runner.note(request));
                break;
            }
        }
    }

    if let Some(cause) = halted {
        let _ = events
            .send(ProcessingEvent::Failed(RunFailure {
                cause,
                exit_code: None,
            }))
            .await;
    }
    drop(events);

    while let Some(request) = control.recv().await {
        runner.note(request);
    }
    runner.active.fetch_sub(1, Ordering::SeqCst);
}

impl ScriptedRunner {
    fn note(&self, request: Control) -> FailureCause {
        match request {
            Control::Stop => {
                self.stops.fetch_add(1, Ordering::SeqCst);
                FailureCause::Stopped
            }
            Control::Abort(FailureCause::Rejected(reason)) => {
                self.rejections
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(reason.clone());
                FailureCause::Rejected(reason)
            }
            Control::Abort(cause) => cause,
        }
    }
}
