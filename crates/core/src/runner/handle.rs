//! Caller side of a running processor.

use tokio::sync::mpsc;

use super::state::{FailureCause, RunFailure};
use crate::work::Record;

/// What a run reports, in order. Exactly one terminal event ends the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingEvent {
    Record(Record),
    Failed(RunFailure),
    Completed,
}

impl ProcessingEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Record(_))
    }
}

/// Requests sent from the handle to the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Stop,
    Abort(FailureCause),
}

/// Receives the events of one run and can stop it.
///
/// Dropping the handle stops the run.
#[derive(Debug)]
pub struct ProcessingHandle {
    processor: String,
    events: mpsc::Receiver<ProcessingEvent>,
    control: mpsc::UnboundedSender<Control>,
}

impl ProcessingHandle {
    pub fn new(
        processor: impl Into<String>,
        events: mpsc::Receiver<ProcessingEvent>,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            processor: processor.into(),
            events,
            control,
        }
    }

    pub fn processor(&self) -> &str {
        &self.processor
    }

    /// Next event, or `None` once the terminal event has been consumed.
    pub async fn next_event(&mut self) -> Option<ProcessingEvent> {
        self.events.recv().await
    }

    /// Kills the process with SIGKILL; there is no graceful signal first.
    ///
    /// The run then fails with [`FailureCause::Stopped`] and no exit code.
    /// Idempotent; ignored once the process has exited.
    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    /// Refuses further output, for callers that cannot take more records.
    ///
    /// Handled like invalid output: no further records are delivered, the
    /// process is killed and the run fails with [`FailureCause::Rejected`].
    /// Only the first error counts.
    pub fn reject(&self, reason: impl Into<String>) {
        let _ = self
            .control
            .send(Control::Abort(FailureCause::Rejected(reason.into())));
    }
}
