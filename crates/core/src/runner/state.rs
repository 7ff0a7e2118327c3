//! Reconciles stream end, process exit and errors into one outcome.

use std::fmt;

/// How the child process ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn signalled() -> Self {
        Self { code: None }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// First reason a run went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// Output was not a valid JSON array of objects.
    Parse(String),
    /// The consumer refused a record.
    Rejected(String),
    /// Reading output or feeding input failed.
    Io(String),
    /// A stop was requested before the process exited.
    Stopped,
    /// The process exited with a non-zero code or was killed.
    ExitStatus,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(reason) => write!(f, "invalid output: {}", reason),
            Self::Rejected(reason) => write!(f, "rejected: {}", reason),
            Self::Io(reason) => write!(f, "i/o error: {}", reason),
            Self::Stopped => f.write_str("stopped"),
            Self::ExitStatus => f.write_str("unsuccessful exit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    pub cause: FailureCause,
    pub exit_code: Option<i32>,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} (exit code {})", self.cause, code),
            None => write!(f, "{} (no exit code)", self.cause),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(RunFailure),
}

/// Lifecycle of one processor run.
///
/// The run finishes only once the output stream has ended and the process
/// has exited. The first error is kept; later ones are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Output ended cleanly, process still running.
    AwaitingExit,
    /// Process exited, output still open.
    AwaitingStreamEnd { exit: ProcessExit },
    /// An error was raised; waiting for whatever is still outstanding.
    Aborting {
        cause: FailureCause,
        stream_ended: bool,
        exit: Option<ProcessExit>,
    },
    Finished(RunOutcome),
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}

impl RunState {
    /// Whether a freshly parsed record may still be delivered.
    pub fn accepts_records(&self) -> bool {
        matches!(self, Self::Running | Self::AwaitingStreamEnd { .. })
    }

    pub fn has_exited(&self) -> bool {
        match self {
            Self::Running | Self::AwaitingExit => false,
            Self::AwaitingStreamEnd { .. } | Self::Finished(_) => true,
            Self::Aborting { exit, .. } => exit.is_some(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        match self {
            Self::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn on_stream_end(&mut self) {
        match self {
            Self::Running => *self = Self::AwaitingExit,
            Self::AwaitingStreamEnd { exit } => *self = Self::Finished(resolve_exit(*exit)),
            Self::Aborting { stream_ended, .. } => {
                *stream_ended = true;
                self.settle_abort();
            }
            Self::AwaitingExit | Self::Finished(_) => {}
        }
    }

    pub fn on_exit(&mut self, process_exit: ProcessExit) {
        match self {
            Self::Running => {
                *self = Self::AwaitingStreamEnd { exit: process_exit }
            }
            Self::AwaitingExit => *self = Self::Finished(resolve_exit(process_exit)),
            Self::Aborting { exit, .. } => {
                if exit.is_none() {
                    *exit = Some(process_exit);
                }
                self.settle_abort();
            }
            Self::AwaitingStreamEnd { .. } | Self::Finished(_) => {}
        }
    }

    /// Raises `cause`. Returns false when an error was already raised or
    /// the run is over.
    pub fn on_error(&mut self, cause: FailureCause) -> bool {
        let (stream_ended, exit) = match self {
            Self::Running => (false, None),
            Self::AwaitingExit => (true, None),
            Self::AwaitingStreamEnd { exit } => (false, Some(*exit)),
            Self::Aborting { .. } | Self::Finished(_) => return false,
        };
        *self = Self::Aborting {
            cause,
            stream_ended,
            exit,
        };
        self.settle_abort();
        true
    }

    /// Requests a stop. A no-op once the process has exited.
    pub fn on_stop(&mut self) -> bool {
        match self {
            Self::Running | Self::AwaitingExit => self.on_error(FailureCause::Stopped),
            _ => false,
        }
    }

    fn settle_abort(&mut self) {
        if let Self::Aborting {
            cause,
            stream_ended: true,
            exit: Some(exit),
        } = self
        {
            let failure = RunFailure {
                cause: cause.clone(),
                exit_code: exit.code,
            };
            *self = Self::Finished(RunOutcome::Failed(failure));
        }
    }
}

fn resolve_exit(exit: ProcessExit) -> RunOutcome {
    if exit.success() {
        RunOutcome::Completed
    } else {
        RunOutcome::Failed(RunFailure {
            cause: FailureCause::ExitStatus,
            exit_code: exit.code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(cause: FailureCause, exit_code: Option<i32>) -> RunOutcome {
        RunOutcome::Failed(RunFailure { cause, exit_code })
    }

    #[test]
    fn test_completes_only_after_stream_end_and_exit() {
        let mut state = RunState::Running;
        state.on_stream_end();
        assert_eq!(state, RunState::AwaitingExit);
        assert!(!state.accepts_records());
        state.on_exit(ProcessExit::code(0));
        assert_eq!(state.outcome(), Some(&RunOutcome::Completed));

        let mut state = RunState::Running;
        state.on_exit(ProcessExit::code(0));
        assert!(state.accepts_records());
        assert!(!state.is_finished());
        state.on_stream_end();
        assert_eq!(state.outcome(), Some(&RunOutcome::Completed));
    }

    #[test]
    fn test_nonzero_exit_fails_with_code() {
        let mut state = RunState::Running;
        state.on_exit(ProcessExit::code(1));
        state.on_stream_end();
        assert_eq!(
            state.outcome(),
            Some(&failed(FailureCause::ExitStatus, Some(1)))
        );
    }

    #[test]
    fn test_error_is_sticky() {
        let mut state = RunState::Running;
        assert!(state.on_error(FailureCause::Parse("bad".into())));
        assert!(!state.on_error(FailureCause::Rejected("later".into())));
        assert!(!state.accepts_records());
        state.on_stream_end();
        state.on_exit(ProcessExit::code(0));
        assert_eq!(
            state.outcome(),
            Some(&failed(FailureCause::Parse("bad".into()), Some(0)))
        );
    }

    #[test]
    fn test_error_after_exit_waits_for_stream_end() {
        let mut state = RunState::Running;
        state.on_exit(ProcessExit::code(1));
        assert!(state.on_error(FailureCause::Parse("unclosed".into())));
        assert!(!state.is_finished());
        state.on_stream_end();
        assert_eq!(
            state.outcome(),
            Some(&failed(FailureCause::Parse("unclosed".into()), Some(1)))
        );
    }

    #[test]
    fn test_stop_before_exit_fails_with_signal() {
        let mut state = RunState::Running;
        assert!(state.on_stop());
        assert!(!state.on_stop());
        state.on_stream_end();
        state.on_exit(ProcessExit::signalled());
        assert_eq!(state.outcome(), Some(&failed(FailureCause::Stopped, None)));
    }

    #[test]
    fn test_stop_after_exit_is_noop() {
        let mut state = RunState::Running;
        state.on_exit(ProcessExit::code(0));
        assert!(!state.on_stop());
        assert!(state.accepts_records());
        state.on_stream_end();
        assert_eq!(state.outcome(), Some(&RunOutcome::Completed));

        assert!(!state.on_stop());
        assert!(!state.on_error(FailureCause::Io("late".into())));
        assert_eq!(state.outcome(), Some(&RunOutcome::Completed));
    }

    #[test]
    fn test_display() {
        let failure = RunFailure {
            cause: FailureCause::ExitStatus,
            exit_code: Some(1),
        };
        assert_eq!(failure.to_string(), "unsuccessful exit (exit code 1)");
    }
}
