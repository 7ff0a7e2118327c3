//! Process runner: executes a processor for one unit of work.
//!
//! The content file is streamed to the processor's stdin. Its stdout must be a
//! single JSON array of objects, parsed incrementally; each object becomes a
//! [`ProcessingEvent::Record`]. stderr lines are re-logged under the
//! processor's span. A run ends with exactly one terminal event once the
//! output has ended and the process has exited.

mod command;
mod env;
mod error;
mod handle;
mod json_stream;
mod state;
mod stderr;
mod traits;

pub use command::CommandRunner;
pub use env::processor_environment;
pub use error::{ProcessingError, RunnerError};
pub use handle::{Control, ProcessingEvent, ProcessingHandle};
pub use json_stream::{JsonArrayStream, StreamParseError};
pub use state::{FailureCause, ProcessExit, RunFailure, RunOutcome, RunState};
pub use traits::{dispatch, ProcessorRunner};
