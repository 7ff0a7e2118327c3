//! Error types for the runner module.

use thiserror::Error;

use crate::registry::ContentTypeKey;

/// A processor could not be started.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to start processor {processor}: {source}")]
    Spawn {
        processor: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Processor {processor} started without a {pipe} pipe")]
    MissingPipe {
        processor: String,
        pipe: &'static str,
    },
}

/// A unit of work could not be dispatched.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("No processor registered for content type {key}")]
    UnsupportedContent { key: ContentTypeKey },

    #[error(transparent)]
    Runner(#[from] RunnerError),
}
