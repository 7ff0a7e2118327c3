//! Error types for processor discovery.

use std::path::PathBuf;
use thiserror::Error;

/// Discovery as a whole failed. Only an unreadable root directory does this.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to read processors directory {path}: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single processor was rejected. Logged and skipped during discovery.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("Cannot read descriptor {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Descriptor {path} is not valid JSON: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Descriptor {path} doesn't have {field} defined")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("Descriptor {path} has an invalid consumes list: {reason}")]
    InvalidConsumes { path: PathBuf, reason: String },

    #[error("Processor {name} could not be started: {source}")]
    SelfTestSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Processor {name} failed its self test (exit code {exit_code:?})")]
    SelfTestFailed {
        name: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Processor {name} did not finish its self test within {timeout_secs} seconds")]
    SelfTestTimeout { name: String, timeout_secs: u64 },
}

impl DescriptorError {
    pub fn missing_field(path: impl Into<PathBuf>, field: &'static str) -> Self {
        Self::MissingField {
            path: path.into(),
            field,
        }
    }

    pub fn invalid_consumes(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidConsumes {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
