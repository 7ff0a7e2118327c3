//! Runner seam used by the consumer.

use std::sync::Arc;

use super::error::{ProcessingError, RunnerError};
use super::handle::ProcessingHandle;
use crate::registry::{ProcessorDescriptor, ProcessorRegistry};
use crate::work::UnitOfWork;

/// Starts processors.
pub trait ProcessorRunner: Send + Sync + 'static {
    /// Starts `processor` on `unit` and returns a handle to its events.
    ///
    /// Must be called from within a Tokio runtime.
    fn execute(
        &self,
        processor: Arc<ProcessorDescriptor>,
        unit: &UnitOfWork,
    ) -> Result<ProcessingHandle, RunnerError>;
}

/// Looks up the processor for `unit` and starts it.
///
/// Fails without starting anything when no processor handles the unit's key.
pub fn dispatch<R>(
    registry: &ProcessorRegistry,
    runner: &R,
    unit: &UnitOfWork,
) -> Result<ProcessingHandle, ProcessingError>
where
    R: ProcessorRunner + ?Sized,
{
    let processor = registry
        .lookup(unit.key())
        .ok_or_else(|| ProcessingError::UnsupportedContent {
            key: unit.key().clone(),
        })?;
    Ok(runner.execute(processor, unit)?)
}
