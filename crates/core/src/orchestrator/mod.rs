//! Consumption orchestrator.
//!
//! For every delivery:
//! - decode the unit of work and look up its processor
//! - run the processor and batch its records toward the gateway
//! - settle the message exactly once and delete the artifact only when
//!   every record was delivered

mod batch;
mod consumer;
mod resolution;

pub use batch::Batch;
pub use consumer::ResultConsumer;
pub use resolution::{MessageOutcome, MessageResolution};
