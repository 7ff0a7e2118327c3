//! Test doubles for the broker, the runner and the gateway.
//!
//! These let the consumer and the session manager be exercised end to end
//! without RabbitMQ, child processes or an HTTP gateway.
//!
//! # Example
//!
//! ```rust,ignore
//! use harvester_core::testing::{fixtures, MemoryBroker, RecordingSink, ScriptedRunner};
//!
//! let runner = ScriptedRunner::new();
//! runner.push_records(vec![fixtures::record(json!({"a": 1}))]);
//!
//! let sink = RecordingSink::new();
//! let consumer = ResultConsumer::new(registry, Arc::new(runner), Arc::new(sink), 10);
//! ```

mod memory_broker;
mod recording_sink;
mod scripted_runner;

pub use memory_broker::{AckRecord, Binding, MemoryBroker};
pub use recording_sink::{RecordedBatch, RecordingSink};
pub use scripted_runner::{Execution, ScriptedRunner};

/// Builders for common test values.
pub mod fixtures {
    use serde_json::Value;
    use std::path::Path;

    use crate::broker::Delivery;
    use crate::registry::{ContentTypeKey, ProcessorDescriptor};
    use crate::work::{Record, HEADER_ACCESS_TOKEN, HEADER_PATH, HEADER_TENANT_ID};

    /// Converts a JSON object into a record. Non-objects become empty records.
    pub fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => Record::new(),
        }
    }

    /// A descriptor that consumes `keys` and runs nothing in particular.
    pub fn descriptor(name: &str, keys: &[&str]) -> ProcessorDescriptor {
        ProcessorDescriptor::new(
            name,
            "true",
            std::env::temp_dir(),
            keys.iter().map(|k| ContentTypeKey::new(*k)).collect(),
        )
    }

    /// A delivery for content of type `data_type` stored at `path`.
    pub fn delivery(tag: u64, data_type: &str, path: &Path) -> Delivery {
        let mut delivery = Delivery {
            delivery_tag: tag,
            routing_key: data_type.to_string(),
            payload: serde_json::json!({ "dataType": data_type })
                .to_string()
                .into_bytes(),
            ..Delivery::default()
        };
        delivery
            .headers
            .insert(HEADER_PATH.to_string(), path.display().to_string());
        delivery
            .headers
            .insert(HEADER_ACCESS_TOKEN.to_string(), "test-token".to_string());
        delivery
            .headers
            .insert(HEADER_TENANT_ID.to_string(), "test-tenant".to_string());
        delivery
    }
}
