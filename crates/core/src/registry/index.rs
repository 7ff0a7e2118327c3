use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use super::descriptor::{ContentTypeKey, ProcessorDescriptor};

/// Content-type key to processor lookup, built once after discovery.
#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    processors: Vec<Arc<ProcessorDescriptor>>,
    by_key: HashMap<ContentTypeKey, Arc<ProcessorDescriptor>>,
}

impl ProcessorRegistry {
    /// Registers descriptors in order. On a key collision the later one wins.
    pub fn new(descriptors: Vec<ProcessorDescriptor>) -> Self {
        let mut registry = Self::default();
        for descriptor in descriptors {
            let descriptor = Arc::new(descriptor);
            for key in descriptor.consumes() {
                if let Some(previous) = registry
                    .by_key
                    .insert(key.clone(), Arc::clone(&descriptor))
                {
                    warn!(
                        key = %key,
                        previous = previous.name(),
                        current = descriptor.name(),
                        "Content type claimed by more than one processor, keeping the last"
                    );
                }
            }
            registry.processors.push(descriptor);
        }
        registry
    }

    pub fn lookup(&self, key: &ContentTypeKey) -> Option<Arc<ProcessorDescriptor>> {
        self.by_key.get(key).cloned()
    }

    pub fn descriptors(&self) -> &[Arc<ProcessorDescriptor>] {
        &self.processors
    }

    /// Distinct keys, sorted.
    pub fn content_type_keys(&self) -> Vec<ContentTypeKey> {
        let mut keys: Vec<_> = self.by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}
