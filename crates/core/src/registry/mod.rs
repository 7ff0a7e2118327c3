//! Processor registry: discovery, verification and lookup by content type.
//!
//! A processor is a directory holding a `processor-descriptor.json`:
//!
//! ```json
//! {
//!   "name": "cpu-usage",
//!   "command": "./extract.sh",
//!   "consumes": [{ "dataType": "cpu-usage/host" }]
//! }
//! ```
//!
//! Each candidate is run once with empty input before it is accepted.

mod descriptor;
mod discovery;
mod error;
mod index;

pub use descriptor::{ContentTypeKey, ProcessorDescriptor, DESCRIPTOR_FILE_NAME};
pub use discovery::{discover, self_test};
pub use error::{DescriptorError, DiscoveryError};
pub use index::ProcessorRegistry;
