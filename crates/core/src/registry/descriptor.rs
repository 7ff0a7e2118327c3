//! Processor descriptors and content-type keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

use super::error::DescriptorError;

/// File name looked up in every processor directory.
pub const DESCRIPTOR_FILE_NAME: &str = "processor-descriptor.json";

/// Identifies which processor handles a piece of content.
///
/// Also used verbatim as broker queue name and routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentTypeKey(String);

impl ContentTypeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Normalises the legacy `{metric, category}` pair.
    pub fn from_legacy(metric: &str, category: &str) -> Self {
        Self(format!("{}/{}", metric, category))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentTypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentTypeKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// One entry of a descriptor's `consumes` list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConsumesEntry {
    DataType {
        #[serde(rename = "dataType")]
        data_type: String,
    },
    Legacy {
        metric: String,
        category: String,
    },
}

impl ConsumesEntry {
    fn into_key(self) -> Option<ContentTypeKey> {
        match self {
            Self::DataType { data_type } if !data_type.trim().is_empty() => {
                Some(ContentTypeKey::new(data_type))
            }
            Self::Legacy { metric, category } if !metric.is_empty() && !category.is_empty() => {
                Some(ContentTypeKey::from_legacy(&metric, &category))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    name: Option<String>,
    command: Option<String>,
    consumes: Option<Value>,
}

/// A validated processor: what to run, where, and for which content.
#[derive(Debug, Clone)]
pub struct ProcessorDescriptor {
    name: String,
    command: String,
    working_directory: PathBuf,
    consumes: Vec<ContentTypeKey>,
    span: tracing::Span,
}

impl ProcessorDescriptor {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        consumes: Vec<ContentTypeKey>,
    ) -> Self {
        let name = name.into();
        let span = tracing::info_span!("processor", processor = %name);
        Self {
            name,
            command: command.into(),
            working_directory: working_directory.into(),
            consumes,
            span,
        }
    }

    /// Parses descriptor JSON found in `directory`.
    pub fn parse(
        directory: &Path,
        descriptor_path: &Path,
        bytes: &[u8],
    ) -> Result<Self, DescriptorError> {
        let raw: RawDescriptor =
            serde_json::from_slice(bytes).map_err(|e| DescriptorError::Malformed {
                path: descriptor_path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let name = raw
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| DescriptorError::missing_field(descriptor_path, "name"))?;
        let command = raw
            .command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| DescriptorError::missing_field(descriptor_path, "command"))?;
        let consumes = raw
            .consumes
            .ok_or_else(|| DescriptorError::missing_field(descriptor_path, "consumes"))?;

        let entries = match consumes {
            Value::Array(entries) if !entries.is_empty() => entries,
            Value::Array(_) => {
                return Err(DescriptorError::invalid_consumes(
                    descriptor_path,
                    "consumes key must contain at least one entry",
                ))
            }
            _ => {
                return Err(DescriptorError::invalid_consumes(
                    descriptor_path,
                    "consumes key must contain an array",
                ))
            }
        };

        let mut keys = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let key = serde_json::from_value::<ConsumesEntry>(entry)
                .ok()
                .and_then(ConsumesEntry::into_key)
                .ok_or_else(|| {
                    DescriptorError::invalid_consumes(
                        descriptor_path,
                        format!(
                            "entry {} needs a dataType (or metric and category)",
                            index
                        ),
                    )
                })?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        Ok(Self::new(name, command, directory, keys))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn consumes(&self) -> &[ContentTypeKey] {
        &self.consumes
    }

    /// Span the processor's own diagnostics are logged under.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}
