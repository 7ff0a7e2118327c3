//! Units of work decoded from broker deliveries.

use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::broker::Delivery;
use crate::registry::ContentTypeKey;

/// One JSON object emitted by a processor.
pub type Record = Map<String, Value>;

pub const HEADER_PATH: &str = "path";
pub const HEADER_ACCESS_TOKEN: &str = "accessToken";
pub const HEADER_TENANT_ID: &str = "tenantId";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkError {
    #[error("message body is not a JSON object: {0}")]
    InvalidBody(String),

    #[error("message body has no dataType (or metric and category)")]
    MissingContentType,

    #[error("message has no {0} header")]
    MissingHeader(&'static str),
}

/// Classification of the content, taken from the message body.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentMetadata {
    key: ContentTypeKey,
    fields: Map<String, Value>,
}

impl ContentMetadata {
    pub fn new(key: impl Into<ContentTypeKey>) -> Self {
        let key = key.into();
        let mut fields = Map::new();
        fields.insert("dataType".to_string(), Value::String(key.to_string()));
        Self { key, fields }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Accepts `dataType`, or the legacy `metric` + `category` pair.
    pub fn from_json(bytes: &[u8]) -> Result<Self, WorkError> {
        let fields: Map<String, Value> =
            serde_json::from_slice(bytes).map_err(|e| WorkError::InvalidBody(e.to_string()))?;

        let data_type = fields
            .get("dataType")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty());

        let key = match data_type {
            Some(data_type) => ContentTypeKey::new(data_type),
            None => match (
                fields.get("metric").and_then(Value::as_str),
                fields.get("category").and_then(Value::as_str),
            ) {
                (Some(metric), Some(category)) => ContentTypeKey::from_legacy(metric, category),
                _ => return Err(WorkError::MissingContentType),
            },
        };

        Ok(Self { key, fields })
    }

    pub fn key(&self) -> &ContentTypeKey {
        &self.key
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// Routing data carried in message headers.
#[derive(Clone, PartialEq, Eq)]
pub struct ProcessingMetadata {
    pub path: PathBuf,
    pub access_token: Option<String>,
    pub tenant_id: Option<String>,
}

impl ProcessingMetadata {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            access_token: None,
            tenant_id: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

impl fmt::Debug for ProcessingMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingMetadata")
            .field("path", &self.path)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[redacted]"),
            )
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

/// Everything needed to process one uploaded artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOfWork {
    pub content: ContentMetadata,
    pub processing: ProcessingMetadata,
}

impl UnitOfWork {
    pub fn new(content: ContentMetadata, processing: ProcessingMetadata) -> Self {
        Self {
            content,
            processing,
        }
    }

    pub fn from_delivery(delivery: &Delivery) -> Result<Self, WorkError> {
        let content = ContentMetadata::from_json(&delivery.payload)?;

        let path = delivery
            .header(HEADER_PATH)
            .filter(|p| !p.is_empty())
            .ok_or(WorkError::MissingHeader(HEADER_PATH))?;

        let processing = ProcessingMetadata {
            path: PathBuf::from(path),
            access_token: delivery
                .header(HEADER_ACCESS_TOKEN)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            tenant_id: delivery
                .header(HEADER_TENANT_ID)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        };

        Ok(Self::new(content, processing))
    }

    pub fn key(&self) -> &ContentTypeKey {
        self.content.key()
    }

    pub fn path(&self) -> &Path {
        &self.processing.path
    }
}
