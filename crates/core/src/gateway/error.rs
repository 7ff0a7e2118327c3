use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Metrics gateway server is not configured (gateway.server / MGS_SERVER)")]
    NotConfigured,

    #[error("Metrics gateway responded with status code {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Metrics gateway connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Metrics gateway request timed out")]
    Timeout,

    #[error("Metrics gateway request failed: {0}")]
    Transport(String),
}

impl GatewayError {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "rejected",
            _ => "error",
        }
    }
}
