use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub processors: ProcessorsConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Operational HTTP surface (health, metrics)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Where processors live and how many units may be in flight.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessorsConfig {
    /// Directory scanned for `<name>/processor-descriptor.json`.
    #[serde(default = "default_processors_path")]
    pub path: PathBuf,
    /// Broker prefetch. Defaults to the number of available CPUs.
    #[serde(default)]
    pub parallelism: Option<usize>,
    /// Upper bound for the one-off verification run of each processor.
    #[serde(default = "default_self_test_timeout")]
    pub self_test_timeout_secs: u64,
}

impl Default for ProcessorsConfig {
    fn default() -> Self {
        Self {
            path: default_processors_path(),
            parallelism: None,
            self_test_timeout_secs: default_self_test_timeout(),
        }
    }
}

impl ProcessorsConfig {
    /// Configured parallelism, or the host's available parallelism.
    pub fn effective_parallelism(&self) -> usize {
        self.parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn self_test_timeout(&self) -> Duration {
        Duration::from_secs(self.self_test_timeout_secs)
    }
}

fn default_processors_path() -> PathBuf {
    PathBuf::from("processors")
}

fn default_self_test_timeout() -> u64 {
    30
}

/// Message broker connection and topology.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// `host[:port]` of the AMQP server.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Durable topic exchange the upload notifications are published to.
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u16,
    #[serde(default = "default_frame_max")]
    pub frame_max: u32,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: None,
            user: None,
            password: String::new(),
            vhost: default_vhost(),
            exchange: default_exchange(),
            heartbeat_secs: default_heartbeat(),
            frame_max: default_frame_max(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = password.into();
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_exchange() -> String {
    "result-upload".to_string()
}

fn default_heartbeat() -> u16 {
    30
}

fn default_frame_max() -> u32 {
    4096
}

/// Backoff applied to reconnects and channel recreation.
///
/// The n-th consecutive retry waits `base_delay * min(2^n, max_multiplier)`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_multiplier")]
    pub max_multiplier: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_multiplier: default_max_multiplier(),
        }
    }
}

impl RecoveryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_multiplier() -> u32 {
    16
}

/// Downstream metrics gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// `host[:port]`, or a full base URL including the scheme.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default = "default_gateway_path")]
    pub path: String,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: None,
            path: default_gateway_path(),
            timeout_secs: default_gateway_timeout(),
        }
    }
}

impl GatewayConfig {
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Full URL of the event endpoint, if a server is configured.
    pub fn event_url(&self) -> Option<String> {
        let server = self.server.as_deref()?.trim().trim_end_matches('/');
        if server.is_empty() {
            return None;
        }
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        if server.contains("://") {
            Some(format!("{}{}", server, path))
        } else {
            Some(format!("http://{}{}", server, path))
        }
    }
}

fn default_gateway_path() -> String {
    "/mgs/rest/v1/gateway/event".to_string()
}

fn default_gateway_timeout() -> u64 {
    30
}

/// Outbound batching.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub processors: ProcessorsConfig,
    pub broker: SanitizedBrokerConfig,
    pub gateway: GatewayConfig,
    pub batch: BatchConfig,
    pub server: ServerConfig,
}

/// Broker config with the password hidden
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedBrokerConfig {
    pub server: Option<String>,
    pub user: Option<String>,
    pub password_configured: bool,
    pub vhost: String,
    pub exchange: String,
    pub heartbeat_secs: u16,
    pub frame_max: u32,
    pub recovery: RecoveryConfig,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            processors: config.processors.clone(),
            broker: SanitizedBrokerConfig {
                server: config.broker.server.clone(),
                user: config.broker.user.clone(),
                password_configured: !config.broker.password.is_empty(),
                vhost: config.broker.vhost.clone(),
                exchange: config.broker.exchange.clone(),
                heartbeat_secs: config.broker.heartbeat_secs,
                frame_max: config.broker.frame_max,
                recovery: config.broker.recovery.clone(),
            },
            gateway: config.gateway.clone(),
            batch: config.batch.clone(),
            server: config.server.clone(),
        }
    }
}
