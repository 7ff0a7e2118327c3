pub mod broker;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod service;
mod shell;
pub mod testing;
pub mod work;

pub use broker::{
    AmqpTransport, BrokerError, BrokerTransport, ConnectError, MessageHandler, SessionHandle,
    SessionManager, SessionStatus,
};
pub use config::{
    load_config, load_config_from_env, load_config_from_str, validate_config, Config, ConfigError,
    SanitizedConfig,
};
pub use gateway::{GatewayClient, GatewayError, MetricsSink};
pub use orchestrator::{MessageOutcome, ResultConsumer};
pub use registry::{discover, ContentTypeKey, ProcessorDescriptor, ProcessorRegistry};
pub use runner::{CommandRunner, ProcessingEvent, ProcessingHandle, ProcessorRunner};
pub use service::{HarvesterService, ServiceError};
pub use shell::PROCESSOR_ENV_PREFIX;
pub use work::{ContentMetadata, ProcessingMetadata, Record, UnitOfWork};
