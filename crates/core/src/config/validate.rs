use super::{types::Config, ConfigError};

/// Validate configuration
///
/// Broker credentials are not checked here; a missing user or server is
/// reported when the session starts.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    if config.batch.size == 0 {
        return Err(ConfigError::ValidationError(
            "batch.size must be at least 1".to_string(),
        ));
    }

    match config.processors.parallelism {
        Some(0) => {
            return Err(ConfigError::ValidationError(
                "processors.parallelism must be at least 1".to_string(),
            ))
        }
        Some(n) if n > u16::MAX as usize => {
            return Err(ConfigError::ValidationError(format!(
                "processors.parallelism cannot exceed {}",
                u16::MAX
            )))
        }
        _ => {}
    }

    if config.broker.recovery.max_multiplier == 0 {
        return Err(ConfigError::ValidationError(
            "broker.recovery.max_multiplier must be at least 1".to_string(),
        ));
    }

    if config.broker.exchange.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "broker.exchange cannot be empty".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, ProcessorsConfig, RecoveryConfig, ServerConfig};
    use std::net::IpAddr;

    #[test]
    fn test_validate_valid_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let config = Config {
            server: ServerConfig {
                host: "0.0.0.0".parse::<IpAddr>().unwrap(),
                port: 0,
            },
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_batch_size_zero_fails() {
        let config = Config {
            batch: BatchConfig { size: 0 },
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_parallelism_bounds() {
        let zero = Config {
            processors: ProcessorsConfig {
                parallelism: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(validate_config(&zero).is_err());

        let huge = Config {
            processors: ProcessorsConfig {
                parallelism: Some(100_000),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(validate_config(&huge).is_err());
    }

    #[test]
    fn test_validate_max_multiplier_zero_fails() {
        let mut config = Config::default();
        config.broker.recovery = RecoveryConfig {
            base_delay_ms: 500,
            max_multiplier: 0,
        };
        assert!(validate_config(&config).is_err());
    }
}
