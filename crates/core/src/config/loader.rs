use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Prefix for structured environment overrides, e.g. `HARVESTER_BROKER__SERVER`.
pub const ENV_PREFIX: &str = "HARVESTER_";

/// Flat variable names read by earlier deployments, mapped to config keys.
const LEGACY_STRING_VARS: &[(&str, &str)] = &[
    ("PROCESSORS_PATH", "processors.path"),
    ("AMQ_SERVER", "broker.server"),
    ("AMQ_USER", "broker.user"),
    ("AMQ_PASSWORD", "broker.password"),
    ("MGS_SERVER", "gateway.server"),
];

const LEGACY_NUMERIC_VARS: &[(&str, &str)] = &[
    ("PROCESSORS_PARALLELISM", "processors.parallelism"),
    ("METRICS_BATCH_SIZE", "batch.size"),
];

/// Load configuration from file with environment variable overrides
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    extract(Figment::new().merge(Toml::file(path)), std::env::vars())
}

/// Load configuration from environment variables only.
pub fn load_config_from_env() -> Result<Config, ConfigError> {
    extract(Figment::new(), std::env::vars())
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

fn extract<I>(base: Figment, vars: I) -> Result<Config, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    base.merge(legacy_overrides(vars)?)
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Values are kept as strings so numeric-looking passwords survive.
fn legacy_overrides<I>(vars: I) -> Result<Figment, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut figment = Figment::new();

    for (name, value) in vars {
        if value.is_empty() {
            continue;
        }
        if let Some((_, key)) = LEGACY_STRING_VARS.iter().find(|(var, _)| *var == name) {
            figment = figment.merge(Serialized::default(key, value));
        } else if let Some((_, key)) = LEGACY_NUMERIC_VARS.iter().find(|(var, _)| *var == name) {
            let number: u64 = value.trim().parse().map_err(|_| {
                ConfigError::ParseError(format!("{} must be a number, got {:?}", name, value))
            })?;
            figment = figment.merge(Serialized::default(key, number));
        }
    }

    Ok(figment)
}
