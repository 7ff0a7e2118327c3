//! Environment handed to a processor for one unit of work.

use serde_json::Value;
use tracing::level_filters::LevelFilter;

use crate::shell::PROCESSOR_ENV_PREFIX;
use crate::work::ContentMetadata;

/// `P_<FIELD>` for every scalar metadata field, plus `P_DATATYPE` and `P_LOGLEVEL`.
///
/// Field names are upper-cased and anything outside `[A-Z0-9_]` becomes `_`.
/// Nulls, arrays and objects are skipped.
pub fn processor_environment(
    content: &ContentMetadata,
    log_level: LevelFilter,
) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = content
        .fields()
        .iter()
        .filter_map(|(name, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null | Value::Array(_) | Value::Object(_) => return None,
            };
            Some((variable_name(name), value))
        })
        .filter(|(name, _)| name != "P_DATATYPE" && name != "P_LOGLEVEL")
        .collect();

    vars.push(("P_DATATYPE".to_string(), content.key().to_string()));
    vars.push((
        "P_LOGLEVEL".to_string(),
        log_level.to_string().to_lowercase(),
    ));
    vars
}

fn variable_name(field: &str) -> String {
    let mut name = String::with_capacity(PROCESSOR_ENV_PREFIX.len() + field.len());
    name.push_str(PROCESSOR_ENV_PREFIX);
    name.extend(field.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        }
    }));
    name
}
