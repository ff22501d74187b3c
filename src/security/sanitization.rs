//! Environment variable sanitization.
//!
//! Caller-supplied environment variables pass through a name rule and a
//! value scrub before they reach a script, and the system-managed names
//! are protected from override.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::{ServiceError, ServiceResult};

/// Valid environment variable names: letter or underscore first, then
/// alphanumerics and underscores.
static ENV_VAR_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static pattern compiles"));

/// Environment variable names the system manages; caller values for these
/// are ignored.
pub const SYSTEM_ENV_VARS: &[&str] = &[
    "RUNBOOK_API_TOKEN",
    "RUNBOOK_CORRELATION_ID",
    "RUNBOOK_URL",
    "RUNBOOK_API_BASE_URL",
    "RUNBOOK_RECURSION_STACK",
    "RUNBOOK_H_AUTH",
    "RUNBOOK_H_CORR",
    "RUNBOOK_H_RECUR",
    "RUNBOOK_H_CTYPE",
    "RUNBOOK_HEADERS",
];

/// Result of sanitizing a caller environment map.
#[derive(Debug, Clone, Default)]
pub struct SanitizedEnv {
    /// Accepted variables with scrubbed values
    pub vars: HashMap<String, String>,

    /// Non-blocking observations (override attempts, scrubbed values)
    pub warnings: Vec<String>,
}

/// Whether a name is a valid environment variable name.
pub fn is_valid_env_name(name: &str) -> bool {
    ENV_VAR_NAME.is_match(name)
}

/// Whether a name is system-managed.
pub fn is_system_env_name(name: &str) -> bool {
    SYSTEM_ENV_VARS.contains(&name)
}

/// Validate and scrub a caller-supplied environment map.
///
/// Any invalid name rejects the whole request. Attempts to set
/// system-managed names are dropped with a warning. Values are scrubbed of
/// control characters below U+0020 except horizontal tab, newline, and
/// carriage return.
pub fn sanitize_env_vars(env_vars: &HashMap<String, String>) -> ServiceResult<SanitizedEnv> {
    let mut sanitized = SanitizedEnv::default();

    for (name, value) in env_vars {
        if is_system_env_name(name) {
            tracing::warn!(
                name,
                "Caller attempted to override a system-managed environment variable; ignoring"
            );
            sanitized
                .warnings
                .push(format!("Ignored attempt to override system-managed variable: {name}"));
            continue;
        }

        if !is_valid_env_name(name) {
            tracing::warn!(name, "Rejected invalid environment variable name");
            return Err(ServiceError::InvalidEnvVarName(name.clone()));
        }

        let scrubbed = scrub_value(value);
        if scrubbed.len() != value.len() {
            let removed = value.chars().count() - scrubbed.chars().count();
            tracing::warn!(name, removed, "Scrubbed control characters from value");
            sanitized.warnings.push(format!(
                "Removed {removed} control characters from value of {name}"
            ));
        }
        sanitized.vars.insert(name.clone(), scrubbed);
    }

    Ok(sanitized)
}

/// Remove low control characters from a value, keeping tab, newline, and
/// carriage return so multi-line script inputs survive.
///
/// Only code points below U+0020 are stripped; DEL and the C1 range pass
/// through unchanged.
pub fn scrub_value(value: &str) -> String {
    value
        .chars()
        .filter(|&c| c >= ' ' || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}
