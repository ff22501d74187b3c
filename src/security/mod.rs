//! Authorization and input sanitization.

mod authorizer;
pub mod sanitization;

pub use authorizer::{ClaimsAuthorizer, FailedClaim};
pub use sanitization::{
    is_system_env_name, is_valid_env_name, sanitize_env_vars, scrub_value, SanitizedEnv,
    SYSTEM_ENV_VARS,
};
