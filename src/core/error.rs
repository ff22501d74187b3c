//! Service error kinds.
//!
//! The core raises one typed error enumeration; the transport layer maps
//! kinds to status codes in a single place.

use thiserror::Error;

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors the core raises to its caller.
///
/// Kinds that represent a completed-with-failure operation (validation
/// failures, authorization denials, recursion failures, script timeouts)
/// supply the message recorded in the execution record and the runbook
/// history. Request rejections (`BadFilename`, `InvalidEnvVarName`)
/// happen before any side effect and produce no history entry; `NotFound`
/// and IO failures surface before a runbook file exists to record into.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Filename does not resolve to a regular file in the runbooks directory.
    #[error("Runbook not found: {0}")]
    NotFound(String),

    /// Filename contains path separators or traversal components.
    #[error("Invalid runbook filename: {0}")]
    BadFilename(String),

    /// The validator reported errors; the payload is the joined error list.
    #[error("Validation failed. Cannot execute runbook.\n{0}")]
    ValidationFailed(String),

    /// Required claims unsatisfied for the operation.
    #[error("{0}")]
    AuthorizationDenied(String),

    /// The runbook is already on the inbound execution chain.
    #[error("Recursion detected: Runbook {filename} already in execution chain: {stack}")]
    RecursionDetected { filename: String, stack: String },

    /// The inbound execution chain is at the configured depth limit.
    #[error("Recursion depth exceeded: depth {depth} reaches limit {limit}")]
    RecursionDepthExceeded { depth: usize, limit: usize },

    /// A caller-supplied environment variable name was rejected.
    #[error(
        "Invalid environment variable name: {0}. Variable names must start with a letter or \
         underscore and contain only alphanumeric characters and underscores"
    )]
    InvalidEnvVarName(String),

    /// The script ran past the configured timeout.
    #[error("script timed out after {0} seconds")]
    ScriptTimeout(u64),

    /// Unexpected filesystem or spawn failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Whether this kind completes an operation with a recorded result.
    ///
    /// Rejections happen before any side effect, and `NotFound` and IO
    /// failures surface before there is a runbook file to append to; none
    /// of those produce an execution record.
    pub fn is_recorded(&self) -> bool {
        !matches!(
            self,
            Self::BadFilename(_) | Self::InvalidEnvVarName(_) | Self::NotFound(_) | Self::Io(_)
        )
    }
}
