//! Core types and functionality for Runbookd.
//!
//! This module contains the fundamental pieces the service composes:
//! configuration, request context, error kinds, the execution workspace,
//! the script executor, the recursion guard, and the history recorder.

mod config;
mod context;
mod error;
mod executor;
mod history;
mod recursion;
mod workspace;

pub use config::{ConfigItem, RunbookConfig};
pub use context::{Breadcrumb, TokenContext};
pub use error::{ServiceError, ServiceResult};
pub use executor::{
    compose_environment, CancelToken, ExecutionOutput, ScriptExecutor, SystemEnv,
    CANCELLED_RETURN_CODE, TIMEOUT_RETURN_CODE,
};
pub use history::{format_timestamp, ExecutionRecord, HistoryRecorder, Operation};
pub use recursion::RecursionGuard;
pub use workspace::{Workspace, SCRIPT_FILE_NAME, WORKSPACE_PREFIX};
