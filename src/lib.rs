//! # Runbookd
//!
//! Runbook validation and execution engine.
//!
//! A runbook is a markdown file that declares an operational procedure: an
//! environment contract, filesystem preconditions, optional authorization
//! requirements, an embedded shell script, and an append-only execution
//! history. This crate parses, validates, authorizes, and executes runbooks
//! in isolated temporary workspaces under strict resource limits, and
//! records every operation both in the runbook file and in the structured
//! log stream.
//!
//! ## Architecture
//!
//! - **Parser** extracts sections, fenced code blocks, and YAML payloads
//!   from the markdown dialect.
//! - **Validator** composes parser output into a pass/fail report.
//! - **Authorizer** evaluates required-claim sets against a caller's claims.
//! - **Workspace** hosts one script execution in an owner-only temp
//!   directory, disposed on every exit path.
//! - **Executor** runs the script with a fresh environment, a timeout, and
//!   output caps.
//! - **Recursion guard** detects cycles across nested runbook invocations.
//! - **History recorder** appends to the runbook file and emits the
//!   canonical record to the logs.
//! - **Service** orchestrates the above into the operations a transport
//!   layer exposes: `list`, `get`, `required_env`, `validate`, `execute`.
//!
//! The HTTP transport, JWT verification, rate limiting, and metrics are
//! external collaborators and not part of this crate.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_panics_doc)]

pub mod core;
pub mod runbook;
pub mod security;
pub mod service;

// Re-export commonly used types
pub use crate::core::{
    Breadcrumb, CancelToken, ExecutionRecord, HistoryRecorder, Operation, RunbookConfig,
    ScriptExecutor, ServiceError, ServiceResult, TokenContext, Workspace,
};
pub use crate::runbook::{Runbook, ValidationReport};
pub use crate::security::ClaimsAuthorizer;
pub use crate::service::RunbookService;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "runbookd";
