//! Runbook document handling.
//!
//! Runbooks are markdown files with a fixed section structure: a name
//! heading, environment and filesystem contracts, optional required
//! claims, an embedded shell script, and an append-only history zone.

pub mod parser;
mod schema;
pub mod validator;

pub use parser::{EnvRequirement, FileRequirements, HistoryEntry};
pub use schema::Runbook;
pub use validator::{validate, ValidationReport};
