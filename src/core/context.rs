//! Request context types.
//!
//! The token context is the evaluated request principal and the breadcrumb
//! is the per-request metadata that travels with every operation. Both are
//! constructed at the transport edge and treated as read-only inputs by the
//! core.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The evaluated request principal.
///
/// Claims are normalized at the edge to a list-of-strings map: a transport
/// that carries a claim as a single string must wrap it in a one-element
/// list before the core sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenContext {
    /// Subject (user id) of the caller
    pub subject: String,

    /// Held claims, claim name to list of held values
    pub claims: HashMap<String, Vec<String>>,

    /// Correlation id assigned to the request
    pub correlation_id: String,

    /// Remote address the request arrived from
    pub remote_addr: String,

    /// Raw bearer string, exported to scripts as `RUNBOOK_API_TOKEN`
    #[serde(skip_serializing, default)]
    pub raw_bearer: String,
}

impl TokenContext {
    /// Create a token context for a subject with no claims.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            claims: HashMap::new(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            remote_addr: "local".to_string(),
            raw_bearer: String::new(),
        }
    }

    /// Add a claim with its held values.
    #[must_use]
    pub fn with_claim(mut self, name: impl Into<String>, values: &[&str]) -> Self {
        self.claims.insert(name.into(), values.iter().map(ToString::to_string).collect());
        self
    }

    /// Set the raw bearer string.
    #[must_use]
    pub fn with_bearer(mut self, bearer: impl Into<String>) -> Self {
        self.raw_bearer = bearer.into();
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Normalize a transport-shaped claim value into a list of strings.
    ///
    /// Transports may deliver a claim as a single string or a list; the
    /// core always sees one shape.
    pub fn normalize_claim_value(value: &serde_json::Value) -> Vec<String> {
        match value {
            serde_json::Value::String(s) => vec![s.clone()],
            serde_json::Value::Array(items) => items
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            serde_json::Value::Null => Vec::new(),
            other => vec![other.to_string()],
        }
    }
}

/// Per-request metadata carried through the core.
///
/// Constructed at request entry, extended by the service with the current
/// runbook before delegation to the executor, never mutated by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breadcrumb {
    /// Timestamp the request was received
    pub at_time: DateTime<Utc>,

    /// User id of the caller
    pub by_user: String,

    /// Source address of the request
    pub from_ip: String,

    /// Correlation id for request tracking
    pub correlation_id: String,

    /// Runbook filenames currently executing upstream, innermost last
    #[serde(default)]
    pub recursion_stack: Vec<String>,
}

impl Breadcrumb {
    /// Create a breadcrumb for a token at the current instant.
    pub fn for_token(token: &TokenContext) -> Self {
        Self {
            at_time: Utc::now(),
            by_user: token.subject.clone(),
            from_ip: token.remote_addr.clone(),
            correlation_id: token.correlation_id.clone(),
            recursion_stack: Vec::new(),
        }
    }

    /// Set the inbound recursion stack.
    #[must_use]
    pub fn with_recursion_stack(mut self, stack: Vec<String>) -> Self {
        self.recursion_stack = stack;
        self
    }

    /// Parse an inbound recursion stack from its JSON wire form.
    ///
    /// A missing or malformed stack is treated as a top-level execution
    /// (empty stack), with a warning for the malformed case.
    pub fn parse_recursion_stack(raw: Option<&str>) -> Vec<String> {
        let Some(raw) = raw else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<String>>(raw) {
            Ok(stack) => stack,
            Err(e) => {
                tracing::warn!(raw, error = %e, "Ignoring malformed recursion stack");
                Vec::new()
            }
        }
    }

    /// The recursion stack in its JSON wire form.
    pub fn recursion_stack_json(&self) -> String {
        serde_json::to_string(&self.recursion_stack).unwrap_or_else(|_| "[]".to_string())
    }
}
