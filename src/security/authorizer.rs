//! Claims-based authorization.
//!
//! Decides whether a token context satisfies the required-claim set a
//! runbook declares. Authorization passes iff for every required claim the
//! caller holds at least one of the allowed values.

use crate::core::{ServiceError, ServiceResult, TokenContext};

/// Evaluator for required-claim sets.
#[derive(Debug, Default)]
pub struct ClaimsAuthorizer;

/// One failed claim check, for the denial message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedClaim {
    /// Claim name
    pub name: String,
    /// Values the caller held (empty when the claim was absent)
    pub held: Vec<String>,
    /// Values the runbook allows
    pub required: Vec<String>,
}

impl FailedClaim {
    fn describe(&self) -> String {
        if self.held.is_empty() {
            format!("{} (not present)", self.name)
        } else {
            format!(
                "{}={} (required: {})",
                self.name,
                self.held.join(", "),
                self.required.join(", ")
            )
        }
    }
}

impl ClaimsAuthorizer {
    /// Create an authorizer.
    pub fn new() -> Self {
        Self
    }

    /// Check a token against a required-claim set for an operation.
    ///
    /// An absent or empty required-claim set grants open access. A required
    /// claim the token does not hold at all fails the check.
    pub fn check(
        &self,
        token: &TokenContext,
        required_claims: Option<&[(String, Vec<String>)]>,
        operation: &str,
    ) -> ServiceResult<()> {
        let Some(required_claims) = required_claims else {
            return Ok(());
        };
        if required_claims.is_empty() {
            return Ok(());
        }

        let mut failed: Vec<FailedClaim> = Vec::new();
        for (name, allowed) in required_claims {
            let held = token.claims.get(name).cloned().unwrap_or_default();
            let matches = held.iter().any(|value| allowed.contains(value));
            if token.claims.get(name).is_none() || !matches {
                failed.push(FailedClaim {
                    name: name.clone(),
                    held,
                    required: allowed.clone(),
                });
            }
        }

        if failed.is_empty() {
            return Ok(());
        }

        let details: Vec<String> = failed.iter().map(FailedClaim::describe).collect();
        let message = format!(
            "RBAC check failed for {operation}. Access denied for user {}. Missing or invalid claims: {}",
            token.subject,
            details.join(", ")
        );
        tracing::warn!(
            user = %token.subject,
            operation,
            failed = ?failed.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            "RBAC check failed"
        );
        Err(ServiceError::AuthorizationDenied(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required(claims: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        claims
            .iter()
            .map(|(name, values)| {
                (name.to_string(), values.iter().map(ToString::to_string).collect())
            })
            .collect()
    }

    #[test]
    fn test_no_required_claims_passes() {
        let authorizer = ClaimsAuthorizer::new();
        let token = TokenContext::new("alice");
        assert!(authorizer.check(&token, None, "execute").is_ok());
    }

    #[test]
    fn test_empty_required_claims_passes() {
        let authorizer = ClaimsAuthorizer::new();
        let token = TokenContext::new("alice");
        assert!(authorizer.check(&token, Some(&[]), "execute").is_ok());
    }

    #[test]
    fn test_intersection_passes() {
        let authorizer = ClaimsAuthorizer::new();
        let token = TokenContext::new("alice").with_claim("roles", &["developer"]);
        let claims = required(&[("roles", &["developer", "admin"])]);
        assert!(authorizer.check(&token, Some(&claims), "execute").is_ok());
    }

    #[test]
    fn test_disjoint_values_denied() {
        let authorizer = ClaimsAuthorizer::new();
        let token = TokenContext::new("alice").with_claim("roles", &["viewer"]);
        let claims = required(&[("roles", &["developer", "admin"])]);

        let err = authorizer.check(&token, Some(&claims), "execute").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("RBAC check failed for execute"));
        assert!(message.contains("alice"));
        assert!(message.contains("roles=viewer (required: developer, admin)"));
    }

    #[test]
    fn test_absent_claim_denied() {
        let authorizer = ClaimsAuthorizer::new();
        let token = TokenContext::new("bob");
        let claims = required(&[("roles", &["admin"])]);

        let err = authorizer.check(&token, Some(&claims), "validate").unwrap_err();
        assert!(err.to_string().contains("roles (not present)"));
    }

    #[test]
    fn test_every_required_claim_must_intersect() {
        let authorizer = ClaimsAuthorizer::new();
        let token = TokenContext::new("carol")
            .with_claim("roles", &["admin"])
            .with_claim("env", &["staging"]);
        let claims = required(&[("roles", &["admin"]), ("env", &["production"])]);

        let err = authorizer.check(&token, Some(&claims), "execute").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("env=staging (required: production)"));
        assert!(!message.contains("roles=admin"));
    }

    #[test]
    fn test_denial_lists_first_failing_claim_first() {
        let authorizer = ClaimsAuthorizer::new();
        let token = TokenContext::new("dave");
        let claims = required(&[("roles", &["admin"]), ("env", &["production"])]);

        let err = authorizer.check(&token, Some(&claims), "execute").unwrap_err();
        let message = err.to_string();
        let roles_pos = message.find("roles").unwrap();
        let env_pos = message.find("env").unwrap();
        assert!(roles_pos < env_pos);
    }
}
