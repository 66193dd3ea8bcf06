//! Workload identity bindings (IRSA-style).
//!
//! A binding lets exactly one Kubernetes service account assume a role that
//! carries a set of policies. The trust relationship is anchored to the
//! cluster's OIDC token issuer: tokens from any other issuer, namespace or
//! account are refused.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ValidationError, ValidationResult};

/// Audience claim expected on projected service-account tokens.
pub const TOKEN_AUDIENCE: &str = "sts.amazonaws.com";

static POLICY_ARN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^arn:aws[a-z-]*:iam::(aws|\d{12}):policy/[\w+=,.@/-]+$")
        .expect("policy ARN pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityBindingDescriptor {
    pub role_name: String,
    pub namespace: String,
    pub service_account: String,
    pub policy_arns: Vec<String>,
}

impl IdentityBindingDescriptor {
    pub fn validate(&self) -> ValidationResult<()> {
        if self.policy_arns.is_empty() {
            return Err(ValidationError::NoPolicies);
        }
        if let Some(bad) = self.policy_arns.iter().find(|arn| !POLICY_ARN.is_match(arn)) {
            return Err(ValidationError::InvalidPolicyArn(bad.clone()));
        }
        Ok(())
    }

    /// `system:serviceaccount:<namespace>:<account>`
    pub fn subject(&self) -> String {
        format!(
            "system:serviceaccount:{}:{}",
            self.namespace, self.service_account
        )
    }

    /// The trust policy binding this role to the cluster's token issuer.
    pub fn trust_policy(&self, oidc_provider_arn: &str, issuer: &str) -> TrustPolicy {
        TrustPolicy {
            provider_arn: oidc_provider_arn.to_string(),
            issuer: strip_scheme(issuer).to_string(),
            subject: self.subject(),
            audience: TOKEN_AUDIENCE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPolicy {
    pub provider_arn: String,
    /// Issuer host and path, without scheme.
    pub issuer: String,
    pub subject: String,
    pub audience: String,
}

impl TrustPolicy {
    /// Whether a token with these claims may assume the role.
    pub fn permits(&self, issuer: &str, namespace: &str, service_account: &str) -> bool {
        strip_scheme(issuer) == self.issuer
            && format!("system:serviceaccount:{namespace}:{service_account}") == self.subject
    }

    /// Render as an assume-role policy document.
    pub fn document(&self) -> serde_json::Value {
        json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Federated": self.provider_arn },
                "Action": "sts:AssumeRoleWithWebIdentity",
                "Condition": {
                    "StringEquals": {
                        (format!("{}:sub", self.issuer)): self.subject,
                        (format!("{}:aud", self.issuer)): self.audience,
                    }
                }
            }]
        })
    }
}

fn strip_scheme(issuer: &str) -> &str {
    issuer.strip_prefix("https://").unwrap_or(issuer)
}
