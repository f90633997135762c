use crate::k8s::policy::{DynamicAuthorizationPolicySpec, DynamicPolicy};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum SpecError {
    #[error("dynamic policy names must not be empty")]
    EmptyName,

    #[error("dynamic policy {0} is declared more than once")]
    DuplicateName(String),

    /// A policy with no selectors would match every pod, and no pod label change would ever
    /// trigger its recomputation.
    #[error("dynamic policy {0} must select at least one label")]
    EmptySelector(String),

    #[error("dynamic policy {0} selects a label with an empty key")]
    EmptyLabelKey(String),

    #[error("dynamic policy {name} has an invalid trust domain {trust_domain:?}: must not contain '/' or whitespace")]
    InvalidTrustDomain { name: String, trust_domain: String },
}

/// Checks a `DynamicAuthorizationPolicy` spec before it is admitted.
pub(crate) fn validate_spec(spec: &DynamicAuthorizationPolicySpec) -> Result<(), SpecError> {
    let mut names = HashSet::new();
    for policy in spec.dynamic_policies.iter() {
        validate_policy(policy)?;
        if !names.insert(policy.name.as_str()) {
            return Err(SpecError::DuplicateName(policy.name.clone()));
        }
    }
    Ok(())
}

fn validate_policy(policy: &DynamicPolicy) -> Result<(), SpecError> {
    if policy.name.is_empty() {
        return Err(SpecError::EmptyName);
    }

    if policy.pod_selectors.is_empty() {
        return Err(SpecError::EmptySelector(policy.name.clone()));
    }

    if policy.pod_selectors.iter().any(|(k, _)| k.is_empty()) {
        return Err(SpecError::EmptyLabelKey(policy.name.clone()));
    }

    if let Some(td) = policy.trust_domain.as_deref() {
        if td.contains('/') || td.contains(char::is_whitespace) {
            return Err(SpecError::InvalidTrustDomain {
                name: policy.name.clone(),
                trust_domain: td.to_string(),
            });
        }
    }

    Ok(())
}
