use crate::{principal::DEFAULT_TRUST_DOMAIN, PrincipalSet, Subject};
use anyhow::{Context, Result};
use dynamic_principals_k8s_api::{
    policy::{DynamicAuthorizationPolicyStatus, DynamicPolicy},
    Selector,
};
use std::collections::BTreeMap;

/// The principals selected by each rule, keyed by rule name.
pub type PrincipalMapping = BTreeMap<String, PrincipalSet>;

/// A named selector whose matching subjects are resolved to principals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyRule {
    pub name: String,
    pub selector: Selector,
    pub trust_domain: String,
}

/// Lists the subjects whose labels include every pair in a selector.
pub trait ListSubjects {
    fn list_subjects(&self, selector: &Selector) -> Result<Vec<Subject>>;
}

impl<F> ListSubjects for F
where
    F: Fn(&Selector) -> Result<Vec<Subject>>,
{
    fn list_subjects(&self, selector: &Selector) -> Result<Vec<Subject>> {
        (self)(selector)
    }
}

// === impl PolicyRule ===

impl From<DynamicPolicy> for PolicyRule {
    fn from(policy: DynamicPolicy) -> Self {
        let trust_domain = policy
            .trust_domain
            .filter(|td| !td.is_empty())
            .unwrap_or_else(|| DEFAULT_TRUST_DOMAIN.to_string());
        Self {
            name: policy.name,
            selector: policy.pod_selectors,
            trust_domain,
        }
    }
}

/// Computes the principals selected by each rule.
///
/// Every rule name is present in the result, even when no subjects match. When rules share a
/// name, the last one wins. Listing errors abort the computation so that a partial mapping is
/// never returned.
pub fn compute<L>(rules: &[PolicyRule], subjects: &L) -> Result<PrincipalMapping>
where
    L: ListSubjects + ?Sized,
{
    let mut mapping = PrincipalMapping::new();
    for rule in rules {
        let selected = subjects
            .list_subjects(&rule.selector)
            .with_context(|| format!("failed to list subjects for rule {}", rule.name))?;
        let principals = selected
            .iter()
            .map(|subject| subject.principal(&rule.trust_domain))
            .collect::<PrincipalSet>();
        mapping.insert(rule.name.clone(), principals);
    }
    Ok(mapping)
}

/// Encodes a mapping as a resource status, with each rule's principals sorted.
pub fn to_status(mapping: PrincipalMapping) -> DynamicAuthorizationPolicyStatus {
    DynamicAuthorizationPolicyStatus {
        service_account_policy_mapping: mapping
            .into_iter()
            .map(|(name, principals)| (name, principals.into()))
            .collect(),
    }
}
