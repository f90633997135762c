use crate::{principal::service_account_principal, ResourceId};
use dynamic_principals_k8s_api::Labels;

/// A workload that may be selected by policy rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub id: ResourceId,
    pub labels: Labels,
    pub service_account: String,
}

impl Subject {
    pub fn principal(&self, trust_domain: &str) -> String {
        service_account_principal(trust_domain, &self.id.namespace, &self.service_account)
    }
}
