use crate::labels::Selector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Names sets of pods, by label selector, whose service account principals should be resolved
/// into the resource's status.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "peerauth.aweis.io",
    version = "v1",
    kind = "DynamicAuthorizationPolicy",
    status = "DynamicAuthorizationPolicyStatus",
    shortname = "dap",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DynamicAuthorizationPolicySpec {
    pub dynamic_policies: Vec<DynamicPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynamicPolicy {
    pub name: String,

    /// Pods must carry every one of these labels to be selected.
    pub pod_selectors: Selector,

    /// The mesh trust domain used as the principal prefix. Defaults to `cluster.local`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_domain: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynamicAuthorizationPolicyStatus {
    /// Maps each policy name to the sorted principals of the pods it currently selects.
    #[serde(default)]
    pub service_account_policy_mapping: BTreeMap<String, Vec<String>>,
}
