use crate::Error;
use dynamic_principals_core::ResourceId;
use dynamic_principals_k8s_api::{
    self as k8s,
    policy::{DynamicAuthorizationPolicy, DynamicAuthorizationPolicyStatus},
    Resource, ResourceExt,
};
use tracing::debug;

/// The field manager used for status writes.
pub const FIELD_MANAGER: &str = "dynamic-principals-controller";

/// Reads policy resources and writes their status.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    /// Fetches the current version of a resource. `None` if it no longer exists.
    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicAuthorizationPolicy>, kube::Error>;

    /// Replaces the status of `policy`. Fails with [`Error::Conflict`] if the resource changed
    /// since `policy` was read.
    async fn update_status(
        &self,
        policy: &DynamicAuthorizationPolicy,
        status: DynamicAuthorizationPolicyStatus,
    ) -> Result<(), Error>;
}

#[derive(Clone)]
pub struct KubeStore {
    client: k8s::Client,
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> k8s::Api<DynamicAuthorizationPolicy> {
        k8s::Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl PolicyStore for KubeStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicAuthorizationPolicy>, kube::Error> {
        self.api(&id.namespace).get_opt(&id.name).await
    }

    async fn update_status(
        &self,
        policy: &DynamicAuthorizationPolicy,
        status: DynamicAuthorizationPolicyStatus,
    ) -> Result<(), Error> {
        let namespace = policy.namespace().unwrap_or_default();
        let name = policy.name_any();
        let patch = make_patch(&name, policy.resource_version(), &status)?;
        let params = k8s::PatchParams::apply(FIELD_MANAGER).force();

        match self
            .api(&namespace)
            .patch_status(&name, &params, &k8s::Patch::Apply(patch))
            .await
        {
            Ok(_) => {
                debug!(ns = %namespace, %name, "Patched status");
                Ok(())
            }
            Err(kube::Error::Api(rsp)) if rsp.code == 409 => Err(Error::Conflict),
            Err(error) => Err(error.into()),
        }
    }
}

/// Builds a server-side apply patch for the status subresource.
///
/// The resource version is included so that the API server rejects the write if the resource
/// was modified after it was read.
pub(crate) fn make_patch(
    name: &str,
    resource_version: Option<String>,
    status: &DynamicAuthorizationPolicyStatus,
) -> Result<serde_json::Value, serde_json::Error> {
    let mut metadata = serde_json::json!({ "name": name });
    if let Some(rv) = resource_version {
        metadata["resourceVersion"] = serde_json::Value::String(rv);
    }
    Ok(serde_json::json!({
        "apiVersion": DynamicAuthorizationPolicy::api_version(&()),
        "kind": DynamicAuthorizationPolicy::kind(&()),
        "metadata": metadata,
        "status": serde_json::to_value(status)?,
    }))
}
