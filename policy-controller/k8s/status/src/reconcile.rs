use crate::{ControllerMetrics, Error, Leadership, PolicyStore};
use dynamic_principals_core::{mapping, ListSubjects, PolicyRule, ResourceId};
use dynamic_principals_k8s_api::{policy::DynamicAuthorizationPolicy, ResourceExt};
use kube::runtime::controller::Action;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, instrument, warn};

/// State shared by all reconciles.
pub struct Context<S, L> {
    pub store: S,
    pub subjects: L,
    pub leadership: Leadership,
    pub error_backoff: Duration,
    pub metrics: ControllerMetrics,
}

/// Recomputes a policy's principal mapping and writes it to the policy's status.
///
/// The resource is re-read from the store so the write carries its latest resource version.
/// The selector index is left to the policy watch; it requeues the resource once its selectors
/// are indexed.
#[instrument(skip_all, fields(ns = %policy.namespace().unwrap_or_default(), name = %policy.name_any()))]
pub async fn reconcile<S, L>(
    policy: Arc<DynamicAuthorizationPolicy>,
    ctx: Arc<Context<S, L>>,
) -> Result<Action, Error>
where
    S: PolicyStore,
    L: ListSubjects + Send + Sync,
{
    ctx.metrics.reconcile.inc();

    if !ctx.leadership.is_leader() {
        debug!("Not the leader");
        ctx.metrics.not_leader.inc();
        return Ok(Action::requeue(ctx.leadership.recheck()));
    }

    let id = ResourceId::new(
        policy.namespace().unwrap_or_default(),
        policy.name_any(),
    );
    let policy = match ctx.store.get(&id).await? {
        Some(policy) => policy,
        None => {
            debug!("Resource no longer exists");
            return Ok(Action::await_change());
        }
    };

    let rules = policy
        .spec
        .dynamic_policies
        .iter()
        .cloned()
        .map(PolicyRule::from)
        .collect::<Vec<_>>();

    let principals = mapping::compute(&rules, &ctx.subjects).map_err(Error::List)?;
    let status = mapping::to_status(principals);
    if policy.status.as_ref() == Some(&status) {
        debug!("Status unchanged");
        ctx.metrics.status_unchanged.inc();
        return Ok(Action::await_change());
    }

    let policies = status.service_account_policy_mapping.len();
    ctx.store.update_status(&policy, status).await?;
    ctx.metrics.status_updates.inc();
    info!(policies, "Updated status");
    Ok(Action::await_change())
}

/// Requeues a failed reconcile after the configured backoff.
pub fn error_policy<S, L>(
    policy: Arc<DynamicAuthorizationPolicy>,
    error: &Error,
    ctx: Arc<Context<S, L>>,
) -> Action {
    warn!(
        ns = %policy.namespace().unwrap_or_default(),
        name = %policy.name_any(),
        %error,
        "Reconcile failed",
    );
    ctx.metrics.error(error.reason());
    Action::requeue(ctx.error_backoff)
}
