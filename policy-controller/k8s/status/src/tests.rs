use crate::{
    error_policy, reconcile, store, Context, ControllerMetrics, Error, Leadership, PolicyStore,
};
use chrono::{DateTime, Utc};
use dynamic_principals_core::{ResourceId, Subject};
use dynamic_principals_k8s_api::{
    self as k8s,
    policy::{
        DynamicAuthorizationPolicy, DynamicAuthorizationPolicySpec,
        DynamicAuthorizationPolicyStatus, DynamicPolicy,
    },
    Labels, Selector,
};
use dynamic_principals_k8s_index::{SelectorIndex, SharedSelectorIndex};
use kube::runtime::controller::Action;
use kubert::index::IndexNamespacedResource;
use maplit::btreemap;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{sync::watch, time::Duration};

const BACKOFF: Duration = Duration::from_secs(5);
const RECHECK: Duration = Duration::from_secs(30);

/// An in-memory policy store that enforces resource versions on status writes.
#[derive(Default)]
struct FakeStore {
    policies: Mutex<HashMap<ResourceId, DynamicAuthorizationPolicy>>,
    writes: Mutex<Vec<(ResourceId, DynamicAuthorizationPolicyStatus)>>,
    gets: AtomicUsize,
}

#[async_trait::async_trait]
impl PolicyStore for FakeStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicAuthorizationPolicy>, kube::Error> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.policies.lock().get(id).cloned())
    }

    async fn update_status(
        &self,
        policy: &DynamicAuthorizationPolicy,
        status: DynamicAuthorizationPolicyStatus,
    ) -> Result<(), Error> {
        let id = id_of(policy);
        let mut policies = self.policies.lock();
        let current = policies.get_mut(&id).ok_or(Error::Conflict)?;
        if current.metadata.resource_version != policy.metadata.resource_version {
            return Err(Error::Conflict);
        }
        current.status = Some(status.clone());
        self.writes.lock().push((id, status));
        Ok(())
    }
}

impl FakeStore {
    fn with(policies: impl IntoIterator<Item = DynamicAuthorizationPolicy>) -> Self {
        let store = Self::default();
        for policy in policies {
            store.policies.lock().insert(id_of(&policy), policy);
        }
        store
    }

    fn writes(&self) -> Vec<(ResourceId, DynamicAuthorizationPolicyStatus)> {
        self.writes.lock().clone()
    }

    /// Simulates a concurrent change to a stored resource.
    fn bump(&self, id: &ResourceId) {
        if let Some(policy) = self.policies.lock().get_mut(id) {
            policy.metadata.resource_version = Some("2".to_string());
        }
    }
}

type ListFn = Box<dyn Fn(&Selector) -> anyhow::Result<Vec<Subject>> + Send + Sync>;

fn id_of(policy: &DynamicAuthorizationPolicy) -> ResourceId {
    ResourceId::new(
        policy.metadata.namespace.clone().unwrap_or_default(),
        policy.metadata.name.clone().unwrap_or_default(),
    )
}

fn mk_policy(
    ns: &str,
    name: &str,
    rules: Vec<(&str, Vec<(&'static str, &'static str)>)>,
) -> DynamicAuthorizationPolicy {
    DynamicAuthorizationPolicy {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: DynamicAuthorizationPolicySpec {
            dynamic_policies: rules
                .into_iter()
                .map(|(name, selector)| DynamicPolicy {
                    name: name.to_string(),
                    pod_selectors: Selector::from_iter(selector),
                    trust_domain: None,
                })
                .collect(),
        },
        status: None,
    }
}

fn mk_subject(
    ns: &str,
    name: &str,
    labels: Vec<(&'static str, &'static str)>,
    sa: &str,
) -> Subject {
    Subject {
        id: ResourceId::new(ns, name),
        labels: Labels::from_iter(labels),
        service_account: sa.to_string(),
    }
}

fn subjects(subjects: Vec<Subject>) -> ListFn {
    Box::new(move |selector: &Selector| -> anyhow::Result<Vec<Subject>> {
        Ok(subjects
            .iter()
            .filter(|s| selector.matches(&s.labels))
            .cloned()
            .collect())
    })
}

fn mk_ctx<S: PolicyStore>(
    store: S,
    list: ListFn,
    leadership: Leadership,
) -> Arc<Context<S, ListFn>> {
    Arc::new(Context {
        store,
        subjects: list,
        leadership,
        error_backoff: BACKOFF,
        metrics: ControllerMetrics::register(&mut Default::default()),
    })
}

fn leader_as(holder: &str) -> Leadership {
    let claim = kubert::lease::Claim {
        holder: holder.to_string(),
        expiry: DateTime::<Utc>::MAX_UTC,
    };
    let (claims_tx, claims_rx) = watch::channel(Arc::new(claim));
    // The sender is dropped; the receiver keeps observing the last claim.
    drop(claims_tx);
    Leadership::lease(claims_rx, "me", RECHECK)
}

#[tokio::test]
async fn writes_selected_principals() {
    let policy = mk_policy("ns", "dap", vec![("r1", vec![("app", "foo")])]);
    let ctx = mk_ctx(
        FakeStore::with(Some(policy.clone())),
        subjects(vec![mk_subject("ns", "pod-0", vec![("app", "foo")], "svc")]),
        Leadership::always(),
    );

    let action = reconcile(Arc::new(policy), ctx.clone())
        .await
        .expect("reconcile must succeed");
    assert_eq!(action, Action::await_change());

    assert_eq!(
        ctx.store.writes(),
        vec![(
            ResourceId::new("ns", "dap"),
            DynamicAuthorizationPolicyStatus {
                service_account_policy_mapping: btreemap! {
                    "r1".to_string() => vec!["cluster.local/ns/ns/sa/svc".to_string()],
                },
            }
        )]
    );
    assert_eq!(ctx.metrics.status_updates.get(), 1);
}

#[tokio::test]
async fn writes_every_rule_sorted_and_deduplicated() {
    let policy = mk_policy(
        "ns",
        "dap",
        vec![
            ("web", vec![("app", "web")]),
            ("db", vec![("app", "db")]),
            ("none", vec![("app", "missing")]),
        ],
    );
    let ctx = mk_ctx(
        FakeStore::with(Some(policy.clone())),
        subjects(vec![
            mk_subject("ns-b", "web-0", vec![("app", "web")], "web"),
            mk_subject("ns-a", "web-1", vec![("app", "web")], "web"),
            mk_subject("ns-a", "web-2", vec![("app", "web")], "web"),
            mk_subject("ns-a", "db-0", vec![("app", "db")], "db"),
        ]),
        Leadership::always(),
    );

    reconcile(Arc::new(policy), ctx.clone())
        .await
        .expect("reconcile must succeed");

    let writes = ctx.store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(
        writes[0].1.service_account_policy_mapping,
        btreemap! {
            "db".to_string() => vec!["cluster.local/ns/ns-a/sa/db".to_string()],
            "none".to_string() => vec![],
            "web".to_string() => vec![
                "cluster.local/ns/ns-a/sa/web".to_string(),
                "cluster.local/ns/ns-b/sa/web".to_string(),
            ],
        }
    );
}

#[tokio::test]
async fn missing_resource_is_a_noop() {
    let policy = mk_policy("ns", "gone", vec![("r1", vec![("app", "foo")])]);
    let ctx = mk_ctx(FakeStore::default(), subjects(vec![]), Leadership::always());

    let action = reconcile(Arc::new(policy), ctx.clone())
        .await
        .expect("reconcile must succeed");
    assert_eq!(action, Action::await_change());
    assert!(ctx.store.writes().is_empty());
}

#[tokio::test]
async fn listing_failure_writes_nothing() {
    let policy = mk_policy("ns", "dap", vec![("r1", vec![("app", "foo")])]);
    let ctx = mk_ctx(
        FakeStore::with(Some(policy.clone())),
        Box::new(|_: &Selector| -> anyhow::Result<Vec<Subject>> {
            anyhow::bail!("pod index has not synced")
        }),
        Leadership::always(),
    );

    let error = reconcile(Arc::new(policy), ctx.clone())
        .await
        .expect_err("reconcile must fail");
    assert!(matches!(error, Error::List(_)), "{error}");
    assert!(ctx.store.writes().is_empty());
}

#[tokio::test]
async fn concurrent_change_conflicts() {
    let policy = mk_policy("ns", "dap", vec![("r1", vec![("app", "foo")])]);
    let store = FakeStore::with(Some(policy.clone()));
    let ctx = mk_ctx(
        store,
        subjects(vec![mk_subject("ns", "pod-0", vec![("app", "foo")], "svc")]),
        Leadership::always(),
    );

    // The stale copy is written back against a newer stored version.
    let stale = ctx
        .store
        .get(&ResourceId::new("ns", "dap"))
        .await
        .expect("get must succeed")
        .expect("policy must exist");
    ctx.store.bump(&ResourceId::new("ns", "dap"));
    let error = ctx
        .store
        .update_status(&stale, DynamicAuthorizationPolicyStatus::default())
        .await
        .expect_err("write must conflict");
    assert!(matches!(error, Error::Conflict));

    // Reconcile always re-reads, so it succeeds against the new version.
    reconcile(Arc::new(policy), ctx.clone())
        .await
        .expect("reconcile must succeed");
    assert_eq!(ctx.store.writes().len(), 1);
}

#[tokio::test]
async fn unchanged_status_is_not_rewritten() {
    let policy = mk_policy("ns", "dap", vec![("r1", vec![("app", "foo")])]);
    let ctx = mk_ctx(
        FakeStore::with(Some(policy.clone())),
        subjects(vec![mk_subject("ns", "pod-0", vec![("app", "foo")], "svc")]),
        Leadership::always(),
    );

    reconcile(Arc::new(policy.clone()), ctx.clone())
        .await
        .expect("reconcile must succeed");
    reconcile(Arc::new(policy), ctx.clone())
        .await
        .expect("reconcile must succeed");

    assert_eq!(ctx.store.writes().len(), 1);
    assert_eq!(ctx.metrics.status_unchanged.get(), 1);
    assert_eq!(ctx.metrics.reconcile.get(), 2);
}

/// A store whose resource is deleted, and observed by the policy watch, while a read is in
/// flight.
struct DeletedDuringGet {
    policy: DynamicAuthorizationPolicy,
    selectors: SharedSelectorIndex,
}

#[async_trait::async_trait]
impl PolicyStore for DeletedDuringGet {
    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicAuthorizationPolicy>, kube::Error> {
        self.selectors
            .write()
            .delete(id.namespace.clone(), id.name.clone());
        Ok(Some(self.policy.clone()))
    }

    async fn update_status(
        &self,
        _: &DynamicAuthorizationPolicy,
        _: DynamicAuthorizationPolicyStatus,
    ) -> Result<(), Error> {
        Err(Error::Conflict)
    }
}

#[tokio::test]
async fn deleted_policy_stays_out_of_selector_index() {
    let policy = mk_policy("ns", "dap", vec![("r1", vec![("app", "foo")])]);
    let selectors = SelectorIndex::shared();
    selectors.write().apply(policy.clone());
    let ctx = mk_ctx(
        DeletedDuringGet {
            policy: policy.clone(),
            selectors: selectors.clone(),
        },
        subjects(vec![mk_subject("ns", "pod-0", vec![("app", "foo")], "svc")]),
        Leadership::always(),
    );

    let error = reconcile(Arc::new(policy), ctx)
        .await
        .expect_err("write to a deleted resource must fail");
    assert!(matches!(error, Error::Conflict));

    let index = selectors.read();
    assert!(index.lookup("app", "foo").is_empty());
    assert_eq!(index.len_resources(), 0);
    assert_eq!(index.len_pairs(), 0);
}

#[tokio::test]
async fn follower_writes_nothing() {
    let policy = mk_policy("ns", "dap", vec![("r1", vec![("app", "foo")])]);
    let ctx = mk_ctx(
        FakeStore::with(Some(policy.clone())),
        subjects(vec![mk_subject("ns", "pod-0", vec![("app", "foo")], "svc")]),
        leader_as("other"),
    );

    let action = reconcile(Arc::new(policy), ctx.clone())
        .await
        .expect("reconcile must succeed");
    assert_eq!(action, Action::requeue(RECHECK));
    assert_eq!(ctx.store.gets.load(Ordering::SeqCst), 0);
    assert!(ctx.store.writes().is_empty());
    assert_eq!(ctx.metrics.not_leader.get(), 1);
}

#[tokio::test]
async fn lease_holder_writes() {
    let policy = mk_policy("ns", "dap", vec![("r1", vec![("app", "foo")])]);
    let ctx = mk_ctx(
        FakeStore::with(Some(policy.clone())),
        subjects(vec![mk_subject("ns", "pod-0", vec![("app", "foo")], "svc")]),
        leader_as("me"),
    );

    reconcile(Arc::new(policy), ctx.clone())
        .await
        .expect("reconcile must succeed");
    assert_eq!(ctx.store.writes().len(), 1);
}

#[rstest]
#[case(Error::List(anyhow::anyhow!("boom")), "list")]
#[case(Error::Conflict, "conflict")]
#[case(
    Error::Serialize(serde_json::from_str::<u8>("x").unwrap_err()),
    "serialize"
)]
fn error_policy_requeues_after_backoff(#[case] error: Error, #[case] reason: &str) {
    let policy = mk_policy("ns", "dap", vec![]);
    let ctx = mk_ctx(FakeStore::default(), subjects(vec![]), Leadership::always());

    assert_eq!(error.reason(), reason);
    let action = error_policy(Arc::new(policy), &error, ctx);
    assert_eq!(action, Action::requeue(BACKOFF));
}

#[test]
fn status_patch_carries_resource_version() {
    let status = DynamicAuthorizationPolicyStatus {
        service_account_policy_mapping: btreemap! {
            "r1".to_string() => vec!["cluster.local/ns/ns/sa/svc".to_string()],
        },
    };
    let patch = store::make_patch("dap", Some("7".to_string()), &status).expect("must encode");
    assert_eq!(
        patch,
        serde_json::json!({
            "apiVersion": "peerauth.aweis.io/v1",
            "kind": "DynamicAuthorizationPolicy",
            "metadata": { "name": "dap", "resourceVersion": "7" },
            "status": {
                "serviceAccountPolicyMapping": {
                    "r1": ["cluster.local/ns/ns/sa/svc"],
                },
            },
        })
    );
}
