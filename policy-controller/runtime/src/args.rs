use crate::{
    admission::Admission,
    core::{ListSubjects, ResourceId},
    index::{self, IndexMetrics, SelectorIndex, SubjectIndex, SubjectLister},
    k8s::{self, policy::DynamicAuthorizationPolicy},
    lease, status,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::{controller::Controller, reflector::ObjectRef, watcher};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, info_span, instrument, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "dynamic-principals",
    about = "Resolves label-selected pods into service account principals"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "dynamic_principals=info,warn",
        env = "DYNAMIC_PRINCIPALS_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Writes status from every replica instead of only the holder of the write lease.
    #[clap(long)]
    leader_election_disabled: bool,

    #[clap(long, default_value = "dynamic-principals-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "dynamic-principals")]
    controller_namespace: String,

    /// Seconds to wait before retrying a failed reconcile.
    #[clap(long, default_value = "5")]
    error_backoff_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            leader_election_disabled,
            controller_deployment_name,
            controller_namespace,
            error_backoff_secs,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        // Pod changes are propagated to the controller as requeues of the policies that may
        // select them. Policies are also requeued once their selectors are indexed.
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        let selectors = SelectorIndex::shared_with_requeues(requeue_tx.clone());
        let subjects = SubjectIndex::shared(selectors.clone(), requeue_tx);

        let mut prom = <Registry>::default();
        let subject_index = IndexMetrics::register(
            subjects.clone(),
            prom.sub_registry_with_prefix("subject_index"),
        )
        .shared();
        let selector_index = IndexMetrics::register(
            selectors.clone(),
            prom.sub_registry_with_prefix("selector_index"),
        )
        .shared();
        index::metrics::register_selector_index(&mut prom, selectors);
        let controller_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let leadership = if leader_election_disabled {
            info!("Leader election disabled; writing status from this replica");
            status::Leadership::always()
        } else {
            let hostname = std::env::var("HOSTNAME")
                .context("failed to fetch `HOSTNAME` environment variable")?;
            let claims = lease::init(
                &runtime,
                &controller_namespace,
                &controller_deployment_name,
                &hostname,
            )
            .await?;
            status::Leadership::lease(claims, hostname, lease::LEASE_DURATION)
        };

        // Spawn resource watches.

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(subject_index, pods).instrument(info_span!("pods")),
        );

        let policies = runtime.watch_all::<DynamicAuthorizationPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(selector_index, policies)
                .instrument(info_span!("dynamicauthorizationpolicies")),
        );

        // Spawn the status controller.
        let ctx = Arc::new(status::Context {
            store: status::KubeStore::new(runtime.client()),
            subjects: SubjectLister::new(subjects),
            leadership,
            error_backoff: Duration::from_secs(error_backoff_secs),
            metrics: controller_metrics,
        });
        tokio::spawn(controller(
            k8s::Api::all(runtime.client()),
            requeue_rx,
            ctx,
            runtime.shutdown_handle(),
        ));

        let runtime = runtime.spawn_server(Admission::new);

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Runs the status controller until shutdown, reconciling every policy on startup, on each change
/// to a policy, and whenever a pod change requeues one.
#[instrument(skip_all)]
async fn controller<S, L>(
    api: k8s::Api<DynamicAuthorizationPolicy>,
    requeues: mpsc::UnboundedReceiver<ResourceId>,
    ctx: Arc<status::Context<S, L>>,
    drain: drain::Watch,
) where
    S: status::PolicyStore + 'static,
    L: ListSubjects + Send + Sync + 'static,
{
    let requeues = UnboundedReceiverStream::new(requeues)
        .map(|id| ObjectRef::<DynamicAuthorizationPolicy>::new(&id.name).within(&id.namespace));

    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    let ctrl = Controller::new(api, watcher::Config::default())
        .reconcile_on(requeues)
        .graceful_shutdown_on(close_rx.map(|_| {}))
        .run(
            status::reconcile::<S, L>,
            status::error_policy::<S, L>,
            ctx,
        )
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(%obj, "Reconciled"),
                Err(error) => debug!(%error, "Reconcile failed"),
            }
        });
    tokio::pin!(ctrl);

    info!("Status controller running");
    tokio::select! {
        _ = (&mut ctrl) => {}
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(ctrl).await;
        }
    }
}
