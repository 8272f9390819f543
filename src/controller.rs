use crate::reconcile::{ReconcileEngine, ReconcileError, ReconcileStatus};
use crate::state::{ControllerContext, WatchContext};
use crate::workload::{KubeWorkloadStore, PodTemplateWorkload, WorkloadKey};
use futures::StreamExt;
use globset::GlobSet;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::runtime::controller::{self, Action, Config as ControllerConfig, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Runs one controller per workload kind until shutdown is requested.
pub async fn run(ctx: ControllerContext) -> anyhow::Result<()> {
    let excluded_namespaces = ctx.config.reconcile.excluded_namespace_set()?;

    info!(
        "Backing up workload images to {} with failure policy {:?} and {} concurrent reconciles per kind",
        ctx.backup.host(),
        ctx.config.reconcile.failure_policy,
        ctx.config.reconcile.concurrency
    );

    let deployments = watch_workloads::<Deployment>(&ctx, excluded_namespaces.clone());
    let daemonsets = watch_workloads::<DaemonSet>(&ctx, excluded_namespaces);
    ctx.readiness.mark_ready();
    tokio::join!(deployments, daemonsets);

    info!("Workload controllers stopped");
    Ok(())
}

async fn watch_workloads<K: PodTemplateWorkload>(
    ctx: &ControllerContext,
    excluded_namespaces: GlobSet,
) {
    let api: Api<K> = Api::all(ctx.kube_client.clone());
    let watch_ctx = Arc::new(WatchContext {
        engine: ReconcileEngine::new(
            KubeWorkloadStore::<K>::new(ctx.kube_client.clone()),
            ctx.backup.clone(),
            ctx.config.reconcile.failure_policy,
            excluded_namespaces,
        ),
        shutdown: ctx.shutdown.clone(),
        requeue_after: Duration::from_secs(ctx.config.reconcile.requeue_after_seconds),
    });
    let shutdown = ctx.shutdown.clone();

    info!("Watching {} workloads in all namespaces", K::KIND);
    Controller::new(api, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(ctx.config.reconcile.concurrency))
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile::<K>, error_policy::<K>, watch_ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("Reconciled {}", object),
                // Already reported by the error policy.
                Err(controller::Error::ReconcilerFailed(_, object)) => {
                    debug!("Reconcile of {} failed", object)
                }
                Err(err) => warn!("{} controller error: {}", K::KIND, error_chain(&err)),
            }
        })
        .await;
}

async fn reconcile<K: PodTemplateWorkload>(
    object: Arc<K>,
    ctx: Arc<WatchContext<K>>,
) -> Result<Action, ReconcileError> {
    let key = WorkloadKey::new(
        K::KIND,
        object.namespace().unwrap_or_default(),
        object.name_any(),
    );
    let result = ctx.engine.reconcile(&key, &ctx.shutdown).await;
    debug!(
        "Reconcile of {} finished ({:?}): {:?}",
        key,
        ReconcileStatus::of(&result),
        result
    );
    result.map(|_| Action::await_change())
}

fn error_policy<K: PodTemplateWorkload>(
    _object: Arc<K>,
    err: &ReconcileError,
    ctx: Arc<WatchContext<K>>,
) -> Action {
    match err.status() {
        ReconcileStatus::Done => {
            debug!("{}, not requeueing", err);
            Action::await_change()
        }
        ReconcileStatus::RequeueRequested => {
            warn!(
                "{}, requeueing in {:?}",
                error_chain(err),
                ctx.requeue_after
            );
            Action::requeue(ctx.requeue_after)
        }
    }
}

fn error_chain(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
