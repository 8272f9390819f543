use crate::backup::BackupRegistry;
use crate::config::Config;
use crate::oci_registry::OciRegistryClient;
use crate::reconcile::ReconcileEngine;
use crate::webserver::Readiness;
use crate::workload::KubeWorkloadStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) kube_client: kube::Client,
    pub(crate) config: Arc<Config>,
    pub(crate) backup: Arc<BackupRegistry<OciRegistryClient>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) readiness: Readiness,
}

/// State shared by all reconciles of one workload kind.
pub struct WatchContext<K> {
    pub(crate) engine: ReconcileEngine<KubeWorkloadStore<K>, OciRegistryClient>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) requeue_after: Duration,
}
