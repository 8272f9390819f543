use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Container as PodContainer, PodSpec};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

static IMAGE_BACKUP_FIELD_MANAGER: &str = "kube-image-backup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "Deployment"),
            WorkloadKind::DaemonSet => write!(f, "DaemonSet"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
    pub kind: WorkloadKind,
}

impl WorkloadKey {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub image: String,
}

/// Uniform view of a workload's pod template containers.
///
/// `resource_version` is the version observed at fetch time; writes are
/// rejected by the API server when the object changed since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub key: WorkloadKey,
    pub resource_version: Option<String>,
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
}

impl Workload {
    pub fn from_resource<K: PodTemplateWorkload>(key: WorkloadKey, resource: &K) -> Self {
        let pod_spec = resource.pod_spec();
        Self {
            key,
            resource_version: resource.resource_version(),
            init_containers: pod_spec
                .and_then(|spec| spec.init_containers.as_deref())
                .map(containers_of)
                .unwrap_or_default(),
            containers: pod_spec
                .map(|spec| containers_of(&spec.containers))
                .unwrap_or_default(),
        }
    }
}

fn containers_of(containers: &[PodContainer]) -> Vec<Container> {
    containers
        .iter()
        .map(|container| Container {
            name: container.name.clone(),
            image: container.image.clone().unwrap_or_default(),
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("{0} not found")]
    NotFound(WorkloadKey),
    #[error("{0} was modified concurrently")]
    Conflict(WorkloadKey),
    #[error("store for {expected} workloads cannot handle {key}")]
    KindMismatch {
        expected: WorkloadKind,
        key: WorkloadKey,
    },
    #[error("Kubernetes API request for {key} failed: {source}")]
    Api {
        key: WorkloadKey,
        #[source]
        source: kube::Error,
    },
}

/// Fetch and write access to one kind of workload.
pub trait WorkloadStore: Send + Sync + 'static {
    fn fetch(
        &self,
        key: &WorkloadKey,
    ) -> impl Future<Output = Result<Workload, WorkloadError>> + Send;

    fn write(&self, workload: &Workload) -> impl Future<Output = Result<(), WorkloadError>> + Send;
}

impl<S: WorkloadStore> WorkloadStore for Arc<S> {
    fn fetch(
        &self,
        key: &WorkloadKey,
    ) -> impl Future<Output = Result<Workload, WorkloadError>> + Send {
        self.as_ref().fetch(key)
    }

    fn write(&self, workload: &Workload) -> impl Future<Output = Result<(), WorkloadError>> + Send {
        self.as_ref().write(workload)
    }
}

pub trait PodTemplateWorkload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + DeserializeOwned
        + 'static,
{
    const KIND: WorkloadKind;

    fn pod_spec(&self) -> Option<&PodSpec>;
}

impl PodTemplateWorkload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl PodTemplateWorkload for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

/// Strategic merge patch that sets every container image by container name
/// and pins the patch to the fetched resource version.
pub fn image_patch(workload: &Workload) -> serde_json::Value {
    let images = |containers: &[Container]| {
        containers
            .iter()
            .map(|c| json!({ "name": c.name, "image": c.image }))
            .collect::<Vec<_>>()
    };

    let mut pod_spec = json!({ "containers": images(&workload.containers) });
    if !workload.init_containers.is_empty() {
        pod_spec["initContainers"] = json!(images(&workload.init_containers));
    }

    json!({
        "metadata": {
            "resourceVersion": workload.resource_version,
        },
        "spec": {
            "template": {
                "spec": pod_spec,
            }
        }
    })
}

/// [`WorkloadStore`] backed by the Kubernetes API for workloads of kind `K`.
pub struct KubeWorkloadStore<K> {
    client: Client,
    kind: PhantomData<fn() -> K>,
}

impl<K: PodTemplateWorkload> KubeWorkloadStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            kind: PhantomData,
        }
    }

    fn api(&self, key: &WorkloadKey) -> Result<Api<K>, WorkloadError> {
        if key.kind != K::KIND {
            return Err(WorkloadError::KindMismatch {
                expected: K::KIND,
                key: key.clone(),
            });
        }
        Ok(Api::namespaced(self.client.clone(), &key.namespace))
    }
}

fn api_error(key: &WorkloadKey, source: kube::Error) -> WorkloadError {
    match &source {
        kube::Error::Api(response) if response.code == 404 => WorkloadError::NotFound(key.clone()),
        kube::Error::Api(response) if response.code == 409 => WorkloadError::Conflict(key.clone()),
        _ => WorkloadError::Api {
            key: key.clone(),
            source,
        },
    }
}

impl<K: PodTemplateWorkload> WorkloadStore for KubeWorkloadStore<K> {
    async fn fetch(&self, key: &WorkloadKey) -> Result<Workload, WorkloadError> {
        let api = self.api(key)?;
        let resource = api
            .get_opt(&key.name)
            .await
            .map_err(|err| api_error(key, err))?
            .ok_or_else(|| WorkloadError::NotFound(key.clone()))?;
        debug!(
            "Fetched {} at resource version {:?}",
            key,
            resource.resource_version()
        );
        Ok(Workload::from_resource(key.clone(), &resource))
    }

    async fn write(&self, workload: &Workload) -> Result<(), WorkloadError> {
        let api = self.api(&workload.key)?;
        let patch = image_patch(workload);

        debug!("Patching {} with patch {}", workload.key, patch);
        api.patch(
            &workload.key.name,
            &PatchParams::apply(IMAGE_BACKUP_FIELD_MANAGER),
            &Patch::Strategic(&patch),
        )
        .await
        .map_err(|err| api_error(&workload.key, err))?;
        Ok(())
    }
}
