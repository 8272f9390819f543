use crate::backup::{BackupError, BackupRegistry};
use crate::config::FailurePolicy;
use crate::oci_registry::RegistryClient;
use crate::workload::{WorkloadError, WorkloadKey, WorkloadStore};
use globset::GlobSet;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Never reconciled, regardless of configuration.
pub static RESERVED_NAMESPACE: &str = "kube-system";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    ReservedNamespace,
    ExcludedNamespace,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRewrite {
    pub container: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBackup {
    pub container: String,
    pub image: String,
    pub error: BackupError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Skipped(SkipReason),
    /// Every image already points at the backup registry.
    Unchanged,
    /// The rewritten images were written back. `failures` is only populated
    /// when failing containers are skipped instead of aborting the pass.
    Updated {
        rewrites: Vec<ImageRewrite>,
        failures: Vec<FailedBackup>,
    },
    /// Nothing was written because the failed backups are not worth a retry.
    NotBackedUp { failures: Vec<FailedBackup> },
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("could not fetch {key}")]
    Fetch {
        key: WorkloadKey,
        #[source]
        source: WorkloadError,
    },
    #[error("could not write {key}")]
    Write {
        key: WorkloadKey,
        #[source]
        source: WorkloadError,
    },
    #[error("could not back up image {image} of container {container} in {key}")]
    Backup {
        key: WorkloadKey,
        container: String,
        image: String,
        #[source]
        source: BackupError,
    },
    #[error("{failed} image(s) of {key} could not be backed up")]
    Incomplete { key: WorkloadKey, failed: usize },
    #[error("reconcile of {key} was cancelled")]
    Cancelled { key: WorkloadKey },
}

impl ReconcileError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ReconcileError::Cancelled { .. })
    }

    /// Cancellation comes from shutdown, so it is not asked to be retried.
    pub fn status(&self) -> ReconcileStatus {
        if self.is_cancellation() {
            ReconcileStatus::Done
        } else {
            ReconcileStatus::RequeueRequested
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStatus {
    Done,
    RequeueRequested,
}

impl ReconcileStatus {
    pub fn of(result: &Result<ReconcileOutcome, ReconcileError>) -> Self {
        match result {
            Ok(_) => ReconcileStatus::Done,
            Err(err) => err.status(),
        }
    }
}

/// One fetch, inspect, back up, write pass over a single workload.
///
/// The workload is only written after every backup of the pass finished, and
/// nothing is carried over between passes.
pub struct ReconcileEngine<S, R> {
    store: S,
    backup: Arc<BackupRegistry<R>>,
    failure_policy: FailurePolicy,
    excluded_namespaces: GlobSet,
}

impl<S: WorkloadStore, R: RegistryClient> ReconcileEngine<S, R> {
    pub fn new(
        store: S,
        backup: Arc<BackupRegistry<R>>,
        failure_policy: FailurePolicy,
        excluded_namespaces: GlobSet,
    ) -> Self {
        Self {
            store,
            backup,
            failure_policy,
            excluded_namespaces,
        }
    }

    #[instrument(skip(self, key, cancel), fields(workload = %key))]
    pub async fn reconcile(
        &self,
        key: &WorkloadKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if key.namespace == RESERVED_NAMESPACE {
            info!("Ignoring all objects from {} namespace", RESERVED_NAMESPACE);
            return Ok(ReconcileOutcome::Skipped(SkipReason::ReservedNamespace));
        }
        if self.excluded_namespaces.is_match(&key.namespace) {
            info!("Ignoring {}, namespace is excluded", key);
            return Ok(ReconcileOutcome::Skipped(SkipReason::ExcludedNamespace));
        }

        let mut workload = match self.store.fetch(key).await {
            Ok(workload) => workload,
            Err(WorkloadError::NotFound(_)) => {
                info!("Could not find {}, it was probably deleted", key);
                return Ok(ReconcileOutcome::Skipped(SkipReason::NotFound));
            }
            Err(source) => {
                return Err(ReconcileError::Fetch {
                    key: key.clone(),
                    source,
                });
            }
        };

        let mut rewrites = Vec::new();
        let mut failures = Vec::new();
        let mut retryable_failures = 0;
        // Containers sharing an image are backed up once per pass.
        let mut backed_up: HashMap<String, String> = HashMap::new();

        let containers = workload
            .init_containers
            .iter_mut()
            .chain(workload.containers.iter_mut());
        for container in containers {
            if self.backup.is_image_from_backup(&container.image) {
                continue;
            }

            let result = match backed_up.get(&container.image) {
                Some(backup_name) => Ok(backup_name.clone()),
                None => {
                    info!(
                        "Image {} of container {} does not exist in backup",
                        container.image, container.name
                    );
                    self.backup
                        .add_image_to_backup(&container.image, cancel)
                        .await
                }
            };

            match result {
                Ok(backup_name) => {
                    info!(
                        "Image {} of container {} pushed to backup as {}",
                        container.image, container.name, backup_name
                    );
                    backed_up.insert(container.image.clone(), backup_name.clone());
                    rewrites.push(ImageRewrite {
                        container: container.name.clone(),
                        from: std::mem::replace(&mut container.image, backup_name.clone()),
                        to: backup_name,
                    });
                }
                Err(BackupError::Cancelled) => {
                    warn!("Reconcile of {} cancelled, leaving it unmodified", key);
                    return Err(ReconcileError::Cancelled { key: key.clone() });
                }
                Err(source) => match self.failure_policy {
                    FailurePolicy::AbortOnFirstError => {
                        error!(
                            "Could not add image {} of container {} to backup, leaving {} unmodified: {}",
                            container.image, container.name, key, source
                        );
                        if source.is_retryable() {
                            return Err(ReconcileError::Backup {
                                key: key.clone(),
                                container: container.name.clone(),
                                image: container.image.clone(),
                                source,
                            });
                        }
                        return Ok(ReconcileOutcome::NotBackedUp {
                            failures: vec![FailedBackup {
                                container: container.name.clone(),
                                image: container.image.clone(),
                                error: source,
                            }],
                        });
                    }
                    FailurePolicy::ContinueOnError => {
                        warn!(
                            "Skipping container {} of {}, image {} could not be added to backup: {}",
                            container.name, key, container.image, source
                        );
                        if source.is_retryable() {
                            retryable_failures += 1;
                        }
                        failures.push(FailedBackup {
                            container: container.name.clone(),
                            image: container.image.clone(),
                            error: source,
                        });
                    }
                },
            }
        }

        if rewrites.is_empty() {
            if retryable_failures > 0 {
                return Err(ReconcileError::Incomplete {
                    key: key.clone(),
                    failed: retryable_failures,
                });
            }
            if !failures.is_empty() {
                return Ok(ReconcileOutcome::NotBackedUp { failures });
            }
            info!("{} does not need any modification", key);
            return Ok(ReconcileOutcome::Unchanged);
        }

        self.store
            .write(&workload)
            .await
            .map_err(|source| ReconcileError::Write {
                key: key.clone(),
                source,
            })?;
        info!("{} updated with {} backed up image(s)", key, rewrites.len());

        if retryable_failures > 0 {
            return Err(ReconcileError::Incomplete {
                key: key.clone(),
                failed: retryable_failures,
            });
        }
        Ok(ReconcileOutcome::Updated { rewrites, failures })
    }
}
