use crate::config::{BackupRegistryConfig, ExistingTagPolicy};
use crate::image_reference::ImageReference;
use crate::oci_registry::RegistryClient;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackupError {
    #[error("backup {0} already exists with different content")]
    AlreadyExists(String),
    #[error("digest reference {0} cannot be backed up under a tag")]
    UnsupportedReference(String),
    #[error("registry request failed: {0}")]
    Registry(String),
    #[error("copy to {0} timed out")]
    TimedOut(String),
    #[error("backup was cancelled")]
    Cancelled,
}

impl BackupError {
    fn registry(err: anyhow::Error) -> Self {
        BackupError::Registry(format!("{:#}", err))
    }

    /// Transport failures are worth another attempt; naming conflicts are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackupError::Registry(_) | BackupError::TimedOut(_))
    }
}

type BackupFuture = BoxFuture<'static, Result<String, BackupError>>;
type InFlightBackup = Shared<BackupFuture>;

struct InFlight {
    source: String,
    backup: WeakShared<BackupFuture>,
}

/// Bookkeeping for the backup registry: decides whether an image already lives
/// there and copies it over when it does not.
///
/// Concurrent requests for the same source and backup name share one listing
/// and one copy. A request for a different source that maps to the same backup
/// name waits for the running backup and then checks the result like any
/// existing tag. Only weak handles are kept, so a backup that every caller
/// abandoned is dropped instead of being resumed later.
pub struct BackupRegistry<R> {
    config: Arc<BackupRegistryConfig>,
    client: Arc<R>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl<R: RegistryClient> BackupRegistry<R> {
    pub fn new(config: BackupRegistryConfig, client: Arc<R>) -> Self {
        Self {
            config: Arc::new(config),
            client,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// True when everything in front of the repository segment ends with the
    /// backup host. For a host without `/` this is the same as checking the
    /// registry segment alone.
    pub fn is_image_from_backup(&self, image: &str) -> bool {
        ImageReference::parse(image)
            .location()
            .ends_with(self.config.host.as_str())
    }

    /// Copies `image` to `<backup host>/<repository>:<tag>` and returns the new
    /// reference. Does not retry.
    #[instrument(skip(self, cancel))]
    pub async fn add_image_to_backup(
        &self,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<String, BackupError> {
        let reference = ImageReference::parse(image);
        if reference.digest.is_some() {
            return Err(BackupError::UnsupportedReference(image.to_string()));
        }
        let backup_name =
            ImageReference::compose(&self.config.host, &reference.repository, &reference.tag);
        debug!("Backing up {} as {}", reference, backup_name);

        let backup = self.join_or_start(image, &reference, &backup_name);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Backup of {} to {} cancelled", image, backup_name);
                Err(BackupError::Cancelled)
            }
            result = backup => result,
        }
    }

    fn join_or_start(
        &self,
        image: &str,
        reference: &ImageReference,
        backup_name: &str,
    ) -> InFlightBackup {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|_, running| running.backup.upgrade().is_some());

        let previous = match in_flight.get(backup_name) {
            Some(running) => match running.backup.upgrade() {
                Some(existing) if running.source == image => {
                    debug!("Joining in-flight backup of {}", backup_name);
                    return existing;
                }
                Some(existing) => {
                    info!(
                        "Backup {} is being written from {}, checking {} once it finished",
                        backup_name, running.source, image
                    );
                    Some(existing)
                }
                None => None,
            },
            None => None,
        };

        let copy = backup_image(
            self.client.clone(),
            self.config.clone(),
            image.to_string(),
            format!("{}/{}", self.config.host, reference.repository),
            reference.tag.clone(),
            backup_name.to_string(),
        );
        let backup = match previous {
            Some(previous) => previous.then(move |_| copy).boxed(),
            None => copy.boxed(),
        }
        .shared();
        if let Some(weak) = backup.downgrade() {
            in_flight.insert(
                backup_name.to_string(),
                InFlight {
                    source: image.to_string(),
                    backup: weak,
                },
            );
        }
        backup
    }
}

async fn backup_image<R: RegistryClient>(
    client: Arc<R>,
    config: Arc<BackupRegistryConfig>,
    image: String,
    backup_repository: String,
    tag: String,
    backup_name: String,
) -> Result<String, BackupError> {
    let tags = client
        .list_tags(&backup_repository)
        .await
        .map_err(BackupError::registry)?;

    if tags.iter().any(|existing| *existing == tag) {
        return match config.existing_tag_policy {
            ExistingTagPolicy::Reuse => {
                info!("Reusing existing backup {} for {}", backup_name, image);
                Ok(backup_name)
            }
            ExistingTagPolicy::Reject => {
                let (source_digest, backup_digest) = futures::future::try_join(
                    client.manifest_digest(&image),
                    client.manifest_digest(&backup_name),
                )
                .await
                .map_err(BackupError::registry)?;
                if source_digest == backup_digest {
                    info!(
                        "Backup {} already holds {} at {}",
                        backup_name, image, source_digest
                    );
                    Ok(backup_name)
                } else {
                    warn!(
                        "Backup {} holds {} but {} resolves to {}",
                        backup_name, backup_digest, image, source_digest
                    );
                    Err(BackupError::AlreadyExists(backup_name))
                }
            }
        };
    }

    let timeout = Duration::from_secs(config.copy_timeout_seconds);
    match tokio::time::timeout(timeout, client.copy_image(&image, &backup_name)).await {
        Ok(Ok(())) => {
            info!("Image {} pushed to backup as {}", image, backup_name);
            Ok(backup_name)
        }
        Ok(Err(err)) => Err(BackupError::registry(err)),
        Err(_) => Err(BackupError::TimedOut(backup_name)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::credentials::SecretString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory registry. Copies register the target tag so later listings see
    /// it, and give the target the digest of the source.
    #[derive(Default)]
    pub(crate) struct FakeRegistry {
        pub(crate) tags: Mutex<HashMap<String, Vec<String>>>,
        pub(crate) digests: Mutex<HashMap<String, String>>,
        pub(crate) copies: Mutex<Vec<(String, String)>>,
        pub(crate) list_calls: AtomicUsize,
        pub(crate) digest_calls: AtomicUsize,
        pub(crate) copy_delay: Duration,
        pub(crate) fail_list: bool,
        pub(crate) fail_copy_of: Option<String>,
    }

    impl FakeRegistry {
        pub(crate) fn with_tags(repository: &str, tags: &[&str]) -> Self {
            let registry = Self::default();
            registry.tags.lock().unwrap().insert(
                repository.to_string(),
                tags.iter().map(|t| t.to_string()).collect(),
            );
            registry
        }

        /// Images without a recorded digest each get a distinct one.
        fn digest_of(&self, image: &str) -> String {
            self.digests
                .lock()
                .unwrap()
                .get(image)
                .cloned()
                .unwrap_or_else(|| format!("sha256:{}", image))
        }

        pub(crate) fn copy_count(&self) -> usize {
            self.copies.lock().unwrap().len()
        }

        pub(crate) fn call_count(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
                + self.digest_calls.load(Ordering::SeqCst)
                + self.copy_count()
        }
    }

    impl RegistryClient for FakeRegistry {
        async fn list_tags(&self, repository: &str) -> anyhow::Result<Vec<String>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_list {
                anyhow::bail!("connection refused");
            }
            Ok(self
                .tags
                .lock()
                .unwrap()
                .get(repository)
                .cloned()
                .unwrap_or_default())
        }

        async fn manifest_digest(&self, image: &str) -> anyhow::Result<String> {
            self.digest_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.digest_of(image))
        }

        async fn copy_image(&self, source: &str, target: &str) -> anyhow::Result<()> {
            if !self.copy_delay.is_zero() {
                tokio::time::sleep(self.copy_delay).await;
            }
            if self.fail_copy_of.as_deref() == Some(source) {
                anyhow::bail!("unauthorized: authentication required");
            }
            let digest = self.digest_of(source);
            self.digests
                .lock()
                .unwrap()
                .insert(target.to_string(), digest);
            let (repository, tag) = target.rsplit_once(':').unwrap();
            self.tags
                .lock()
                .unwrap()
                .entry(repository.to_string())
                .or_default()
                .push(tag.to_string());
            self.copies
                .lock()
                .unwrap()
                .push((source.to_string(), target.to_string()));
            Ok(())
        }
    }

    pub(crate) fn backup_config(host: &str) -> BackupRegistryConfig {
        BackupRegistryConfig {
            host: host.to_string(),
            username: Some("backup-bot".to_string()),
            token: SecretString::new("token"),
            existing_tag_policy: ExistingTagPolicy::Reject,
            copy_timeout_seconds: 60,
        }
    }

    fn registry(fake: FakeRegistry) -> (BackupRegistry<FakeRegistry>, Arc<FakeRegistry>) {
        let fake = Arc::new(fake);
        (
            BackupRegistry::new(backup_config("backup.example.com"), fake.clone()),
            fake,
        )
    }

    #[test]
    fn test_is_image_from_backup() {
        let (backup, _) = registry(FakeRegistry::default());
        assert!(backup.is_image_from_backup("backup.example.com/app:v1"));
        assert!(backup.is_image_from_backup("eu.backup.example.com/app:v1"));
        assert!(!backup.is_image_from_backup("docker.io/app:v1"));
        assert!(!backup.is_image_from_backup("app:v1"));
        assert!(!backup.is_image_from_backup("backup.example.com.evil.io/app:v1"));
    }

    #[test]
    fn test_is_image_from_backup_with_organization_prefix() {
        let backup = BackupRegistry::new(
            backup_config("registry.example.com/backups"),
            Arc::new(FakeRegistry::default()),
        );
        assert!(backup.is_image_from_backup("registry.example.com/backups/app:v1"));
        assert!(!backup.is_image_from_backup("registry.example.com/app:v1"));
    }

    #[test]
    fn test_compose_of_parsed_reference_is_recognised_as_backup() {
        let (backup, _) = registry(FakeRegistry::default());
        for raw in [
            "quay.io/org/app:v1",
            "ghcr.io/a/b/c/tool:2024.1",
            "registry.local:5000/team/svc:latest",
        ] {
            let parsed = ImageReference::parse(raw);
            let host = raw.split('/').next().unwrap();
            let composed = ImageReference::compose(host, &parsed.repository, &parsed.tag);
            assert_eq!(
                backup.is_image_from_backup(&composed),
                host.ends_with("backup.example.com")
            );

            let composed =
                ImageReference::compose(backup.host(), &parsed.repository, &parsed.tag);
            assert!(backup.is_image_from_backup(&composed));
        }
    }

    #[tokio::test]
    async fn test_add_image_to_empty_backup_repository() {
        let (backup, fake) = registry(FakeRegistry::default());

        let backup_name = backup
            .add_image_to_backup("docker.io/app:v1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backup_name, "backup.example.com/app:v1");
        assert_eq!(
            *fake.copies.lock().unwrap(),
            vec![(
                "docker.io/app:v1".to_string(),
                "backup.example.com/app:v1".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_existing_target_tag_with_other_content_is_rejected() {
        let (backup, fake) =
            registry(FakeRegistry::with_tags("backup.example.com/app", &["v1"]));

        let err = backup
            .add_image_to_backup("docker.io/app:v1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            BackupError::AlreadyExists("backup.example.com/app:v1".to_string())
        );
        assert!(!err.is_retryable());
        assert_eq!(fake.copy_count(), 0);
    }

    #[tokio::test]
    async fn test_existing_target_tag_with_same_content_is_accepted() {
        let (backup, fake) =
            registry(FakeRegistry::with_tags("backup.example.com/app", &["v1"]));
        {
            let mut digests = fake.digests.lock().unwrap();
            digests.insert("docker.io/app:v1".to_string(), "sha256:aaa".to_string());
            digests.insert(
                "backup.example.com/app:v1".to_string(),
                "sha256:aaa".to_string(),
            );
        }

        let backup_name = backup
            .add_image_to_backup("docker.io/app:v1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backup_name, "backup.example.com/app:v1");
        assert_eq!(fake.copy_count(), 0);
        assert_eq!(fake.digest_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tag_named_like_repository_is_not_a_collision() {
        // Collisions are detected on the target tag, not on a tag equal to the
        // repository name.
        let (backup, fake) =
            registry(FakeRegistry::with_tags("backup.example.com/app", &["app", "v0"]));

        let backup_name = backup
            .add_image_to_backup("docker.io/app:v1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backup_name, "backup.example.com/app:v1");
        assert_eq!(fake.copy_count(), 1);
    }

    #[tokio::test]
    async fn test_existing_target_tag_is_reused_when_configured() {
        let fake = Arc::new(FakeRegistry::with_tags("backup.example.com/app", &["v1"]));
        let mut config = backup_config("backup.example.com");
        config.existing_tag_policy = ExistingTagPolicy::Reuse;
        let backup = BackupRegistry::new(config, fake.clone());

        let backup_name = backup
            .add_image_to_backup("docker.io/app:v1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backup_name, "backup.example.com/app:v1");
        assert_eq!(fake.copy_count(), 0);
    }

    #[tokio::test]
    async fn test_listing_failure_is_a_retryable_registry_error() {
        let (backup, fake) = registry(FakeRegistry {
            fail_list: true,
            ..Default::default()
        });

        let err = backup
            .add_image_to_backup("docker.io/app:v1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Registry(ref msg) if msg.contains("connection refused")));
        assert!(err.is_retryable());
        assert_eq!(fake.copy_count(), 0);
    }

    #[tokio::test]
    async fn test_copy_failure_is_a_registry_error() {
        let (backup, _) = registry(FakeRegistry {
            fail_copy_of: Some("docker.io/app:v1".to_string()),
            ..Default::default()
        });

        let err = backup
            .add_image_to_backup("docker.io/app:v1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Registry(_)));
    }

    #[tokio::test]
    async fn test_digest_reference_is_unsupported() {
        let (backup, fake) = registry(FakeRegistry::default());

        let err = backup
            .add_image_to_backup("docker.io/app@sha256:abc", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            BackupError::UnsupportedReference("docker.io/app@sha256:abc".to_string())
        );
        assert_eq!(fake.call_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_backups_of_same_image_copy_once() {
        let (backup, fake) = registry(FakeRegistry {
            copy_delay: Duration::from_millis(50),
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        let results = futures::future::join_all(
            (0..8).map(|_| backup.add_image_to_backup("docker.io/app:v1", &cancel)),
        )
        .await;

        assert!(
            results
                .iter()
                .all(|r| r.as_deref() == Ok("backup.example.com/app:v1"))
        );
        assert_eq!(fake.copy_count(), 1);
        assert_eq!(fake.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_backups_on_separate_tasks_copy_once() {
        let fake = Arc::new(FakeRegistry {
            copy_delay: Duration::from_millis(50),
            ..Default::default()
        });
        let backup = Arc::new(BackupRegistry::new(
            backup_config("backup.example.com"),
            fake.clone(),
        ));
        let cancel = CancellationToken::new();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let backup = backup.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    backup
                        .add_image_to_backup("quay.io/team/app:v1", &cancel)
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(
                handle.await.unwrap().as_deref(),
                Ok("backup.example.com/app:v1")
            );
        }

        assert_eq!(fake.copy_count(), 1);
    }

    #[tokio::test]
    async fn test_backup_after_completed_copy_reuses_it() {
        let (backup, fake) = registry(FakeRegistry::default());
        let cancel = CancellationToken::new();

        backup
            .add_image_to_backup("docker.io/app:v1", &cancel)
            .await
            .unwrap();
        let second = backup.add_image_to_backup("docker.io/app:v1", &cancel).await;

        assert_eq!(second.as_deref(), Ok("backup.example.com/app:v1"));
        assert_eq!(fake.copy_count(), 1);
    }

    #[tokio::test]
    async fn test_different_sources_with_same_backup_name_do_not_share_a_copy() {
        let (backup, fake) = registry(FakeRegistry {
            copy_delay: Duration::from_millis(50),
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        let (team_a, team_b) = tokio::join!(
            backup.add_image_to_backup("quay.io/team-a/app:1", &cancel),
            backup.add_image_to_backup("quay.io/team-b/app:1", &cancel),
        );

        assert_eq!(team_a.as_deref(), Ok("backup.example.com/app:1"));
        assert_eq!(
            team_b,
            Err(BackupError::AlreadyExists(
                "backup.example.com/app:1".to_string()
            ))
        );
        assert_eq!(
            *fake.copies.lock().unwrap(),
            vec![(
                "quay.io/team-a/app:1".to_string(),
                "backup.example.com/app:1".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_different_sources_in_sequence_collide() {
        let (backup, fake) = registry(FakeRegistry::default());
        let cancel = CancellationToken::new();

        backup
            .add_image_to_backup("quay.io/team-a/app:1", &cancel)
            .await
            .unwrap();
        let second = backup
            .add_image_to_backup("quay.io/team-b/app:1", &cancel)
            .await;

        assert_eq!(
            second,
            Err(BackupError::AlreadyExists(
                "backup.example.com/app:1".to_string()
            ))
        );
        assert_eq!(fake.copy_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_does_not_touch_registry() {
        let (backup, fake) = registry(FakeRegistry::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = backup.add_image_to_backup("docker.io/app:v1", &cancel).await;

        assert_eq!(result, Err(BackupError::Cancelled));
        assert_eq!(fake.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_mid_copy() {
        let (backup, fake) = registry(FakeRegistry {
            copy_delay: Duration::from_secs(30),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = backup.add_image_to_backup("docker.io/app:v1", &cancel).await;

        assert_eq!(result, Err(BackupError::Cancelled));
        assert_eq!(fake.copy_count(), 0);
    }

    #[tokio::test]
    async fn test_copy_timeout() {
        let fake = Arc::new(FakeRegistry {
            copy_delay: Duration::from_millis(200),
            ..Default::default()
        });
        let mut config = backup_config("backup.example.com");
        config.copy_timeout_seconds = 0;
        let backup = BackupRegistry::new(config, fake.clone());

        let err = backup
            .add_image_to_backup("docker.io/app:v1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            BackupError::TimedOut("backup.example.com/app:v1".to_string())
        );
        assert!(err.is_retryable());
    }
}
