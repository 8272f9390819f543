use crate::config::Config;
use anyhow::{Context, Result};
use oci_distribution::client::{Certificate, CertificateEncoding, ClientConfig};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest::{self, OciDescriptor};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use serde::Deserialize;
use std::fs;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

const TAGS_PAGE_SIZE: usize = 100;

static MANIFEST_MEDIA_TYPES: &[&str] = &[
    manifest::OCI_IMAGE_INDEX_MEDIA_TYPE,
    manifest::IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    manifest::OCI_IMAGE_MEDIA_TYPE,
    manifest::IMAGE_MANIFEST_MEDIA_TYPE,
];

/// Registry protocol used by the backup bookkeeping.
///
/// `repository` is `host[/path]/name` without a tag, image arguments are full
/// `host/path/name:tag` references.
pub trait RegistryClient: Send + Sync + 'static {
    fn list_tags(&self, repository: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn manifest_digest(&self, image: &str) -> impl Future<Output = Result<String>> + Send;

    fn copy_image(&self, source: &str, target: &str) -> impl Future<Output = Result<()>> + Send;
}

pub fn create_client(config: &Config) -> Result<Client> {
    info!("Initializing OCI Registry client");
    let mut extra_root_certificates = Vec::new();

    for file_path in &config.tls.ca_certificate_paths {
        let data = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        extra_root_certificates.push(Certificate {
            encoding: CertificateEncoding::Pem,
            data,
        });
    }

    let client_config = ClientConfig {
        extra_root_certificates,
        ..Default::default()
    };
    Client::try_from(client_config).context("Failed to build OCI registry client")
}

/// The parts of an image manifest or index needed to copy it.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    media_type: Option<String>,
    config: Option<OciDescriptor>,
    #[serde(default)]
    layers: Vec<OciDescriptor>,
    #[serde(default)]
    manifests: Vec<IndexEntry>,
}

#[derive(Deserialize)]
struct IndexEntry {
    digest: String,
}

impl RawManifest {
    fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context("Failed to parse image manifest")
    }

    fn is_index(&self) -> bool {
        let media_type = self.media_type.as_deref();
        media_type == Some(manifest::OCI_IMAGE_INDEX_MEDIA_TYPE)
            || media_type == Some(manifest::IMAGE_MANIFEST_LIST_MEDIA_TYPE)
            || !self.manifests.is_empty()
    }

    fn content_type(&self) -> &str {
        match self.media_type.as_deref() {
            Some(media_type) => media_type,
            None if self.is_index() => manifest::OCI_IMAGE_INDEX_MEDIA_TYPE,
            None => manifest::OCI_IMAGE_MEDIA_TYPE,
        }
    }

    fn blobs(&self) -> impl Iterator<Item = &OciDescriptor> {
        self.config.iter().chain(self.layers.iter())
    }
}

/// [`RegistryClient`] on top of the `oci-distribution` client. Credentials
/// come from the config by registry host, anonymous access otherwise.
pub struct OciRegistryClient {
    client: Client,
    config: Arc<Config>,
}

impl OciRegistryClient {
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    fn auth_for(&self, reference: &Reference) -> RegistryAuth {
        self.config
            .find_credentials_for_hostname(reference.registry())
            .map(|credentials| credentials.registry_auth())
            .unwrap_or(RegistryAuth::Anonymous)
    }

    async fn authenticate(
        &self,
        reference: &Reference,
        operation: RegistryOperation,
    ) -> Result<RegistryAuth> {
        let auth = self.auth_for(reference);
        self.client
            .auth(reference, &auth, operation)
            .await
            .with_context(|| format!("Failed to authenticate against {}", reference.registry()))?;
        Ok(auth)
    }

    async fn pull_manifest(
        &self,
        reference: &Reference,
        auth: &RegistryAuth,
    ) -> Result<(Vec<u8>, RawManifest)> {
        debug!("Pulling manifest {}", reference);
        let (raw, _digest) = self
            .client
            .pull_manifest_raw(reference, auth, MANIFEST_MEDIA_TYPES)
            .await
            .with_context(|| format!("Failed to pull manifest {}", reference))?;
        let raw = raw.to_vec();
        let manifest = RawManifest::parse(&raw)?;
        Ok((raw, manifest))
    }

    async fn push_manifest(
        &self,
        reference: &Reference,
        raw: Vec<u8>,
        manifest: &RawManifest,
    ) -> Result<()> {
        debug!("Pushing manifest {}", reference);
        let url = self
            .client
            .push_manifest_raw(
                reference,
                raw,
                manifest
                    .content_type()
                    .parse()
                    .context("Invalid manifest media type")?,
            )
            .await
            .with_context(|| format!("Failed to push manifest {}", reference))?;
        debug!("Manifest available at {}", url);
        Ok(())
    }

    async fn copy_blobs(
        &self,
        source: &Reference,
        target: &Reference,
        manifest: &RawManifest,
    ) -> Result<()> {
        for blob in manifest.blobs() {
            debug!("Copying blob {} ({} bytes)", blob.digest, blob.size);
            let mut data = Vec::new();
            self.client
                .pull_blob(source, blob, &mut data)
                .await
                .with_context(|| format!("Failed to pull blob {} from {}", blob.digest, source))?;
            self.client
                .push_blob(target, &data, &blob.digest)
                .await
                .with_context(|| format!("Failed to push blob {} to {}", blob.digest, target))?;
        }
        Ok(())
    }
}

impl RegistryClient for OciRegistryClient {
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let reference = parse_reference(repository)?;
        let auth = self.authenticate(&reference, RegistryOperation::Pull).await?;
        let mut tags = Vec::new();
        let mut last: Option<String> = None;

        loop {
            debug!("Listing tags of {} after {:?}", repository, last);
            let page = match self
                .client
                .list_tags(&reference, &auth, Some(TAGS_PAGE_SIZE), last.as_deref())
                .await
            {
                Ok(page) => page,
                Err(err) if is_not_found(&err) => {
                    debug!("Repository {} does not exist yet", repository);
                    return Ok(tags);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Failed to list tags of {}", repository));
                }
            };

            let next = next_tags_page(&page.tags, last.as_deref());
            tags.extend(page.tags);
            match next {
                Some(next) => last = Some(next),
                None => return Ok(tags),
            }
        }
    }

    async fn manifest_digest(&self, image: &str) -> Result<String> {
        let reference = parse_reference(image)?;
        let auth = self.authenticate(&reference, RegistryOperation::Pull).await?;
        self.client
            .fetch_manifest_digest(&reference, &auth)
            .await
            .with_context(|| format!("Failed to fetch manifest digest of {}", image))
    }

    async fn copy_image(&self, source: &str, target: &str) -> Result<()> {
        let source = parse_reference(source)?;
        let target = parse_reference(target)?;
        info!("Copying image {} to {}", source, target);

        let source_auth = self.authenticate(&source, RegistryOperation::Pull).await?;
        self.authenticate(&target, RegistryOperation::Push).await?;

        let (raw, manifest) = self.pull_manifest(&source, &source_auth).await?;
        if manifest.is_index() {
            debug!(
                "Copying {} platform manifests of {}",
                manifest.manifests.len(),
                source
            );
            for child in &manifest.manifests {
                let child_source = with_digest(&source, &child.digest);
                let (child_raw, child_manifest) =
                    self.pull_manifest(&child_source, &source_auth).await?;
                if child_manifest.is_index() {
                    anyhow::bail!(
                        "Nested image index {} in {} is not supported",
                        child.digest,
                        source
                    );
                }
                self.copy_blobs(&source, &target, &child_manifest).await?;
                self.push_manifest(&with_digest(&target, &child.digest), child_raw, &child_manifest)
                    .await?;
            }
        } else {
            self.copy_blobs(&source, &target, &manifest).await?;
        }

        self.push_manifest(&target, raw, &manifest).await
    }
}

fn parse_reference(image: &str) -> Result<Reference> {
    image
        .parse::<Reference>()
        .with_context(|| format!("Invalid image reference {}", image))
}

fn with_digest(reference: &Reference, digest: &str) -> Reference {
    Reference::with_digest(
        reference.registry().to_string(),
        reference.repository().to_string(),
        digest.to_string(),
    )
}

/// Tag listings are paged with `n` and `last`. A short page ends the listing,
/// as does a page that did not move past `last` for registries ignoring it.
fn next_tags_page(tags: &[String], last: Option<&str>) -> Option<String> {
    if tags.len() < TAGS_PAGE_SIZE {
        return None;
    }
    let page_last = tags.last()?;
    if Some(page_last.as_str()) == last {
        return None;
    }
    Some(page_last.clone())
}

fn is_not_found(err: &OciDistributionError) -> bool {
    match err {
        OciDistributionError::RegistryError { envelope, .. } => envelope.errors.iter().any(|e| {
            matches!(
                e.code,
                OciErrorCode::NameUnknown | OciErrorCode::ManifestUnknown
            )
        }),
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        _ => false,
    }
}
