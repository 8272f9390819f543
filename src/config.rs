use crate::credentials::{Credentials, SecretString};
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Deserialize;
use serde_yaml_ng::Value;
use std::path::PathBuf;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub webserver: Webserver,
    pub backup_registry: BackupRegistryConfig,
    #[serde(default)]
    pub registries: Vec<Registry>,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
    #[serde(default)]
    pub tls: Tls,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

/// Destination of every backup. `host` may carry an organization prefix,
/// e.g. `registry.example.com/backups`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRegistryConfig {
    pub host: String,
    pub username: Option<String>,
    pub token: SecretString,
    #[serde(default)]
    pub existing_tag_policy: ExistingTagPolicy,
    #[serde(default = "default_copy_timeout_seconds")]
    pub copy_timeout_seconds: u64,
}

/// Credentials used to pull source images from a registry other than the backup one.
#[derive(Debug, Clone, Deserialize)]
pub struct Registry {
    pub hostname: String,
    pub username: Option<String>,
    pub token: SecretString,
}

/// What to do when the backup tag already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExistingTagPolicy {
    /// Accept it when its manifest digest matches the source, fail otherwise.
    #[default]
    Reject,
    /// Accept it without comparing content.
    Reuse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    #[default]
    AbortOnFirstError,
    ContinueOnError,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSettings {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_concurrency")]
    pub concurrency: u16,
    #[serde(default = "default_requeue_after_seconds")]
    pub requeue_after_seconds: u64,
    #[serde(default)]
    pub excluded_namespaces: Vec<String>,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            concurrency: default_concurrency(),
            requeue_after_seconds: default_requeue_after_seconds(),
            excluded_namespaces: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

fn default_copy_timeout_seconds() -> u64 {
    600
}

fn default_concurrency() -> u16 {
    4
}

fn default_requeue_after_seconds() -> u64 {
    30
}

impl Config {
    /// Credentials for a registry host. The backup registry is matched on the
    /// host part of its configured name.
    pub fn find_credentials_for_hostname(&self, hostname: &str) -> Option<Credentials> {
        let backup_hostname = self
            .backup_registry
            .host
            .split('/')
            .next()
            .unwrap_or_default();
        if backup_hostname == hostname {
            return Some(self.backup_registry.credentials());
        }
        self.registries
            .iter()
            .find(|registry| registry.hostname == hostname)
            .map(|registry| Credentials::new(registry.username.clone(), registry.token.clone()))
    }
}

impl BackupRegistryConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.token.clone())
    }
}

impl ReconcileSettings {
    pub fn excluded_namespace_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.excluded_namespaces {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Invalid excluded namespace pattern {}", pattern))?,
            );
        }
        builder
            .build()
            .context("Failed to build excluded namespace matcher")
    }
}

/// Loads the main config file and deep-merges the secure overlay on top of it
/// when that file exists.
pub fn load_config<P: AsRef<Path>, S: AsRef<Path>>(path: P, secure_path: S) -> Result<Config> {
    let mut value = read_yaml(path.as_ref())?;

    let secure_path = secure_path.as_ref();
    if secure_path.exists() {
        let overlay = read_yaml(secure_path)?;
        merge_yaml(&mut value, overlay);
    } else {
        info!(
            "No secure config overlay found at {}, skipping",
            secure_path.display()
        );
    }

    let config: Config =
        serde_yaml_ng::from_value(value).context("Failed to deserialize merged config")?;
    if config.backup_registry.host.trim().is_empty() {
        anyhow::bail!("backupRegistry.host must not be empty");
    }
    config
        .reconcile
        .excluded_namespace_set()
        .context("Invalid reconcile settings")?;
    Ok(config)
}

fn read_yaml(path: &Path) -> Result<Value> {
    info!("Loading config from file {}", path.display());
    let yaml_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")
}

fn merge_yaml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error if any env var is missing or regex fails.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let missing: Vec<&str> = re
        .captures_iter(input)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|name| env::var(name).is_err())
        .collect();
    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable: {}", missing.join(", "));
    }

    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });

    Ok(result.into_owned())
}
