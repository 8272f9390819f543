use crate::backup::BackupRegistry;
use crate::oci_registry::OciRegistryClient;
use crate::state::ControllerContext;
use crate::webserver::Readiness;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod backup;
mod config;
mod controller;
mod credentials;
mod image_reference;
mod oci_registry;
mod reconcile;
mod state;
mod webserver;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static DEFAULT_CONFIG_PATH: &str = "config/config.yaml";
static DEFAULT_SECURE_CONFIG_PATH: &str = "secure-config/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kube-image-backup {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let secure_config_path = env::var("SECURE_CONFIG_PATH")
        .unwrap_or_else(|_| DEFAULT_SECURE_CONFIG_PATH.to_string());
    let config = Arc::new(config::load_config(&config_path, &secure_config_path)?);
    info!(
        "Backup registry configured. User: {} backup registry {}",
        config
            .backup_registry
            .username
            .as_deref()
            .unwrap_or("<token>"),
        config.backup_registry.host
    );

    let kube_client = controller::create_client().await?;
    let oci_client = oci_registry::create_client(&config)?;
    let registry_client = Arc::new(OciRegistryClient::new(oci_client, config.clone()));
    let backup = Arc::new(BackupRegistry::new(
        config.backup_registry.clone(),
        registry_client,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));
    let readiness = Readiness::default();

    let app = webserver::create_app(readiness.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    let ctx = ControllerContext {
        kube_client,
        config,
        backup,
        shutdown,
        readiness,
    };
    controller::run(ctx).await?;
    server.await??;

    info!("Shutdown complete");
    Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM, which aborts in-flight image copies.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal, cancelling in-flight backups");
    shutdown.cancel();
}
