//! Mansion provisioner daemon
//!
//! Loads the template catalog, builds the controller and runs its
//! background loops until Ctrl-C:
//!
//! - **Lease daemon**: renews VM leases and tears down stale nodes
//! - **Retention controller**: evicts idle and never-connected nodes
//! - **Quota sweeper**: forgets too-many-VMs problems periodically

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mansion_provisioner::config::Config;
use mansion_provisioner::configure::SshdConfigurator;
use mansion_provisioner::mock::{MockBroker, MockConnector};
use mansion_provisioner::{Provisioner, TemplateCatalog};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting mansion provisioner");
    info!(
        data_dir = %config.provisioner.data_dir.display(),
        templates_file = %config.templates_file.display(),
        broker_url = %config.broker_url,
        "Configuration loaded"
    );

    let catalog = if config.templates_file.exists() {
        TemplateCatalog::load(&config.templates_file)?
    } else {
        warn!(
            templates_file = %config.templates_file.display(),
            "Template catalog not found, starting with no templates"
        );
        TemplateCatalog::default()
    };
    info!(templates = catalog.len(), "Template catalog loaded");

    std::fs::create_dir_all(&config.provisioner.data_dir).with_context(|| {
        format!(
            "failed to create data dir {}",
            config.provisioner.data_dir.display()
        )
    })?;

    // Broker and connector are mocks for now
    let broker = Arc::new(MockBroker::new(config.broker_url.clone()));
    let connector = Arc::new(MockConnector::new());

    let mut provisioner = Provisioner::new(
        config.provisioner.clone(),
        Arc::new(catalog),
        broker,
        connector,
    );
    match &config.ssh_public_key {
        Some(key) => {
            provisioner = provisioner.with_configurator(Arc::new(SshdConfigurator::new(
                SshdConfigurator::DEFAULT_USER,
                SshdConfigurator::DEFAULT_PORT,
                key.clone(),
            )));
        }
        None => warn!("MANSION_SSH_PUBLIC_KEY not set, VMs will not run sshd"),
    }
    let provisioner = Arc::new(provisioner);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let lease_handle = tokio::spawn({
        let daemon = provisioner.lease_daemon();
        let shutdown_rx = shutdown_rx.clone();
        async move { daemon.run(shutdown_rx).await }
    });

    let retention_handle = tokio::spawn({
        let retention = Arc::clone(provisioner.retention());
        let shutdown_rx = shutdown_rx.clone();
        async move { retention.run(shutdown_rx).await }
    });

    let quota_handle = tokio::spawn({
        let provisioner = Arc::clone(&provisioner);
        let shutdown_rx = shutdown_rx.clone();
        async move { provisioner.run_quota_sweeper(shutdown_rx).await }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = lease_handle => {
            warn!("Lease daemon exited");
        }
        _ = retention_handle => {
            warn!("Retention controller exited");
        }
        _ = quota_handle => {
            warn!("Quota sweeper exited");
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Provisioner shutdown complete");
    Ok(())
}
