//! Daemon lifecycle: startup checks, metrics endpoint, systemd notify, scheduler

use anyhow::{Context, Result};
use pgsafe_backup::{notifier_from_config, BackupService};
use pgsafe_core::PgsafeConfig;
use pgsafe_storage::{Storage, TransferClient};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::{BackupMetrics, HealthState};
use crate::scheduler::Scheduler;

/// How long an in-flight run gets to wind down after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub async fn run(config: PgsafeConfig) -> Result<()> {
    info!("daemon starting");
    config
        .validate_for_daemon()
        .context("invalid configuration")?;

    let client = TransferClient::from_config(&config).context("configuring object storage")?;
    let storage: Arc<dyn Storage> = Arc::new(client);
    match storage.check_health().await {
        Ok(()) => info!(
            endpoint = %config.storage.endpoint,
            bucket = %config.storage.bucket,
            "object storage: connected"
        ),
        // transient at startup; every run retries on its own
        Err(e) => warn!(endpoint = %config.storage.endpoint, "object storage: {e}"),
    }

    let service = BackupService::from_config(&config, storage.clone())
        .context("deriving encryption keys")?;
    if service.encryption_enabled() {
        info!("encryption enabled");
    } else {
        warn!("no encryption key configured: artifacts are uploaded compressed only");
    }

    let notifier = notifier_from_config(&config.notification);

    let mut registry = Registry::default();
    let metrics = BackupMetrics::new(&mut registry);
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = HealthState {
            registry: Arc::new(registry),
            storage: storage.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    let scheduler = Scheduler::new(
        Arc::new(service),
        notifier,
        config.schedule.interval(),
        config.backup.run_timeout(),
    )
    .run_on_start(config.schedule.run_on_start)
    .with_metrics(metrics);

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;

    let shutdown = CancellationToken::new();
    let mut scheduled = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    notify_ready();
    info!(
        database = %config.database.name,
        interval_secs = config.schedule.interval_secs,
        "pgsafed started"
    );

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
        r = &mut scheduled => {
            // the loop only returns on shutdown, so reaching here means it panicked
            if let Err(e) = r {
                error!("scheduler task failed: {e}");
            }
            anyhow::bail!("scheduler exited unexpectedly");
        }
    }

    info!("shutting down");
    shutdown.cancel();
    match tokio::time::timeout(SHUTDOWN_GRACE, scheduled).await {
        Ok(Ok(())) => info!("service stopped"),
        Ok(Err(e)) => error!("scheduler task failed during shutdown: {e}"),
        Err(_) => warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "in-flight backup did not stop in time"
        ),
    }
    Ok(())
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service.
    // Uses $NOTIFY_SOCKET; no-op if not set.
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
