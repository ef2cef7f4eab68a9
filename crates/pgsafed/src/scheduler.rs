//! Fixed-cadence scheduler with a supervised run boundary.
//!
//! Each run is a spawned task: a panic inside the pipeline surfaces as a
//! `JoinError` here, is reported as a failed run, and the loop keeps going.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pgsafe_backup::{BackupError, BackupService, Notifier};
use pgsafe_core::BackupEvent;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::BackupMetrics;

/// A startup run only happens when the first tick is further away than this
const INITIAL_RUN_THRESHOLD: Duration = Duration::from_secs(30 * 60);
/// Delay before the startup run
const INITIAL_RUN_DELAY: Duration = Duration::from_secs(5);

pub fn should_run_on_start(enabled: bool, interval: Duration) -> bool {
    enabled && interval > INITIAL_RUN_THRESHOLD
}

pub struct Scheduler {
    service: Arc<BackupService>,
    notifier: Arc<dyn Notifier>,
    metrics: Option<BackupMetrics>,
    interval: Duration,
    run_on_start: bool,
    run_timeout: Duration,
}

impl Scheduler {
    pub fn new(
        service: Arc<BackupService>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
        run_timeout: Duration,
    ) -> Self {
        Self {
            service,
            notifier,
            metrics: None,
            interval,
            run_on_start: true,
            run_timeout,
        }
    }

    pub fn with_metrics(mut self, metrics: BackupMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn run_on_start(mut self, enabled: bool) -> Self {
        self.run_on_start = enabled;
        self
    }

    /// Tick until `shutdown` fires. An in-flight run sees the cancellation
    /// through a child token and is awaited before this returns.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            run_timeout_secs = self.run_timeout.as_secs(),
            "scheduler started"
        );

        if should_run_on_start(self.run_on_start, self.interval) {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(INITIAL_RUN_DELAY) => {}
            }
            self.run_once(&shutdown).await;
        }

        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once(&shutdown).await;
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Run one backup under the run deadline, then record and notify.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> BackupEvent {
        let started = Instant::now();
        info!("starting scheduled backup");

        let cancel = shutdown.child_token();
        let service = self.service.clone();
        let token = cancel.clone();
        let mut handle = tokio::spawn(async move { service.create_backup(&token).await });

        let joined = tokio::select! {
            r = &mut handle => r,
            _ = tokio::time::sleep(self.run_timeout) => {
                warn!(timeout_secs = self.run_timeout.as_secs(), "backup run timed out; cancelling");
                cancel.cancel();
                handle.await
            }
        };

        // the handle is never aborted, so a join error is a panic in practice
        let outcome = match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(BackupError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(BackupError::Panicked(e.to_string())),
        };

        let event = match outcome {
            Ok(result) => {
                info!(
                    file = %result.file_name,
                    duration_secs = result.duration.as_secs_f64(),
                    "scheduled backup completed"
                );
                BackupEvent::Succeeded(result)
            }
            Err(e) => {
                error!(error = %e, stage = ?e.stage(), "backup failed");
                BackupEvent::Failed {
                    duration: started.elapsed(),
                    error: e.to_string(),
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record(&event);
        }
        if let Err(e) = self.notifier.notify(&event).await {
            error!(error = %e, "failed to send notification");
        }
        event
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
