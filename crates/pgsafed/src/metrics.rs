//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  : Prometheus text format
//!   GET /healthz  : liveness probe (always 200 if the process is running)
//!   GET /readyz   : readiness probe (200 if the bucket answers a listing)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use pgsafe_core::BackupEvent;
use pgsafe_storage::Storage;
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use std::sync::Arc;

/// Backup run metrics. Counters get the `_total` suffix from the encoder.
#[derive(Clone)]
pub struct BackupMetrics {
    runs: Family<Vec<(String, String)>, Counter>,
    pruned_objects: Counter,
    duration: Histogram,
    last_size_bytes: Gauge,
}

impl BackupMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let runs = Family::default();
        let pruned_objects = Counter::default();
        let duration = Histogram::new([
            10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0,
        ]);
        let last_size_bytes = Gauge::default();

        registry.register(
            "pgsafe_backup_runs",
            "Backup runs by outcome",
            runs.clone(),
        );
        registry.register(
            "pgsafe_pruned_objects",
            "Remote objects deleted by retention pruning",
            pruned_objects.clone(),
        );
        registry.register(
            "pgsafe_backup_duration_seconds",
            "Wall-clock duration of backup runs in seconds",
            duration.clone(),
        );
        registry.register(
            "pgsafe_backup_last_size_bytes",
            "Size of the most recently uploaded artifact",
            last_size_bytes.clone(),
        );

        Self {
            runs,
            pruned_objects,
            duration,
            last_size_bytes,
        }
    }

    fn outcome_labels(outcome: &str) -> Vec<(String, String)> {
        vec![("outcome".to_string(), outcome.to_string())]
    }

    pub fn record(&self, event: &BackupEvent) {
        self.duration.observe(event.duration().as_secs_f64());
        match event {
            BackupEvent::Succeeded(result) => {
                self.runs
                    .get_or_create(&Self::outcome_labels("success"))
                    .inc();
                self.pruned_objects.inc_by(result.pruned_objects as u64);
                self.last_size_bytes
                    .set(i64::try_from(result.file_size).unwrap_or(i64::MAX));
            }
            BackupEvent::Failed { .. } => {
                self.runs
                    .get_or_create(&Self::outcome_labels("failure"))
                    .inc();
            }
        }
    }
}

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub storage: Arc<dyn Storage>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9100")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// 200 if the bucket answers a listing, 503 otherwise
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match state.storage.check_health().await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(e) => {
            tracing::debug!(error = %e, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unreachable")
        }
    }
}
