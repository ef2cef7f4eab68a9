//! Notification sinks for backup outcomes.
//!
//! Delivery is best effort: callers log a `NotifyError` and move on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pgsafe_core::config::NotificationConfig;
use pgsafe_core::{BackupEvent, BackupResult};
use serde::Serialize;
use tracing::{error, info};

const COLOR_SUCCESS: u32 = 5_620_992;
const COLOR_FAILURE: u32 = 15_548_997;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &BackupEvent) -> Result<(), NotifyError>;
}

/// Discord webhook when enabled and a URL is set, log-only otherwise
pub fn notifier_from_config(cfg: &NotificationConfig) -> Arc<dyn Notifier> {
    match cfg.discord_webhook_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) if cfg.enabled => Arc::new(DiscordNotifier::new(
            url,
            Duration::from_secs(cfg.timeout_secs),
        )),
        _ => Arc::new(LogNotifier),
    }
}

/// Writes the event to the log and nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &BackupEvent) -> Result<(), NotifyError> {
        match event {
            BackupEvent::Succeeded(result) => info!(
                file = %result.file_name,
                size_bytes = result.file_size,
                duration_secs = result.duration.as_secs_f64(),
                url = %result.download_url,
                "backup succeeded"
            ),
            BackupEvent::Failed { duration, error } => error!(
                duration_secs = duration.as_secs_f64(),
                error = %error,
                "backup failed"
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct DiscordWebhook {
    pub embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
pub struct DiscordEmbed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub timestamp: String,
    pub fields: Vec<DiscordEmbedField>,
}

#[derive(Debug, Serialize)]
pub struct DiscordEmbedField {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub inline: bool,
}

impl DiscordEmbedField {
    fn new(name: &str, value: String, inline: bool) -> Self {
        Self {
            name: name.to_string(),
            value,
            inline,
        }
    }
}

pub struct DiscordNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl DiscordNotifier {
    pub fn new(webhook_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            webhook_url: webhook_url.to_string(),
        }
    }

    pub fn embed_for(event: &BackupEvent) -> DiscordEmbed {
        match event {
            BackupEvent::Succeeded(result) => success_embed(result),
            BackupEvent::Failed { duration, error } => failure_embed(*duration, error),
        }
    }
}

fn success_embed(result: &BackupResult) -> DiscordEmbed {
    let mut fields = vec![
        DiscordEmbedField::new(":file_folder: File", result.file_name.clone(), true),
        DiscordEmbedField::new(
            ":timer: Duration",
            format!("{:.1}s", result.duration.as_secs_f64()),
            true,
        ),
    ];
    if !result.download_url.is_empty() {
        fields.push(DiscordEmbedField::new(
            ":link: Download URL",
            result.download_url.clone(),
            true,
        ));
    }
    fields.push(DiscordEmbedField::new(
        ":floppy_disk: Size",
        format!("{:.2} MB", result.file_size as f64 / 1024.0 / 1024.0),
        true,
    ));

    DiscordEmbed {
        title: "✅ Backup completed".into(),
        description: "The PostgreSQL backup finished successfully.".into(),
        color: COLOR_SUCCESS,
        timestamp: Utc::now().to_rfc3339(),
        fields,
    }
}

fn failure_embed(duration: Duration, error: &str) -> DiscordEmbed {
    DiscordEmbed {
        title: "❌ Backup failed".into(),
        description: "The PostgreSQL backup did not complete. Check the logs.".into(),
        color: COLOR_FAILURE,
        timestamp: Utc::now().to_rfc3339(),
        fields: vec![
            DiscordEmbedField::new(
                ":timer: Duration",
                format!("{:.1}s", duration.as_secs_f64()),
                true,
            ),
            DiscordEmbedField::new(":warning: Error", error.to_string(), false),
        ],
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, event: &BackupEvent) -> Result<(), NotifyError> {
        let body = DiscordWebhook {
            embeds: vec![Self::embed_for(event)],
        };
        let resp = self.client.post(&self.webhook_url).json(&body).send().await?;

        // Discord answers 204 No Content on success
        if resp.status() != reqwest::StatusCode::NO_CONTENT {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        info!("discord notification sent");
        Ok(())
    }
}
