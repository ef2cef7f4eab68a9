//! One-shot subcommands: backup, restore, list, config show

use anyhow::{Context, Result};
use chrono::Utc;
use pgsafe_backup::{notifier_from_config, BackupService};
use pgsafe_core::{BackupEvent, PgsafeConfig, RemoteObject};
use pgsafe_storage::{Storage, TransferClient, UnconfiguredStorage};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::scheduler::Scheduler;

const RESTORE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling");
            token.cancel();
        }
    });
}

/// Run the pipeline once, with the same supervision, deadline and
/// notifications as a scheduled run. Fails when the run fails.
pub async fn backup(config: PgsafeConfig) -> Result<()> {
    config
        .validate_for_backup()
        .context("invalid configuration")?;
    let storage = TransferClient::from_config(&config).context("configuring object storage")?;
    let service = BackupService::from_config(&config, Arc::new(storage))
        .context("deriving encryption keys")?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let event = Scheduler::new(
        Arc::new(service),
        notifier_from_config(&config.notification),
        config.schedule.interval(),
        config.backup.run_timeout(),
    )
    .run_once(&cancel)
    .await;

    match event {
        BackupEvent::Succeeded(result) => {
            println!("{}", result.download_url);
            Ok(())
        }
        BackupEvent::Failed { error, .. } => anyhow::bail!("backup failed: {error}"),
    }
}

/// Download, decrypt and decompress the artifact at `url`. A non-empty
/// `key` replaces the configured encryption key.
pub async fn restore(mut config: PgsafeConfig, url: &str, key: Option<String>) -> Result<()> {
    if let Some(key) = key.filter(|k| !k.is_empty()) {
        info!("using encryption key from command line");
        config.encryption.key = Some(SecretString::from(key));
    }
    let service = BackupService::from_config(&config, Arc::new(UnconfiguredStorage))
        .context("deriving encryption keys")?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);
    let deadline = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESTORE_TIMEOUT).await;
            warn!(timeout_secs = RESTORE_TIMEOUT.as_secs(), "restore timed out");
            cancel.cancel();
        })
    };

    let restored = service.retrieve_from_url(url, &cancel).await;
    deadline.abort();
    let path = restored.with_context(|| format!("restoring {url}"))?;

    info!(file = %path.display(), "restored backup");
    println!("{}", path.display());
    Ok(())
}

/// Print remote artifacts, oldest first, with size and age
pub async fn list(config: PgsafeConfig) -> Result<()> {
    config
        .validate_storage()
        .context("invalid configuration")?;
    let storage = TransferClient::from_config(&config).context("configuring object storage")?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);
    let mut objects = storage
        .list("", &cancel)
        .await
        .context("listing remote objects")?;
    objects.sort_by_key(|o| o.last_modified);

    for line in format_listing(&objects, Utc::now()) {
        println!("{line}");
    }
    Ok(())
}

fn format_listing(objects: &[RemoteObject], now: chrono::DateTime<Utc>) -> Vec<String> {
    objects
        .iter()
        .map(|o| {
            let age_days = (now - o.last_modified).num_days();
            format!(
                "{:<48} {:>10.2} MB {:>5}d  {}",
                o.name,
                o.size as f64 / 1024.0 / 1024.0,
                age_days,
                o.last_modified.format("%Y-%m-%d %H:%M")
            )
        })
        .collect()
}

pub fn show_config(config: &PgsafeConfig) -> Result<()> {
    let rendered = config
        .to_redacted_toml()
        .context("rendering configuration")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_listing() {
        let now = Utc.with_ymd_and_hms(2025, 8, 28, 12, 0, 0).unwrap();
        let objects = vec![RemoteObject {
            name: "misskey_2025-07-19_05-00.dump.zst.enc".into(),
            size: 3 * 1024 * 1024,
            last_modified: Utc.with_ymd_and_hms(2025, 7, 19, 5, 0, 0).unwrap(),
        }];

        let lines = format_listing(&objects, now);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("misskey_2025-07-19_05-00.dump.zst.enc"));
        assert!(lines[0].contains("3.00 MB"));
        assert!(lines[0].contains("40d"));
        assert!(lines[0].ends_with("2025-07-19 05:00"));
    }

    #[tokio::test]
    async fn test_restore_rejects_bad_url_without_storage() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = PgsafeConfig::default();
        config.backup.restore_dir = tmp.path().to_path_buf();

        let err = restore(config, "ftp://example.com/a.dump.zst", None)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid download URL"));
    }

    #[tokio::test]
    async fn test_restore_key_override_replaces_configured_key() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = PgsafeConfig::default();
        config.backup.restore_dir = tmp.path().to_path_buf();
        config.encryption.key = Some(SecretString::from("short"));

        let err = restore(config.clone(), "ftp://example.com/a.dump.zst", None)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("deriving encryption keys"));

        let override_key = "an override key that is comfortably over 32 bytes".to_string();
        let err = restore(config.clone(), "ftp://example.com/a.dump.zst", Some(override_key))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid download URL"), "{err:#}");

        // an empty override keeps the configured key
        let err = restore(config, "ftp://example.com/a.dump.zst", Some(String::new()))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("deriving encryption keys"));
    }

    #[tokio::test]
    async fn test_backup_requires_storage_settings() {
        let err = backup(PgsafeConfig::default()).await.unwrap_err();
        assert!(format!("{err:#}").contains("storage.endpoint"));
    }
}
