//! Database dump producer

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pgsafe_core::config::DatabaseConfig;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ToolError;
use crate::process::run_tool;

/// Writes one opaque dump blob to `dest`.
#[async_trait]
pub trait DumpProducer: Send + Sync {
    async fn dump(&self, dest: &Path, cancel: &CancellationToken) -> Result<(), ToolError>;
}

/// `pg_dump -Fc` (custom archive format, restorable with pg_restore).
///
/// Connection parameters go on the command line; the password goes through
/// `PGPASSWORD` so it never shows up in the process list.
pub struct PgDump {
    binary: PathBuf,
    host: String,
    port: u16,
    user: String,
    password: Option<SecretString>,
    database: String,
}

impl PgDump {
    pub fn new(binary: impl Into<PathBuf>, db: &DatabaseConfig) -> Self {
        Self {
            binary: binary.into(),
            host: db.host.clone(),
            port: db.port,
            user: db.user.clone(),
            password: db.password.clone(),
            database: db.name.clone(),
        }
    }

    fn command(&self, dest: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--host")
            .arg(&self.host)
            .arg("--port")
            .arg(self.port.to_string())
            .arg("--username")
            .arg(&self.user)
            .arg("--no-password")
            .arg("-Fc")
            .arg("-f")
            .arg(dest)
            .arg(&self.database);
        if let Some(password) = &self.password {
            cmd.env("PGPASSWORD", password.expose_secret());
        }
        cmd
    }
}

#[async_trait]
impl DumpProducer for PgDump {
    async fn dump(&self, dest: &Path, cancel: &CancellationToken) -> Result<(), ToolError> {
        info!(
            file = %dest.display(),
            host = %self.host,
            database = %self.database,
            "creating PostgreSQL dump"
        );
        run_tool(self.command(dest), "pg_dump", cancel).await
    }
}
