//! pgsafed: scheduled PostgreSQL backups to S3-compatible object storage
//!
//! Usage:
//!   pgsafed [--config /etc/pgsafe/config.toml] [run]
//!   pgsafed backup
//!   pgsafed restore <URL> [--encryption-key KEY]
//!   pgsafed list
//!   pgsafed config show

mod commands;
mod daemon;
mod metrics;
mod scheduler;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pgsafe_core::PgsafeConfig;
use std::path::Path;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pgsafed", version, about = "Scheduled PostgreSQL backups")]
struct Cli {
    /// Path to the pgsafe TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "PGSAFE_CONFIG",
        default_value = "/etc/pgsafe/config.toml",
        global = true
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(long, env = "PGSAFE_LOG", global = true)]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "PGSAFE_LOG_FORMAT", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the backup scheduler (default)
    Run,
    /// Run one backup now and exit
    Backup,
    /// Download, decrypt and decompress a backup artifact
    Restore {
        /// Download URL of a .dump.zst or .dump.zst.enc artifact
        url: String,
        /// Encryption key; overrides the configured key
        #[arg(long)]
        encryption_key: Option<String>,
    },
    /// List remote backup artifacts
    List,
    /// Configuration utilities
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration with secrets redacted
    Show,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    init_logging(&cli, &config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "pgsafed starting"
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => daemon::run(config).await,
        Command::Backup => commands::backup(config).await,
        Command::Restore {
            url,
            encryption_key,
        } => commands::restore(config, &url, encryption_key).await,
        Command::List => commands::list(config).await,
        Command::Config {
            action: ConfigAction::Show,
        } => commands::show_config(&config),
    }
}

fn load_config(path: &Path) -> Result<PgsafeConfig> {
    let mut config = PgsafeConfig::load(path)?;
    config
        .apply_env()
        .context("applying environment overrides")?;
    Ok(config)
}

fn init_logging(cli: &Cli, config: &PgsafeConfig) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let level = match (&cli.log, config.daemon.debug) {
        (Some(level), _) => level.clone(),
        (None, true) => "debug".to_string(),
        (None, false) => config.daemon.log_level.clone(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let format = cli.log_format.clone().unwrap_or_else(|| {
        if config.daemon.log_format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    });

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
