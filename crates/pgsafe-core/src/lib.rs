pub mod config;
pub mod error;
pub mod types;

pub use config::PgsafeConfig;
pub use error::{ConfigError, ConfigResult};
pub use types::{ArtifactName, BackupEvent, BackupResult, RemoteObject};
