use std::path::PathBuf;

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Missing or invalid configuration. Always fatal at startup, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}
