//! OpenDAL Operator factory for the backup bucket

use anyhow::{Context, Result};
use opendal::Operator;
use secrecy::{ExposeSecret, SecretString};

/// Minimal config needed to build an operator
/// (the full section lives in pgsafe-core's StorageConfig)
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: SecretString,
}

/// Build an OpenDAL Operator for R2 (or any S3-compatible endpoint).
///
/// No RetryLayer: every call is wrapped by [`crate::retry::RetryPolicy`]
/// instead, so the attempt budget is counted in exactly one place.
pub fn build_operator(cfg: &OperatorConfig) -> Result<Operator> {
    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(cfg.secret_access_key.expose_secret());

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();

    Ok(op)
}

/// Build an operator from the pgsafe-core storage section.
///
/// If `enforce_tls` is true and the endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_from_core_config(storage: &pgsafe_core::config::StorageConfig) -> Result<Operator> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                storage.endpoint
            );
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "S3 endpoint uses plaintext HTTP, credentials are transmitted unencrypted. \
             Set storage.enforce_tls = true and use HTTPS in production."
        );
    }

    let access_key_id = storage
        .access_key_id
        .clone()
        .filter(|k| !k.is_empty())
        .context("storage.access_key_id is not set")?;
    let secret_access_key = storage
        .secret_access_key
        .clone()
        .context("storage.secret_access_key is not set")?;

    build_operator(&OperatorConfig {
        endpoint: storage.endpoint.clone(),
        region: storage.region.clone(),
        bucket: storage.bucket.clone(),
        access_key_id,
        secret_access_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgsafe_core::config::StorageConfig;

    fn storage(endpoint: &str, enforce_tls: bool) -> StorageConfig {
        StorageConfig {
            endpoint: endpoint.into(),
            bucket: "backups".into(),
            access_key_id: Some("key".into()),
            secret_access_key: Some(SecretString::from("secret".to_string())),
            enforce_tls,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_operator_valid() {
        let cfg = OperatorConfig {
            endpoint: "https://account.r2.cloudflarestorage.com".to_string(),
            region: "auto".to_string(),
            bucket: "test-bucket".to_string(),
            access_key_id: "test-key".to_string(),
            secret_access_key: SecretString::from("test-secret".to_string()),
        };
        assert!(build_operator(&cfg).is_ok());
    }

    #[test]
    fn test_build_from_core_config_http_allowed_without_enforce_tls() {
        assert!(build_from_core_config(&storage("http://localhost:9000", false)).is_ok());
    }

    #[test]
    fn test_build_from_core_config_http_enforce_tls() {
        let result = build_from_core_config(&storage("http://insecure:9000", true));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("enforce_tls"), "unexpected error: {err}");
    }

    #[test]
    fn test_build_from_core_config_missing_credentials() {
        let mut cfg = storage("https://s3.example.com", true);
        cfg.access_key_id = None;
        assert!(build_from_core_config(&cfg).is_err());

        let mut cfg = storage("https://s3.example.com", true);
        cfg.secret_access_key = None;
        assert!(build_from_core_config(&cfg).is_err());
    }
}
