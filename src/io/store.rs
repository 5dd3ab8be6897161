//! Object store configuration for S3 and local filesystem output.

use crate::config::Config;
use anyhow::Result;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::{BackoffConfig, ClientOptions, ObjectStore, RetryConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Client options for artifact uploads.
///
/// Artifacts are a few MB each and written with modest concurrency, so the
/// pool is kept small.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(60))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(32)
}

/// Retry transient failures (429 and 5xx) with exponential backoff.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an authenticated S3 client for writing.
///
/// Credentials and region are loaded from the environment
/// (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION, ...).
fn create_authenticated_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating authenticated S3 client for bucket: {}", bucket);

    let builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config());

    Ok(Arc::new(builder.build()?))
}

/// Create the artifact store: LocalFileSystem if local_path is set,
/// otherwise S3 with credentials.
pub fn create_output_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match (&config.output.local_path, &config.output.bucket) {
        (Some(local_path), _) => {
            let path = std::path::Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)?;
            }
            tracing::info!("Creating LocalFileSystem store at: {}", path.display());
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        (_, Some(bucket)) => create_authenticated_store(bucket),
        _ => anyhow::bail!("Invalid config: no output destination"),
    }
}

/// Key prefix inside the store: empty for local output (the path is the
/// store root), the S3 prefix otherwise.
pub fn get_output_prefix(config: &Config) -> &str {
    if config.output.is_local() {
        ""
    } else {
        config.output.prefix().unwrap_or("")
    }
}

/// Local directory for run-level files (metrics CSV, run metrics).
///
/// Remote runs keep these in the working directory.
pub fn get_test_dir(config: &Config) -> PathBuf {
    config
        .output
        .local_path()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
