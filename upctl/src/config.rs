//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `UPCTL_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `UPCTL_` override YAML values
//! 3. **S3_BUCKET_NAME** - Special case: switches the storage backend to S3 with that bucket
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `UPCTL_STORAGE__PUT_TIMEOUT=30s` sets the `storage.put_timeout` field.
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Override server port
//! UPCTL_PORT=8080
//!
//! # Store uploads in S3 (set at deploy time)
//! S3_BUCKET_NAME=my-upload-bucket
//!
//! # Tighten the upload limit to 10MB
//! UPCTL_LIMITS__FILES__MAX_FILE_SIZE=10485760
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "UPCTL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults, so an empty (or missing) config file yields a runnable service
/// storing uploads on the local filesystem.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Bucket injected by the deployment via `S3_BUCKET_NAME`. Forces the S3 backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_bucket_name: Option<String>,
    /// Where and how uploads are persisted
    pub storage: StorageConfig,
    /// Upload size and concurrency limits
    pub limits: LimitsConfig,
    /// CORS policy for browser clients
    pub cors: CorsConfig,
    /// Export traces over OTLP (configured through the standard `OTEL_*` variables)
    pub enable_otel_export: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            s3_bucket_name: None,
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
            cors: CorsConfig::default(),
            enable_otel_export: false,
        }
    }
}

/// Object storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Prepended to every generated key (e.g. `uploads/`)
    pub key_prefix: String,
    /// Maximum time a single write may take before the upload fails (default: 60s)
    #[serde(with = "humantime_serde")]
    pub put_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            key_prefix: String::new(),
            put_timeout: Duration::from_secs(60),
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    /// AWS S3 or an S3-compatible store
    S3 {
        bucket: String,
        /// Overrides the region from the AWS environment
        #[serde(default)]
        region: Option<String>,
        /// Custom endpoint for S3-compatible stores (MinIO, R2, ...)
        #[serde(default)]
        endpoint_url: Option<Url>,
        /// Use path-style addressing (`endpoint/bucket/key`)
        #[serde(default)]
        force_path_style: bool,
    },
    /// Files under a local directory
    Local { path: PathBuf },
    /// Process memory. Uploads are lost on restart.
    Memory,
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::Local {
            path: PathBuf::from("data/uploads"),
        }
    }
}

/// Resource limits for protecting system capacity.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub files: FileLimitsConfig,
}

/// Upload size and concurrency limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileLimitsConfig {
    /// Maximum (decoded) upload size in bytes. Must be greater than 0.
    /// Default: 100MB
    pub max_file_size: u64,
    /// Maximum number of concurrent uploads allowed system-wide.
    /// Set to 0 for unlimited.
    /// Default: 0 (unlimited)
    pub max_concurrent_uploads: usize,
    /// Maximum number of uploads that can wait in queue for a slot.
    /// When this limit is reached, new uploads receive HTTP 429 immediately.
    /// Set to 0 for unlimited waiting queue (not recommended).
    /// Default: 20
    pub max_waiting_uploads: usize,
    /// Maximum time in seconds to wait for an upload slot before returning HTTP 429.
    /// Set to 0 to reject immediately when no slot is available.
    /// Default: 60
    pub max_upload_wait_secs: u64,
}

impl Default for FileLimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024, // 100MB
            max_concurrent_uploads: 0,
            max_waiting_uploads: 20,
            max_upload_wait_secs: 60,
        }
    }
}

/// CORS (Cross-Origin Resource Sharing) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests
    pub allowed_origins: Vec<CorsOrigin>,
    /// Allow credentials (cookies) in CORS requests
    pub allow_credentials: bool,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
    /// Custom headers to expose to the browser (in addition to CORS-safelisted headers)
    pub exposed_headers: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Wildcard],
            allow_credentials: false,
            max_age: Some(3600),
            exposed_headers: Vec::new(),
        }
    }
}

/// CORS origin specification.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;
        config.apply_bucket_override();
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// `S3_BUCKET_NAME` wins over the configured backend, keeping any S3 connection settings
    fn apply_bucket_override(&mut self) {
        let Some(bucket_name) = self.s3_bucket_name.take() else {
            return;
        };

        match &mut self.storage.backend {
            StorageBackend::S3 { bucket, .. } => *bucket = bucket_name,
            other => {
                *other = StorageBackend::S3 {
                    bucket: bucket_name,
                    region: None,
                    endpoint_url: None,
                    force_path_style: false,
                }
            }
        }
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.limits.files.max_file_size == 0 {
            return Err(Error::Internal {
                operation: "Config validation: limits.files.max_file_size must be greater than 0".to_string(),
            });
        }

        if self.storage.put_timeout.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: storage.put_timeout must be greater than 0".to_string(),
            });
        }

        if let StorageBackend::S3 { bucket, .. } = &self.storage.backend
            && bucket.trim().is_empty()
        {
            return Err(Error::Internal {
                operation: "Config validation: S3 storage requires a bucket. \
                     Set S3_BUCKET_NAME or storage.backend.bucket."
                    .to_string(),
            });
        }

        let prefix = &self.storage.key_prefix;
        if prefix.starts_with('/') || prefix.split('/').any(|segment| segment == "..") {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: storage.key_prefix '{prefix}' must be relative and must not contain '..' segments"
                ),
            });
        }

        if self.cors.allow_credentials && self.cors.allowed_origins.contains(&CorsOrigin::Wildcard) {
            return Err(Error::Internal {
                operation: "Config validation: cors.allow_credentials cannot be combined with a wildcard origin".to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            // (UPCTL_CONFIG names the file itself and is not a config key)
            .merge(Env::prefixed("UPCTL_").ignore(&["config"]).split("__"))
            // Bucket name injected by the deployment
            .merge(Env::raw().only(&["S3_BUCKET_NAME"]))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
