//! Configuration management for the submission pipeline

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub pipeline: PipelineConfig,
    pub database: DatabaseConfig,
    pub author: AuthorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    pub region: Option<String>,
    /// Path-style addressing, required by MinIO and Ceph
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub part_size: u64,
    pub min_part_size: u64,
    /// Ceph RGW caps multipart uploads at 1000 parts
    pub max_parts: u32,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub request_timeout_secs: u64,
}

impl UploadConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Sidecar directory
    pub state_dir: PathBuf,
    /// Where containers are written before upload
    pub output_dir: PathBuf,
    pub max_parallel_files: usize,
    pub recipient_public_key: PathBuf,
    /// JSON submission descriptor handed over by the submission tooling
    pub submission_descriptor: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorConfig {
    pub name: String,
    /// Hex-encoded Ed25519 seed
    pub private_key_path: PathBuf,
    /// Register the key in the ledger on startup (first deployment only)
    pub register_key: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig {
                endpoint: "http://localhost:9000".to_string(),
                bucket: "submissions".to_string(),
                access_key: "admin".to_string(),
                secret_key: "password123".to_string(),
                session_token: None,
                region: Some("us-east-1".to_string()),
                force_path_style: true,
            },
            upload: UploadConfig::default(),
            pipeline: PipelineConfig {
                state_dir: PathBuf::from("./state"),
                output_dir: PathBuf::from("./encrypted"),
                max_parallel_files: 2,
                recipient_public_key: PathBuf::from("./recipient.pub"),
                submission_descriptor: None,
            },
            database: DatabaseConfig {
                url: "sqlite:./submissions.db".to_string(),
            },
            author: AuthorConfig {
                name: "submitter".to_string(),
                private_key_path: PathBuf::from("./author.key"),
                register_key: false,
            },
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            part_size: 256 * 1024 * 1024,
            min_part_size: 5 * 1024 * 1024,
            max_parts: 1000,
            concurrency: 4,
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 30_000,
            request_timeout_secs: 300,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            storage: StorageConfig {
                endpoint: required("S3_ENDPOINT")?,
                bucket: required("S3_BUCKET")?,
                access_key: required("S3_ACCESS_KEY")?,
                secret_key: required("S3_SECRET_KEY")?,
                session_token: env::var("S3_SESSION_TOKEN").ok(),
                region: env::var("S3_REGION").ok(),
                force_path_style: parsed("S3_FORCE_PATH_STYLE", defaults.storage.force_path_style)?,
            },
            upload: UploadConfig {
                part_size: parsed("UPLOAD_PART_SIZE", defaults.upload.part_size)?,
                min_part_size: parsed("UPLOAD_MIN_PART_SIZE", defaults.upload.min_part_size)?,
                max_parts: parsed("UPLOAD_MAX_PARTS", defaults.upload.max_parts)?,
                concurrency: parsed("UPLOAD_CONCURRENCY", defaults.upload.concurrency)?,
                max_attempts: parsed("UPLOAD_MAX_ATTEMPTS", defaults.upload.max_attempts)?,
                backoff_base_ms: parsed("UPLOAD_BACKOFF_MS", defaults.upload.backoff_base_ms)?,
                backoff_max_ms: parsed("UPLOAD_BACKOFF_MAX_MS", defaults.upload.backoff_max_ms)?,
                request_timeout_secs: parsed(
                    "UPLOAD_TIMEOUT_SECS",
                    defaults.upload.request_timeout_secs,
                )?,
            },
            pipeline: PipelineConfig {
                state_dir: env::var("PIPELINE_STATE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.pipeline.state_dir),
                output_dir: env::var("PIPELINE_OUTPUT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.pipeline.output_dir),
                max_parallel_files: parsed(
                    "PIPELINE_MAX_PARALLEL_FILES",
                    defaults.pipeline.max_parallel_files,
                )?,
                recipient_public_key: required("RECIPIENT_PUBLIC_KEY_PATH")?.into(),
                submission_descriptor: env::var("SUBMISSION_DESCRIPTOR").ok().map(PathBuf::from),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            author: AuthorConfig {
                name: required("AUTHOR_NAME")?,
                private_key_path: required("AUTHOR_PRIVATE_KEY_PATH")?.into(),
                register_key: parsed("AUTHOR_REGISTER_KEY", defaults.author.register_key)?,
            },
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::Missing(var))
}

fn parsed<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}
