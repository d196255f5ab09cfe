//! Daemon configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::error::{DaemonError, DaemonResult};
use broker_exec::LocalDirUploader;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment (test, development, production)
    pub environment: Environment,

    /// New tasks skip moderation and go straight to the queue
    pub auto_audit: bool,

    /// Ledger HMAC key
    pub jwt_secret: String,

    /// Generation provider credentials
    pub vendor: VendorConfig,

    /// Artifact storage
    pub storage: StorageConfig,

    /// Durable backends; unset means in-memory
    pub backends: BackendConfig,

    /// Worker pool and polling supervisor
    pub worker: WorkerConfig,
}

/// Generation provider configuration.
#[derive(Debug, Clone, Default)]
pub struct VendorConfig {
    /// Bearer token (`JIEKOU_API`)
    pub api_key: String,
    /// Task-result endpoint used when neither input nor model names one
    pub default_query_url: Option<String>,
}

/// Object storage settings.
#[derive(Debug, Clone, Default)]
pub struct OssConfig {
    /// Endpoint URL
    pub endpoint: String,
    /// Bucket
    pub bucket: String,
    /// Region
    pub region: String,
    /// Access key id
    pub access_key: String,
    /// Access key secret
    pub secret: String,
    /// Role assumed for uploads
    pub role_arn: String,
}

/// Where artifacts are re-hosted.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Object storage credentials
    pub oss: OssConfig,
    /// Directory the local uploader writes to
    pub upload_dir: PathBuf,
    /// Public URL prefix of uploaded artifacts
    pub public_base: String,
}

/// Durable backend URLs.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// PostgreSQL (`postgres` feature)
    pub database_url: Option<String>,
    /// Redis (`redis` feature)
    pub redis_url: Option<String>,
    /// Administrator seeded into a fresh database
    pub admin: Option<AdminCredentials>,
}

/// Bootstrap administrator login.
#[derive(Clone, Default)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Worker pool and supervisor settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum tasks executing at once
    pub concurrency: usize,
    /// Supervisor tick
    pub poll_interval: Duration,
    /// Failed polls tolerated per tracked task
    pub poll_retry_budget: u32,
    /// Run time of the built-in simulated executor
    pub simulated_delay: Duration,
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

const DEFAULT_PUBLIC_BASE: &str = "http://localhost:8080/uploads";

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let environment = Self::load_environment()?;
        let auto_audit = Self::load_bool_env("AUTO_AUDIT", false)?;
        let jwt_secret =
            optional_env("JWT_SECRET").unwrap_or_else(|| broker_ledger::DEFAULT_SECRET.to_string());
        let vendor = VendorConfig {
            api_key: optional_env("JIEKOU_API").unwrap_or_default(),
            default_query_url: optional_env("JIEKOU_QUERY_URL"),
        };
        let storage = Self::load_storage_config();
        let backends = BackendConfig {
            database_url: optional_env("DATABASE_URL"),
            redis_url: optional_env("REDIS_URL"),
            admin: optional_env("ADMIN_USERNAME").zip(optional_env("ADMIN_PASSWORD")).map(
                |(username, password)| AdminCredentials { username, password },
            ),
        };
        let worker = Self::load_worker_config()?;

        Ok(Self { environment, auto_audit, jwt_secret, vendor, storage, backends, worker })
    }

    /// Create test configuration.
    pub fn test() -> Self {
        Self {
            environment: Environment::Test,
            auto_audit: true,
            jwt_secret: "test-secret".to_string(),
            vendor: VendorConfig::default(),
            storage: StorageConfig {
                oss: OssConfig::default(),
                upload_dir: env::temp_dir().join("brokerd-test-uploads"),
                public_base: "https://cdn.test".to_string(),
            },
            backends: BackendConfig::default(),
            worker: WorkerConfig {
                concurrency: 4,
                poll_interval: Duration::from_millis(50),
                poll_retry_budget: 5,
                simulated_delay: Duration::from_millis(10),
            },
        }
    }

    fn load_environment() -> DaemonResult<Environment> {
        let env_str = env::var("BROKER_ENV").unwrap_or_else(|_| "development".to_string());

        match env_str.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid BROKER_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }

    fn load_storage_config() -> StorageConfig {
        let oss = OssConfig {
            endpoint: optional_env("OSS_ENDPOINT").unwrap_or_default(),
            bucket: optional_env("OSS_BUCKET").unwrap_or_default(),
            region: optional_env("OSS_REGION").unwrap_or_default(),
            access_key: optional_env("OSS_ACCESS_KEY").unwrap_or_default(),
            secret: optional_env("OSS_SECRET").unwrap_or_default(),
            role_arn: optional_env("OSS_ROLE_ARN").unwrap_or_default(),
        };
        let public_base = optional_env("UPLOAD_PUBLIC_BASE").unwrap_or_else(|| {
            if oss.bucket.is_empty() || oss.endpoint.is_empty() {
                DEFAULT_PUBLIC_BASE.to_string()
            } else {
                LocalDirUploader::bucket_base(&oss.bucket, &oss.endpoint)
            }
        });
        let upload_dir =
            optional_env("UPLOAD_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("uploads"));

        StorageConfig { oss, upload_dir, public_base }
    }

    fn load_worker_config() -> DaemonResult<WorkerConfig> {
        let concurrency = Self::load_parsed_env("WORKER_CONCURRENCY", 16usize)?;
        if concurrency == 0 {
            return Err(DaemonError::Config("Invalid WORKER_CONCURRENCY: 0".to_string()));
        }
        let poll_interval_secs = Self::load_parsed_env("POLL_INTERVAL_SECS", 30u64)?;
        if poll_interval_secs == 0 {
            return Err(DaemonError::Config("Invalid POLL_INTERVAL_SECS: 0".to_string()));
        }

        Ok(WorkerConfig {
            concurrency,
            poll_interval: Duration::from_secs(poll_interval_secs),
            poll_retry_budget: Self::load_parsed_env("POLL_RETRY_BUDGET", 5u32)?,
            simulated_delay: Duration::from_millis(Self::load_parsed_env(
                "SIMULATED_DELAY_MS",
                2000u64,
            )?),
        })
    }

    fn load_parsed_env<T: FromStr>(key: &str, default: T) -> DaemonResult<T> {
        match optional_env(key) {
            Some(val) => val
                .parse::<T>()
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            None => Ok(default),
        }
    }

    fn load_bool_env(key: &str, default: bool) -> DaemonResult<bool> {
        match optional_env(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(DaemonError::Config(format!("Invalid {} value: {}", key, v))),
            },
        }
    }
}

/// A set, non-blank environment variable.
fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            auto_audit: false,
            jwt_secret: broker_ledger::DEFAULT_SECRET.to_string(),
            vendor: VendorConfig::default(),
            storage: StorageConfig {
                oss: OssConfig::default(),
                upload_dir: PathBuf::from("uploads"),
                public_base: DEFAULT_PUBLIC_BASE.to_string(),
            },
            backends: BackendConfig::default(),
            worker: WorkerConfig {
                concurrency: 16,
                poll_interval: Duration::from_secs(30),
                poll_retry_budget: 5,
                simulated_delay: Duration::from_secs(2),
            },
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
