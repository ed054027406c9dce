//! Configuration management
//!
//! Built once at startup from the environment and passed down explicitly.
//! Nothing below `main` reads environment variables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::registry::{RegistryError, SchemaRegistry};

// ============================================================================
// Database Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/roster";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Blob Source Defaults
// ============================================================================

pub const DEFAULT_INGEST_SOURCE: &str = "s3";

pub const DEFAULT_S3_REGION: &str = "us-east-1";

pub const DEFAULT_S3_BUCKET: &str = "roster-landing";

// ============================================================================
// Worker Defaults
// ============================================================================

/// Parallel ingestions per worker process.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// Delay between polls when the queue is empty.
pub const DEFAULT_WORKER_POLL_INTERVAL_MS: u64 = 1_000;

/// How long a claimed notification stays invisible to other workers.
pub const DEFAULT_WORKER_VISIBILITY_TIMEOUT_SECS: u64 = 300;

/// Deliveries of one notification before it is dead-lettered.
pub const DEFAULT_WORKER_MAX_ATTEMPTS: i32 = 5;

/// Upper bound on a single `ingest` call.
pub const DEFAULT_INGEST_TIMEOUT_SECS: u64 = 120;

/// Grace period for in-flight ingestions on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Age after which an unreleased reservation is treated as absent.
pub const DEFAULT_DEDUP_RESERVATION_TTL_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    pub worker: WorkerConfig,
    pub dedup: DedupConfig,
    pub registry: RegistryConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Where blob bytes are fetched from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    S3(S3Config),
    Http(HttpConfig),
    Local(LocalConfig),
}

/// S3 (or S3-compatible) bucket holding the landing files.
///
/// Without explicit keys the default AWS credential chain is used.
#[derive(Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("path_style", &self.path_style)
            .finish()
    }
}

/// Blob container reachable over plain HTTP GET
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub base_url: String,
    /// Appended to every request, e.g. a SAS token
    #[serde(skip_serializing)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub visibility_timeout_secs: u64,
    pub max_attempts: i32,
    pub ingest_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            poll_interval_ms: DEFAULT_WORKER_POLL_INTERVAL_MS,
            visibility_timeout_secs: DEFAULT_WORKER_VISIBILITY_TIMEOUT_SECS,
            max_attempts: DEFAULT_WORKER_MAX_ATTEMPTS,
            ingest_timeout_secs: DEFAULT_INGEST_TIMEOUT_SECS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub reservation_ttl_secs: u64,
}

impl DedupConfig {
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// TOML registry; the built-in contracts are used when unset
    pub schema_file: Option<PathBuf>,
}

impl RegistryConfig {
    pub fn load(&self) -> Result<SchemaRegistry, RegistryError> {
        match &self.schema_file {
            Some(path) => SchemaRegistry::from_file(path),
            None => Ok(SchemaRegistry::builtin()),
        }
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `load` passes the environment
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let source = match var("INGEST_SOURCE")
            .unwrap_or_else(|| DEFAULT_INGEST_SOURCE.to_string())
            .to_lowercase()
            .as_str()
        {
            "s3" => SourceConfig::S3(S3Config {
                endpoint: var("S3_ENDPOINT"),
                region: var("S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                bucket: var("S3_BUCKET").unwrap_or_else(|| DEFAULT_S3_BUCKET.to_string()),
                access_key: var("S3_ACCESS_KEY"),
                secret_key: var("S3_SECRET_KEY"),
                path_style: parse_or(&var, "S3_PATH_STYLE", false)?,
            }),
            "http" => SourceConfig::Http(HttpConfig {
                base_url: var("HTTP_BASE_URL").unwrap_or_default(),
                query: var("HTTP_QUERY"),
            }),
            "local" => SourceConfig::Local(LocalConfig {
                root: var("LOCAL_ROOT").map(PathBuf::from).unwrap_or_default(),
            }),
            other => anyhow::bail!("Unknown INGEST_SOURCE '{}' (expected s3, http or local)", other),
        };

        let config = Config {
            database: DatabaseConfig {
                url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: parse_or(
                    &var,
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                )?,
                min_connections: parse_or(
                    &var,
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                )?,
                connect_timeout_secs: parse_or(
                    &var,
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
            },
            source,
            worker: WorkerConfig {
                concurrency: parse_or(&var, "WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY)?,
                poll_interval_ms: parse_or(
                    &var,
                    "WORKER_POLL_INTERVAL_MS",
                    DEFAULT_WORKER_POLL_INTERVAL_MS,
                )?,
                visibility_timeout_secs: parse_or(
                    &var,
                    "WORKER_VISIBILITY_TIMEOUT_SECS",
                    DEFAULT_WORKER_VISIBILITY_TIMEOUT_SECS,
                )?,
                max_attempts: parse_or(&var, "WORKER_MAX_ATTEMPTS", DEFAULT_WORKER_MAX_ATTEMPTS)?,
                ingest_timeout_secs: parse_or(
                    &var,
                    "INGEST_TIMEOUT_SECS",
                    DEFAULT_INGEST_TIMEOUT_SECS,
                )?,
                shutdown_timeout_secs: parse_or(
                    &var,
                    "SHUTDOWN_TIMEOUT_SECS",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                )?,
            },
            dedup: DedupConfig {
                reservation_ttl_secs: parse_or(
                    &var,
                    "DEDUP_RESERVATION_TTL_SECS",
                    DEFAULT_DEDUP_RESERVATION_TTL_SECS,
                )?,
            },
            registry: RegistryConfig {
                schema_file: var("SCHEMA_FILE").map(PathBuf::from),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        match &self.source {
            SourceConfig::S3(s3) => {
                if s3.bucket.is_empty() {
                    anyhow::bail!("S3_BUCKET cannot be empty");
                }
                if s3.access_key.is_some() != s3.secret_key.is_some() {
                    anyhow::bail!("S3_ACCESS_KEY and S3_SECRET_KEY must be set together");
                }
            },
            SourceConfig::Http(http) => {
                let url = reqwest::Url::parse(&http.base_url)
                    .map_err(|e| anyhow::anyhow!("Invalid HTTP_BASE_URL '{}': {}", http.base_url, e))?;
                if !matches!(url.scheme(), "http" | "https") {
                    anyhow::bail!("HTTP_BASE_URL must use http or https");
                }
            },
            SourceConfig::Local(local) => {
                if local.root.as_os_str().is_empty() {
                    anyhow::bail!("LOCAL_ROOT must be set when INGEST_SOURCE=local");
                }
            },
        }

        let worker = &self.worker;
        if worker.concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be greater than 0");
        }
        if worker.max_attempts < 1 {
            anyhow::bail!("WORKER_MAX_ATTEMPTS must be at least 1");
        }
        if worker.ingest_timeout_secs == 0 {
            anyhow::bail!("INGEST_TIMEOUT_SECS must be greater than 0");
        }
        if worker.visibility_timeout_secs <= worker.ingest_timeout_secs {
            anyhow::bail!(
                "WORKER_VISIBILITY_TIMEOUT_SECS ({}) must exceed INGEST_TIMEOUT_SECS ({})",
                worker.visibility_timeout_secs,
                worker.ingest_timeout_secs
            );
        }

        // A live attempt must never lose its reservation to expiry.
        if self.dedup.reservation_ttl_secs <= worker.ingest_timeout_secs {
            anyhow::bail!(
                "DEDUP_RESERVATION_TTL_SECS ({}) must exceed INGEST_TIMEOUT_SECS ({})",
                self.dedup.reservation_ttl_secs,
                worker.ingest_timeout_secs
            );
        }

        if worker.concurrency as u32 > self.database.max_connections {
            tracing::warn!(
                concurrency = worker.concurrency,
                max_connections = self.database.max_connections,
                "Worker concurrency exceeds the connection pool size; ingestions will queue on the pool"
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            source: SourceConfig::S3(S3Config {
                endpoint: None,
                region: DEFAULT_S3_REGION.to_string(),
                bucket: DEFAULT_S3_BUCKET.to_string(),
                access_key: None,
                secret_key: None,
                path_style: false,
            }),
            worker: WorkerConfig::default(),
            dedup: DedupConfig {
                reservation_ttl_secs: DEFAULT_DEDUP_RESERVATION_TTL_SECS,
            },
            registry: RegistryConfig::default(),
        }
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", key, raw, e)),
        None => Ok(default),
    }
}
