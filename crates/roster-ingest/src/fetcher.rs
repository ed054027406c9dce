//! Blob retrieval
//!
//! A [`ContentFetcher`] turns a notification's blob path into raw bytes.
//! Every failure is a [`FetchError`], which the pipeline treats as transient:
//! there is no local retry, redelivery by the transport is the retry.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::config::{HttpConfig, LocalConfig, S3Config, SourceConfig};
use crate::error::FetchError;
use crate::types::FileReference;

/// Per-request timeout for HTTP blob downloads
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, file: &FileReference) -> Result<Vec<u8>, FetchError>;
}

/// Build the fetcher selected by configuration
pub async fn from_config(source: &SourceConfig) -> anyhow::Result<Arc<dyn ContentFetcher>> {
    let fetcher: Arc<dyn ContentFetcher> = match source {
        SourceConfig::S3(config) => Arc::new(S3Fetcher::new(config).await),
        SourceConfig::Http(config) => Arc::new(HttpFetcher::new(config)?),
        SourceConfig::Local(config) => Arc::new(LocalFetcher::new(config)),
    };
    Ok(fetcher)
}

// ============================================================================
// S3
// ============================================================================

#[derive(Clone)]
pub struct S3Fetcher {
    client: Client,
    bucket: String,
}

impl S3Fetcher {
    pub async fn new(config: &S3Config) -> Self {
        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "roster-ingest");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        tracing::info!(bucket = %config.bucket, "S3 fetcher initialized");

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ContentFetcher for S3Fetcher {
    async fn fetch(&self, file: &FileReference) -> Result<Vec<u8>, FetchError> {
        let key = file.as_str();
        debug!("Downloading s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    FetchError::NotFound(key.to_string())
                } else {
                    FetchError::unavailable(key, DisplayErrorContext(&err))
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|err| FetchError::unavailable(key, err))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);

        Ok(data)
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// GETs `{base_url}/{path}?{query}`
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    query: Option<String>,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("roster-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            query: config
                .query
                .as_ref()
                .map(|q| q.trim_start_matches('?').to_string())
                .filter(|q| !q.is_empty()),
        })
    }

    fn url_for(&self, file: &FileReference) -> String {
        let path = file.as_str().trim_start_matches('/');
        match &self.query {
            Some(query) => format!("{}/{}?{}", self.base_url, path, query),
            None => format!("{}/{}", self.base_url, path),
        }
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, file: &FileReference) -> Result<Vec<u8>, FetchError> {
        let path = file.as_str();
        debug!(file = %file, "Downloading over HTTP");

        let response = self
            .client
            .get(self.url_for(file))
            .send()
            .await
            .map_err(|err| FetchError::unavailable(path, err))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::unavailable(path, format!("HTTP {}", status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| FetchError::unavailable(path, err))?;

        Ok(bytes.to_vec())
    }
}

// ============================================================================
// Local filesystem
// ============================================================================

/// Reads blobs from a directory; paths may not leave it
#[derive(Debug, Clone)]
pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    pub fn new(config: &LocalConfig) -> Self {
        Self {
            root: config.root.clone(),
        }
    }

    fn resolve(&self, file: &FileReference) -> Result<PathBuf, FetchError> {
        let relative = Path::new(file.as_str());
        let mut resolved = self.root.clone();

        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {},
                _ => {
                    return Err(FetchError::unavailable(
                        file.as_str(),
                        "path escapes the local root",
                    ))
                },
            }
        }

        Ok(resolved)
    }
}

#[async_trait]
impl ContentFetcher for LocalFetcher {
    async fn fetch(&self, file: &FileReference) -> Result<Vec<u8>, FetchError> {
        let path = self.resolve(file)?;

        tokio::fs::read(&path).await.map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => FetchError::NotFound(file.as_str().to_string()),
            _ => FetchError::unavailable(file.as_str(), err),
        })
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Blob map for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, data: impl Into<Vec<u8>>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(path.into(), data.into());
        }
    }

    pub fn remove(&self, path: &str) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.remove(path);
        }
    }
}

#[async_trait]
impl ContentFetcher for MemoryFetcher {
    async fn fetch(&self, file: &FileReference) -> Result<Vec<u8>, FetchError> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| FetchError::unavailable(file.as_str(), "blob map lock poisoned"))?;

        blobs
            .get(file.as_str())
            .cloned()
            .ok_or_else(|| FetchError::NotFound(file.as_str().to_string()))
    }
}
