//! Store clients for the plant pipeline: HTTP fetch, object storage, the
//! short-term fact store and the run lock.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

mod facts;
mod lock;
mod objects;

pub use facts::{FactStore, FactStoreError, MemoryFactStore, PgFactStore};
pub use lock::{LockError, RunLease, RunLockDir};
pub use objects::{FsObjectStore, MemoryObjectStore, ObjectStore, ObjectStoreError};

pub const CRATE_NAME: &str = "plantwatch-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash-addressed object key: `{prefix}/{YYYYmmdd_HHMMSS}/{sha256}.{ext}`.
pub fn content_addressed_key(
    prefix: &str,
    stored_at: DateTime<Utc>,
    bytes: &[u8],
    extension: &str,
) -> String {
    let stamp = stored_at.format("%Y%m%d_%H%M%S").to_string();
    let ext = extension.trim_start_matches('.').trim();
    let ext = if ext.is_empty() { "bin" } else { ext };
    format!(
        "{}/{}/{}.{}",
        prefix.trim_end_matches('/'),
        stamp,
        sha256_hex(bytes),
        ext
    )
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid json: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

/// Single-shot JSON fetcher. Every failure, timeouts included, is returned to
/// the caller untouched; there is no retry loop.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GET `url` and decode the body as JSON whatever the status code, since
    /// the plant API reports lookups as JSON error bodies.
    pub async fn fetch_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(url, err))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|err| FetchError::from_reqwest(url, err))?;
        debug!(url, status = status.as_u16(), bytes = body.len(), "fetched");

        match serde_json::from_slice(&body) {
            Ok(value) => Ok(value),
            Err(_) if !status.is_success() => Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
            Err(source) => Err(FetchError::InvalidJson {
                url: url.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn content_addressed_keys_are_stamped_and_hashed() {
        let at = Utc.with_ymd_and_hms(2025, 6, 5, 14, 30, 0).single().unwrap();
        let key = content_addressed_key("raw_readings/", at, b"hello world", ".json");
        assert_eq!(
            key,
            "raw_readings/20250605_143000/b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9.json"
        );
    }

    #[tokio::test]
    async fn error_bodies_are_decoded_even_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/plants/9"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(serde_json::json!({"error": "plant not found"})),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let value = fetcher
            .fetch_json(&format!("{}/plants/9", server.uri()))
            .await
            .unwrap();
        assert_eq!(value["error"], "plant not found");
    }

    #[tokio::test]
    async fn non_json_error_pages_surface_the_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher.fetch_json(&server.uri()).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 502, .. }));
    }

    #[tokio::test]
    async fn slow_responses_become_timeouts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"plant_id": 1}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(50),
            user_agent: Some("plantwatch-test".into()),
        })
        .unwrap();
        let err = fetcher.fetch_json(&server.uri()).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }), "got {err:?}");
    }
}
