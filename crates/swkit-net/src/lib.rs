//! # swkit net
//!
//! Remote fetch of service worker scripts.
//!
//! The lifecycle coordinator only needs two things from the network: the
//! bytes of a script (`GET`) and, occasionally, its `Last-Modified` stamp
//! (`HEAD`). Both go through the [`RemoteFetch`] trait so hosts and tests can
//! swap in their own transport; [`HttpFetcher`] is the reqwest-backed default.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

/// Errors that can occur while fetching.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Unexpected status {status} for {url}")]
    BadStatus { url: Url, status: StatusCode },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// A fetched response, fully buffered.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchedResource {
    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Parse the `Last-Modified` header, if present and well-formed.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        let raw = self.headers.get(http::header::LAST_MODIFIED)?.to_str().ok()?;
        parse_http_date(raw)
    }
}

/// Parse an HTTP-date (`Wed, 21 Oct 2015 07:28:00 GMT`).
pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// The network surface the service worker core depends on.
#[async_trait]
pub trait RemoteFetch: Send + Sync {
    /// `GET` a URL and buffer the body.
    async fn get(&self, url: &Url) -> Result<FetchedResource, NetError>;

    /// `HEAD` a URL; the body is empty.
    async fn head(&self, url: &Url) -> Result<FetchedResource, NetError>;
}

/// Loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("swkit/{}", env!("CARGO_PKG_VERSION")),
            timeout_ms: 30_000,
            max_redirects: 10,
        }
    }
}

impl LoaderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// reqwest-backed [`RemoteFetch`].
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    async fn send(&self, method: Method, url: &Url) -> Result<FetchedResource, NetError> {
        debug!(url = %url, method = %method, "Fetching");

        let response = self
            .client
            .request(method, url.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NetError::Timeout(self.config.timeout())
                } else {
                    NetError::HttpError(e)
                }
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %final_url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(FetchedResource {
            url: final_url,
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl RemoteFetch for HttpFetcher {
    async fn get(&self, url: &Url) -> Result<FetchedResource, NetError> {
        self.send(Method::GET, url).await
    }

    async fn head(&self, url: &Url) -> Result<FetchedResource, NetError> {
        self.send(Method::HEAD, url).await
    }
}
