//! Outbound client for origin fetches
//!
//! One pooled client shared by all requests. Bodies are fully buffered and
//! returned still encoded; the transform pipeline does its own decompression.

use crate::config::UpstreamConfig;
use hyper::body::Bytes;
use hyper::{HeaderMap, Method, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to build origin client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("invalid origin proxy {url}: {source}")]
    Proxy {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid origin url {0}")]
    InvalidUrl(String),
    #[error("origin request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to read origin body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Counters for origin traffic
#[derive(Debug, Default)]
pub struct UpstreamStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl UpstreamStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn get_bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// Client settings derived from `[upstream]`
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
    pub proxy: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
            proxy: None,
        }
    }
}

impl From<&UpstreamConfig> for ClientConfig {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: config.pool_idle_timeout(),
            request_timeout: config.request_timeout(),
            proxy: config.proxy_url().map(str::to_string),
        }
    }
}

/// A fully prepared outbound request
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Buffered origin response, body still content-encoded
#[derive(Debug, Clone)]
pub struct OriginReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct OriginClient {
    client: reqwest::Client,
    stats: Arc<UpstreamStats>,
}

impl OriginClient {
    pub fn new(config: ClientConfig) -> Result<Self, UpstreamError> {
        // origins are commonly served with self-signed or mismatched certificates
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .timeout(config.request_timeout)
            .tcp_nodelay(true);

        if let Some(url) = &config.proxy {
            let proxy = reqwest::Proxy::all(url.as_str()).map_err(|source| UpstreamError::Proxy {
                url: url.clone(),
                source,
            })?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        let client = builder.build().map_err(UpstreamError::Build)?;

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            timeout_secs = config.request_timeout.as_secs(),
            proxy = config.proxy.as_deref().unwrap_or("none"),
            "Origin client initialized"
        );

        Ok(Self {
            client,
            stats: Arc::new(UpstreamStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<UpstreamStats> {
        Arc::clone(&self.stats)
    }

    /// Send the request and buffer the whole response
    pub async fn fetch(&self, request: OriginRequest) -> Result<OriginReply, UpstreamError> {
        self.stats.record_request();

        let url = reqwest::Url::parse(&request.url)
            .map_err(|_| UpstreamError::InvalidUrl(request.url.clone()))?;

        let response = self
            .client
            .request(request.method, url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|source| {
                self.stats.record_failure();
                UpstreamError::Request {
                    url: request.url.clone(),
                    source,
                }
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|source| {
            self.stats.record_failure();
            UpstreamError::Body {
                url: request.url.clone(),
                source,
            }
        })?;
        self.stats.record_bytes(body.len());

        debug!(url = %request.url, status = status.as_u16(), bytes = body.len(), "Origin responded");

        Ok(OriginReply { status, headers, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats() {
        let stats = UpstreamStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_failure();
        stats.record_bytes(512);

        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
        assert_eq!(stats.get_bytes_received(), 512);
    }

    #[test]
    fn test_client_config_from_upstream() {
        let upstream = UpstreamConfig {
            web_proxy: "http://127.0.0.1:3128".to_string(),
            request_timeout_secs: 5,
            pool_max_idle_per_host: 3,
            pool_idle_timeout_secs: 20,
            ..Default::default()
        };
        let config = ClientConfig::from(&upstream);
        assert_eq!(config.max_idle_per_host, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(20));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.proxy.as_deref(), Some("http://127.0.0.1:3128"));

        let config = ClientConfig::from(&UpstreamConfig::default());
        assert!(config.proxy.is_none());
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let client = OriginClient::new(ClientConfig::default()).unwrap();
        let err = client
            .fetch(OriginRequest {
                method: Method::GET,
                url: "not a url".to_string(),
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::InvalidUrl(_)));
        assert_eq!(client.stats().get_total_requests(), 1);
    }

    #[tokio::test]
    async fn test_connection_refused_is_request_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = OriginClient::new(ClientConfig {
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        let err = client
            .fetch(OriginRequest {
                method: Method::GET,
                url: format!("http://{}/", addr),
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Request { .. }));
        assert_eq!(client.stats().get_failed_requests(), 1);
    }
}
