//! The fetch primitive the orchestrator delegates to
//!
//! [`BaseProxy`] is the seam between orchestration and the engine that actually
//! retrieves (and possibly rewrites) remote content. [`HttpProxy`] is a plain
//! `reqwest` implementation that forwards the request to its absolute URL.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, ClientBuilder, Method};
use slipstream_cache::{Headers, Response, request_key};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::{FetchError, Result};

/// Request headers that must not be forwarded upstream
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Fetch priority passed through to the underlying engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityHint {
    High,
    Auto,
}

/// Per-call options for [`BaseProxy::fetch`]
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Fires when the call should be abandoned
    pub cancel: CancellationToken,
    pub priority: PriorityHint,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            priority: PriorityHint::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    /// Absolute URL
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
    /// Top-level page navigation rather than a sub-resource
    pub navigate: bool,
}

impl ProxyRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Headers::new(),
            body: Bytes::new(),
            navigate: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    /// GET issued as a page navigation
    pub fn navigation(url: impl Into<String>) -> Self {
        Self {
            navigate: true,
            ..Self::get(url)
        }
    }

    /// Cache identity of this request
    pub fn cache_key(&self) -> String {
        request_key(&self.method, &self.url)
    }
}

#[async_trait]
pub trait BaseProxy: Send + Sync {
    /// Performs one fetch. Non-2xx statuses are responses, not errors.
    async fn fetch(&self, request: &ProxyRequest, options: FetchOptions) -> Result<Response>;
}

/// Forwards requests with a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpProxy {
    client: Client,
}

impl HttpProxy {
    pub fn new() -> Result<Self> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            // Total time is bounded by the caller's cancellation token
            .connect_timeout(Duration::from_secs(30))
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(60))
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("slipstream/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn build(&self, request: &ProxyRequest) -> Result<reqwest::RequestBuilder> {
        let url = Url::parse(&request.url)
            .map_err(|e| FetchError::InvalidRequest(format!("{}: {e}", request.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidRequest(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in request.headers.iter() {
            if !HOP_BY_HOP.contains(&name) {
                builder = builder.header(name, value);
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        Ok(builder)
    }

    async fn send(&self, request: &ProxyRequest) -> Result<Response> {
        let upstream = self.build(request)?.send().await?;

        let status = upstream.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in upstream.headers() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                headers.append(name.as_str(), value);
            }
        }
        let body = upstream.bytes().await?;

        debug!("{} {} -> {status} ({} bytes)", request.method, request.url, body.len());
        Ok(Response::new(status, headers, body))
    }
}

#[async_trait]
impl BaseProxy for HttpProxy {
    async fn fetch(&self, request: &ProxyRequest, options: FetchOptions) -> Result<Response> {
        tokio::select! {
            () = options.cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.send(request) => result,
        }
    }
}
