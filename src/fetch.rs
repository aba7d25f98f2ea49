//! Plain HTTP fetch strategy.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::blobstore::{BlobStore, HTML_CONTENT_TYPE};
use crate::strategy::{error_chain, ExecuteOptions};
use crate::types::{now_rfc3339, ProxyTarget, RequestSpec, TestOutcome, WorkItem};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timeout after {secs}s: {detail}")]
    Timeout { secs: f64, detail: String },
    #[error("invalid proxy: {0}")]
    InvalidProxy(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to store response body: {0}")]
    Storage(String),
}

impl FetchError {
    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        let detail = error_chain(&err);
        if err.is_timeout() {
            FetchError::Timeout {
                secs: timeout.as_secs_f64(),
                detail,
            }
        } else if err.is_builder() {
            FetchError::InvalidRequest(detail)
        } else {
            FetchError::Transport(detail)
        }
    }
}

/// Fetches each item with one HTTP request through its proxy.
///
/// A fresh client is built per item so proxy settings and connection pools
/// never leak between items.
pub struct PlainFetch {
    store: Arc<dyn BlobStore>,
}

impl PlainFetch {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn execute(&self, item: &WorkItem, opts: &ExecuteOptions) -> TestOutcome {
        info!(url = %item.url(), proxy = %item.proxy.label, "testing with plain HTTP request");
        match self.fetch(item, opts).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(url = %item.url(), proxy = %item.proxy.label, error = %e, "plain fetch failed");
                TestOutcome::failure(item, e.to_string())
            }
        }
    }

    async fn fetch(&self, item: &WorkItem, opts: &ExecuteOptions) -> Result<TestOutcome, FetchError> {
        let client = build_client(&item.proxy, opts.timeout)?;
        let method = parse_method(&item.request.method)?;
        let headers = header_map(&item.request)?;

        let started = Instant::now();
        let response = client
            .request(method, &item.request.url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(e, opts.timeout))?;
        let status_code = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(e, opts.timeout))?;
        let duration_secs = started.elapsed().as_secs_f64();

        let stored_type = if content_type.is_empty() {
            HTML_CONTENT_TYPE
        } else {
            content_type.as_str()
        };
        let content = self
            .store
            .put(body.to_vec(), stored_type)
            .await
            .map_err(|e| FetchError::Storage(format!("{e:#}")))?;

        Ok(TestOutcome::Success {
            url: item.request.url.clone(),
            proxy_label: item.proxy.label.clone(),
            status_code,
            content_type,
            duration_secs,
            content,
            screenshot: None,
            finished_at: now_rfc3339(),
        })
    }
}

/// Proxy setting for the transport. The direct target maps to `None` and is
/// never turned into a proxy.
pub fn proxy_for(target: &ProxyTarget) -> Result<Option<reqwest::Proxy>, FetchError> {
    target
        .proxy_url()
        .map(|url| reqwest::Proxy::all(url).map_err(|e| FetchError::InvalidProxy(error_chain(&e))))
        .transpose()
}

fn build_client(target: &ProxyTarget, timeout: Duration) -> Result<reqwest::Client, FetchError> {
    let builder = reqwest::Client::builder().timeout(timeout);
    let builder = match proxy_for(target)? {
        Some(proxy) => builder.proxy(proxy),
        // also ignores HTTP_PROXY and friends from the environment
        None => builder.no_proxy(),
    };
    builder
        .build()
        .map_err(|e| FetchError::Transport(error_chain(&e)))
}

fn parse_method(method: &str) -> Result<Method, FetchError> {
    Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| FetchError::InvalidRequest(format!("invalid HTTP method {method:?}")))
}

fn header_map(request: &RequestSpec) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::with_capacity(request.headers.len());
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| FetchError::InvalidRequest(format!("invalid header name {name:?}")))?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            FetchError::InvalidRequest(format!("invalid value for header {name}"))
        })?;
        map.append(name, value);
    }
    Ok(map)
}
