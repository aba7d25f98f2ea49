use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use ::time::{format_description::well_known, OffsetDateTime};

/// Display label used for the direct (unproxied) target.
pub const NO_PROXY_LABEL: &str = "No proxy";

/// A proxy endpoint under test, or the direct connection.
///
/// `endpoint == None` is the "no proxy" target. It is a real target that gets
/// its own group of results, not a missing value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub label: String,
    pub endpoint: Option<String>,
}

impl ProxyTarget {
    pub fn direct() -> Self {
        Self {
            label: NO_PROXY_LABEL.to_string(),
            endpoint: None,
        }
    }

    pub fn via(label: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Proxy URL to hand to a transport, `None` for a direct connection.
    pub fn proxy_url(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn is_direct(&self) -> bool {
        self.endpoint.is_none()
    }
}

fn default_method() -> String {
    "GET".to_string()
}

/// One target URL with the request shape used to fetch it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
        }
    }
}

/// A single (proxy, URL) pair to test. `id` keeps duplicate pairs apart.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: Uuid,
    pub request: RequestSpec,
    pub proxy: ProxyTarget,
}

impl WorkItem {
    pub fn new(request: RequestSpec, proxy: ProxyTarget) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            proxy,
        }
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }
}

/// Opaque handle to an artifact held by a blob store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct BlobRef(pub String);

impl BlobRef {
    pub fn key(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a screenshot attempt. Strategies that cannot take screenshots
/// leave the outcome's `screenshot` field empty instead.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Screenshot {
    Captured { blob: BlobRef },
    Failed { error: String },
}

/// Result of testing one work item.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestOutcome {
    Success {
        url: String,
        proxy_label: String,
        status_code: u16,
        content_type: String,
        duration_secs: f64,
        content: BlobRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screenshot: Option<Screenshot>,
        finished_at: String,
    },
    Failure {
        url: String,
        proxy_label: String,
        error: String,
        finished_at: String,
    },
}

impl TestOutcome {
    pub fn failure(item: &WorkItem, error: impl Into<String>) -> Self {
        TestOutcome::Failure {
            url: item.request.url.clone(),
            proxy_label: item.proxy.label.clone(),
            error: error.into(),
            finished_at: now_rfc3339(),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            TestOutcome::Success { url, .. } | TestOutcome::Failure { url, .. } => url,
        }
    }

    pub fn proxy_label(&self) -> &str {
        match self {
            TestOutcome::Success { proxy_label, .. } | TestOutcome::Failure { proxy_label, .. } => {
                proxy_label
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TestOutcome::Success { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            TestOutcome::Failure { error, .. } => Some(error),
            TestOutcome::Success { .. } => None,
        }
    }

    pub fn screenshot(&self) -> Option<&Screenshot> {
        match self {
            TestOutcome::Success { screenshot, .. } => screenshot.as_ref(),
            TestOutcome::Failure { .. } => None,
        }
    }
}

/// All outcomes recorded for one proxy label, in completion order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProxyGroup {
    pub label: String,
    pub outcomes: Vec<TestOutcome>,
}

/// Published view of a run: outcomes grouped by proxy plus progress.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub groups: Vec<ProxyGroup>,
    pub is_running: bool,
    pub total: usize,
    pub completed: usize,
}

impl Snapshot {
    pub fn group(&self, label: &str) -> Option<&ProxyGroup> {
        self.groups.iter().find(|g| g.label == label)
    }

    pub fn outcome_count(&self) -> usize {
        self.groups.iter().map(|g| g.outcomes.len()).sum()
    }
}

pub(crate) fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
