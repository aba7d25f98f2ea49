use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::browser::BrowserRender;
use crate::fetch::PlainFetch;
use crate::types::{TestOutcome, WorkItem};

/// Which way items are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Single HTTP request per item.
    Plain,
    /// Headless browser per item, with a screenshot.
    Browser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub timeout: Duration,
}

impl ExecuteOptions {
    pub fn from_secs(secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(secs),
        }
    }
}

/// Fetches one work item and reports how it went.
///
/// `execute` never fails: transport, navigation and capture problems all come
/// back as a `TestOutcome::Failure` (or a failed screenshot on a success).
pub enum Strategy {
    PlainFetch(PlainFetch),
    BrowserRender(BrowserRender),
}

impl Strategy {
    pub async fn execute(&self, item: &WorkItem, opts: &ExecuteOptions) -> TestOutcome {
        match self {
            Strategy::PlainFetch(s) => s.execute(item, opts).await,
            Strategy::BrowserRender(s) => s.execute(item, opts).await,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        match self {
            Strategy::PlainFetch(_) => ExecutionMode::Plain,
            Strategy::BrowserRender(_) => ExecutionMode::Browser,
        }
    }
}

impl From<PlainFetch> for Strategy {
    fn from(s: PlainFetch) -> Self {
        Strategy::PlainFetch(s)
    }
}

impl From<BrowserRender> for Strategy {
    fn from(s: BrowserRender) -> Self {
        Strategy::BrowserRender(s)
    }
}

/// Render an error with its full source chain on one line.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let msg = cause.to_string();
        if !out.contains(&msg) {
            out.push_str(": ");
            out.push_str(&msg);
        }
        source = cause.source();
    }
    out
}
