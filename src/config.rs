//! Command line, JSON input file and the validated run configuration.
//!
//! The input file uses the same shape as the hosted actor input:
//!
//! ```json
//! {
//!   "testUrls": [{ "url": "https://example.com", "method": "GET" }],
//!   "plainHttpRequest": true,
//!   "proxy": { "useApifyProxy": true, "apifyProxyGroups": ["SHADER"], "timeoutSecs": 30 }
//! }
//! ```
//!
//! Command line flags extend or override the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::proxy::{
    PlatformProxy, ProxyConfigError, ProxyMode, DEFAULT_PLATFORM_PROXY_HOST,
    DEFAULT_PLATFORM_PROXY_PORT,
};
use crate::render::REFRESH_INTERVAL_SECS;
use crate::runner::clamp_concurrency;
use crate::strategy::ExecutionMode;
use crate::types::RequestSpec;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
/// Memory one concurrent item is budgeted for when deriving concurrency.
pub const MBYTES_PER_ITEM: u64 = 1024;

/// proxy-probe-rs: check that proxies can fetch a list of URLs, with a live results page.
#[derive(Debug, Clone, Parser)]
#[command(name = "proxy-probe-rs", version, about, long_about = None)]
pub struct Cli {
    /// JSON input file with target URLs and proxy settings.
    #[arg(long, env = "PROBE_INPUT")]
    pub input: Option<PathBuf>,

    /// Target URL fetched with GET (repeatable).
    #[arg(long = "url")]
    pub urls: Vec<String>,

    /// How to fetch: a plain HTTP request or a headless browser.
    #[arg(long, value_enum)]
    pub mode: Option<ExecutionMode>,

    /// Explicit proxy endpoint URL (repeatable).
    #[arg(long = "proxy-url")]
    pub proxy_urls: Vec<String>,

    /// Route through the platform proxy (automatic group unless --proxy-group is given).
    #[arg(long, default_value_t = false)]
    pub platform_proxy: bool,

    /// Platform proxy group to test (repeatable, implies --platform-proxy).
    #[arg(long = "proxy-group")]
    pub proxy_groups: Vec<String>,

    #[arg(long, env = "PROXY_PASSWORD", hide_env_values = true)]
    pub platform_proxy_password: Option<String>,

    #[arg(long, env = "PROXY_HOSTNAME", default_value = DEFAULT_PLATFORM_PROXY_HOST)]
    pub platform_proxy_host: String,

    #[arg(long, env = "PROXY_PORT", default_value_t = DEFAULT_PLATFORM_PROXY_PORT)]
    pub platform_proxy_port: u16,

    /// Per-request timeout in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Max items tested at once. Values below 1 are raised to 1.
    #[arg(long, allow_negative_numbers = true)]
    pub concurrency: Option<i64>,

    /// Memory budget used to derive concurrency when --concurrency is absent.
    #[arg(long, env = "MEMORY_MBYTES")]
    pub memory_mbytes: Option<u64>,

    /// Serve the live results page while the run is in progress.
    #[arg(long = "serve-ui", default_value_t = false)]
    pub serve_ui: bool,

    /// Address of the live results server.
    #[arg(long, env = "PROBE_BIND", default_value = DEFAULT_BIND)]
    pub bind: String,

    /// Externally reachable base URL of the live server, used in artifact links.
    #[arg(long, env = "PROBE_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Where to write the final results page.
    #[arg(long, default_value = "OUTPUT.html")]
    pub output: PathBuf,

    /// Also write the final snapshot as pretty JSON.
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    /// Directory for fetched bodies and screenshots [default: `<output stem>_files` next to --output].
    #[arg(long)]
    pub blob_dir: Option<PathBuf>,

    /// Seconds to keep serving after the run so open pages pick up the final state.
    #[arg(long)]
    pub linger_secs: Option<u64>,

    /// Chrome/Chromium executable for browser mode (searched on PATH when absent).
    #[arg(long, env = "CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFile {
    #[serde(default)]
    pub test_urls: Vec<RequestSpec>,
    #[serde(default)]
    pub plain_http_request: Option<bool>,
    #[serde(default)]
    pub proxy: InputProxy,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputProxy {
    #[serde(default)]
    pub use_apify_proxy: bool,
    #[serde(default)]
    pub apify_proxy_groups: Vec<String>,
    #[serde(default)]
    pub proxy_urls: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl InputFile {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("invalid input JSON")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read input file: {}", path.as_ref().display()))?;
        Self::from_json(&content)
    }
}

/// Problems that stop a run before any item is scheduled.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no target URLs configured")]
    NoTargets,
    #[error("invalid target URL {url:?}: {reason}")]
    InvalidTargetUrl { url: String, reason: String },
    #[error("invalid HTTP method {method:?} for {url}")]
    InvalidMethod { url: String, method: String },
    #[error(transparent)]
    Proxy(#[from] ProxyConfigError),
    #[error("browser mode needs Chrome or Chromium; pass --chrome-path or set CHROME_PATH")]
    BrowserNotFound,
}

/// Everything a run needs, validated.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub requests: Vec<RequestSpec>,
    pub mode: ExecutionMode,
    pub proxy_mode: ProxyMode,
    pub platform: PlatformProxy,
    pub timeout: Duration,
    pub concurrency: usize,
    pub serve_ui: bool,
    pub bind: String,
    pub public_url: String,
    pub output: PathBuf,
    pub json_output: Option<PathBuf>,
    pub blob_dir: PathBuf,
    pub linger: Duration,
    pub chrome_path: Option<PathBuf>,
}

/// Concurrency from an explicit value, else from a memory budget, else 1.
/// The result is always at least 1.
pub fn derive_concurrency(explicit: Option<i64>, memory_mbytes: Option<u64>) -> usize {
    let raw = match (explicit, memory_mbytes) {
        (Some(n), _) => n.max(0) as usize,
        (None, Some(mb)) => ((mb as f64) / (MBYTES_PER_ITEM as f64)).round() as usize,
        (None, None) => 1,
    };
    clamp_concurrency(raw)
}

impl RunConfig {
    /// Merge the CLI with an already-loaded input file and validate.
    pub fn resolve(cli: &Cli, input: InputFile) -> Result<Self, ConfigError> {
        let mut requests = input.test_urls;
        requests.extend(cli.urls.iter().map(RequestSpec::get));
        if requests.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        for req in &mut requests {
            validate_request(req)?;
        }

        let mode = match (cli.mode, input.plain_http_request) {
            (Some(m), _) => m,
            (None, Some(true)) => ExecutionMode::Plain,
            (None, Some(false)) => ExecutionMode::Browser,
            (None, None) => ExecutionMode::Plain,
        };

        let mut proxy_urls = input.proxy.proxy_urls;
        proxy_urls.extend(cli.proxy_urls.iter().cloned());
        let mut groups = input.proxy.apify_proxy_groups;
        groups.extend(cli.proxy_groups.iter().cloned());
        let platform_requested = input.proxy.use_apify_proxy || cli.platform_proxy || !cli.proxy_groups.is_empty();
        let proxy_mode = if !proxy_urls.is_empty() {
            ProxyMode::Explicit(proxy_urls)
        } else if platform_requested {
            ProxyMode::Platform { groups }
        } else {
            ProxyMode::None
        };

        let platform = PlatformProxy {
            host: cli.platform_proxy_host.clone(),
            port: cli.platform_proxy_port,
            password: cli.platform_proxy_password.clone(),
        };
        // Surface proxy problems here rather than after the server starts.
        crate::proxy::resolve(&proxy_mode, &platform)?;

        let timeout_secs = cli
            .timeout_secs
            .or(input.proxy.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let default_linger = if cli.serve_ui { REFRESH_INTERVAL_SECS * 3 } else { 0 };

        Ok(Self {
            requests,
            mode,
            proxy_mode,
            platform,
            timeout: Duration::from_secs(timeout_secs),
            concurrency: derive_concurrency(cli.concurrency, cli.memory_mbytes),
            serve_ui: cli.serve_ui,
            bind: cli.bind.clone(),
            public_url: cli
                .public_url
                .clone()
                .unwrap_or_else(|| format!("http://{}", cli.bind)),
            output: cli.output.clone(),
            json_output: cli.json_output.clone(),
            blob_dir: cli
                .blob_dir
                .clone()
                .unwrap_or_else(|| default_blob_dir(&cli.output)),
            linger: Duration::from_secs(cli.linger_secs.unwrap_or(default_linger)),
            chrome_path: cli.chrome_path.clone(),
        })
    }

    /// Load the input file named on the command line (if any), then resolve.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let input = match cli.input.as_deref() {
            Some(path) => InputFile::load(path)?,
            None => InputFile::default(),
        };
        Ok(Self::resolve(cli, input)?)
    }
}

/// `OUTPUT.html` keeps its artifacts in `OUTPUT_files/` beside it.
pub fn default_blob_dir(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "OUTPUT".to_string());
    output.with_file_name(format!("{stem}_files"))
}

fn validate_request(req: &mut RequestSpec) -> Result<(), ConfigError> {
    req.url = req.url.trim().to_string();
    let parsed = Url::parse(&req.url).map_err(|e| ConfigError::InvalidTargetUrl {
        url: req.url.clone(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidTargetUrl {
            url: req.url.clone(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    let method = req.method.trim().to_ascii_uppercase();
    match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(m) => {
            req.method = m.as_str().to_string();
            Ok(())
        }
        Err(_) => Err(ConfigError::InvalidMethod {
            url: req.url.clone(),
            method: req.method.clone(),
        }),
    }
}
