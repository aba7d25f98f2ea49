//! Browser rendering strategy.
//!
//! The strategy talks to the browser through three small capability traits:
//! [`BrowserLauncher`] starts an isolated browser (one per work item),
//! [`BrowserSession`] opens pages in it and [`BrowserPage`] navigates,
//! screenshots and extracts the rendered document. Page and session are
//! always closed before `execute` returns, whatever happened in between.
//!
//! [`ChromeLauncher`] is the shipped driver. It starts headless Chrome or
//! Chromium over the DevTools protocol with a throwaway profile directory.
//! Proxy credentials are answered through DevTools authentication and never
//! appear on the browser command line.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::auth::Credentials;
use chromiumoxide::cdp::browser_protocol::network::{EventResponseReceived, ResourceType};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::{FutureExt, StreamExt};
use tempfile::TempDir;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::blobstore::{BlobStore, HTML_CONTENT_TYPE, PNG_CONTENT_TYPE};
use crate::proxy::{self, ProxyCredentials};
use crate::strategy::ExecuteOptions;
use crate::types::{now_rfc3339, Screenshot, TestOutcome, WorkItem};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("navigation timeout after {secs}s")]
    NavigationTimeout { secs: f64 },
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("failed to store artifact: {0}")]
    Storage(String),
}

/// Main response of a successful navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    pub status: u16,
    pub content_type: String,
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Start a fresh browser instance. `proxy` is `None` for a direct connection.
    async fn launch(&self, proxy: Option<&str>) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

#[async_trait]
pub trait BrowserSession: Send {
    async fn new_page(&mut self) -> Result<Box<dyn BrowserPage>, BrowserError>;
    async fn close(&mut self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserPage: Send {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<Navigation, BrowserError>;
    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError>;
    /// Fully rendered document markup.
    async fn content(&mut self) -> Result<String, BrowserError>;
    async fn close(&mut self) -> Result<(), BrowserError>;
}

pub struct BrowserRender {
    launcher: Arc<dyn BrowserLauncher>,
    store: Arc<dyn BlobStore>,
}

impl BrowserRender {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, store: Arc<dyn BlobStore>) -> Self {
        Self { launcher, store }
    }

    pub async fn execute(&self, item: &WorkItem, opts: &ExecuteOptions) -> TestOutcome {
        info!(url = %item.url(), proxy = %item.proxy.label, "testing with browser");
        match self.render(item, opts).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(url = %item.url(), proxy = %item.proxy.label, error = %e, "browser test failed");
                TestOutcome::failure(item, e.to_string())
            }
        }
    }

    async fn render(&self, item: &WorkItem, opts: &ExecuteOptions) -> Result<TestOutcome, BrowserError> {
        let mut session = self.launcher.launch(item.proxy.proxy_url()).await?;
        let result = AssertUnwindSafe(self.render_in_session(session.as_mut(), item, opts))
            .catch_unwind()
            .await;
        if let Err(e) = session.close().await {
            warn!(url = %item.url(), error = %e, "failed to close browser");
        }
        result.unwrap_or_else(|payload| panic::resume_unwind(payload))
    }

    async fn render_in_session(
        &self,
        session: &mut dyn BrowserSession,
        item: &WorkItem,
        opts: &ExecuteOptions,
    ) -> Result<TestOutcome, BrowserError> {
        let mut page = session.new_page().await?;
        let result = AssertUnwindSafe(self.render_page(page.as_mut(), item, opts))
            .catch_unwind()
            .await;
        if let Err(e) = page.close().await {
            warn!(url = %item.url(), error = %e, "failed to close page");
        }
        result.unwrap_or_else(|payload| panic::resume_unwind(payload))
    }

    async fn render_page(
        &self,
        page: &mut dyn BrowserPage,
        item: &WorkItem,
        opts: &ExecuteOptions,
    ) -> Result<TestOutcome, BrowserError> {
        let started = Instant::now();
        let navigation = page.goto(item.url(), opts.timeout).await;
        let duration_secs = started.elapsed().as_secs_f64();

        // Taken even when navigation failed; a partial render is still useful.
        let screenshot = self.capture_screenshot(page).await;
        let navigation = match navigation {
            Ok(n) => n,
            Err(e) => {
                debug!(url = %item.url(), ?screenshot, "navigation failed, discarding screenshot");
                return Err(e);
            }
        };

        let html = page.content().await?;
        let content = self
            .store
            .put(html.into_bytes(), HTML_CONTENT_TYPE)
            .await
            .map_err(|e| BrowserError::Storage(format!("{e:#}")))?;

        Ok(TestOutcome::Success {
            url: item.request.url.clone(),
            proxy_label: item.proxy.label.clone(),
            status_code: navigation.status,
            content_type: navigation.content_type,
            duration_secs,
            content,
            screenshot: Some(screenshot),
            finished_at: now_rfc3339(),
        })
    }

    /// Never fails: problems end up in `Screenshot::Failed`.
    async fn capture_screenshot(&self, page: &mut dyn BrowserPage) -> Screenshot {
        let bytes = match page.screenshot().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "screenshot failed");
                return Screenshot::Failed {
                    error: e.to_string(),
                };
            }
        };
        match self.store.put(bytes, PNG_CONTENT_TYPE).await {
            Ok(blob) => Screenshot::Captured { blob },
            Err(e) => Screenshot::Failed {
                error: format!("failed to store screenshot: {e:#}"),
            },
        }
    }
}

/// Executable names probed on `PATH` when no browser path is configured.
const CHROME_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

pub const DEFAULT_WINDOW_SIZE: (u32, u32) = (1280, 1024);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for the main document's response event once the load
/// has completed.
const RESPONSE_GRACE: Duration = Duration::from_secs(2);

/// Find a Chrome/Chromium executable on `PATH`.
pub fn find_chrome() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| CHROME_CANDIDATES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Launches headless Chrome per work item with a temporary profile.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    binary: PathBuf,
    window_size: (u32, u32),
    request_timeout: Duration,
}

impl ChromeLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            window_size: DEFAULT_WINDOW_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_window_size(mut self, width: u32, height: u32) -> Self {
        self.window_size = (width, height);
        self
    }

    /// Upper bound for a single DevTools command. Keep it above the per-item
    /// timeout so navigation timeouts are reported as such.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, proxy: Option<&str>) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let (server, credentials) = match proxy {
            Some(endpoint) => {
                let (server, credentials) =
                    proxy::split_credentials(endpoint).map_err(|e| BrowserError::Launch(e.to_string()))?;
                (Some(server), credentials)
            }
            None => (None, None),
        };
        let profile = tempfile::Builder::new()
            .prefix("proxy-probe-chrome-")
            .tempdir()
            .map_err(|e| BrowserError::Launch(format!("failed to create profile directory: {e}")))?;

        let config = BrowserConfig::builder()
            .chrome_executable(&self.binary)
            .user_data_dir(profile.path())
            .window_size(self.window_size.0, self.window_size.1)
            .request_timeout(self.request_timeout)
            .no_sandbox()
            .args(chrome_args(server.as_deref()))
            .build()
            .map_err(BrowserError::Launch)?;
        debug!(
            binary = %self.binary.display(),
            profile = %profile.path().display(),
            proxy = server.as_deref().unwrap_or("none"),
            authenticated = credentials.is_some(),
            "launching browser"
        );

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(format!("{}: {e}", self.binary.display())))?;
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(ChromeSession {
            browser: Some(browser),
            events: Some(events),
            profile: Some(profile),
            credentials,
        }))
    }
}

/// Extra Chrome switches. `--proxy-server` is only emitted for proxied
/// targets and only ever carries the bare server address.
pub fn chrome_args(proxy_server: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--disable-gpu".to_string(),
        "--no-first-run".to_string(),
        "--disable-extensions".to_string(),
        "--hide-scrollbars".to_string(),
    ];
    if let Some(server) = proxy_server {
        args.push(format!("--proxy-server={server}"));
    }
    args
}

struct ChromeSession {
    browser: Option<Browser>,
    events: Option<JoinHandle<()>>,
    profile: Option<TempDir>,
    credentials: Option<ProxyCredentials>,
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn new_page(&mut self) -> Result<Box<dyn BrowserPage>, BrowserError> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| BrowserError::Launch("browser already closed".into()))?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Launch(format!("failed to open page: {e}")))?;
        if let Some(creds) = &self.credentials {
            page.authenticate(Credentials {
                username: creds.username.clone(),
                password: creds.password.clone(),
            })
            .await
            .map_err(|e| BrowserError::Launch(format!("failed to set proxy credentials: {e}")))?;
        }
        Ok(Box::new(ChromePage { page: Some(page) }))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        let mut result = Ok(());
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                result = Err(BrowserError::Launch(format!("failed to close browser: {e}")));
            }
            if let Err(e) = browser.wait().await {
                debug!(error = %e, "browser process did not exit cleanly");
            }
        }
        if let Some(events) = self.events.take() {
            events.abort();
        }
        if let Some(dir) = self.profile.take() {
            if let Err(e) = dir.close() {
                result = result.and(Err(BrowserError::Launch(format!(
                    "failed to remove profile directory: {e}"
                ))));
            }
        }
        result
    }
}

struct ChromePage {
    page: Option<Page>,
}

impl ChromePage {
    fn page(&self) -> Result<&Page, BrowserError> {
        self.page
            .as_ref()
            .ok_or_else(|| BrowserError::Capture("page already closed".into()))
    }
}

/// Status and content type of a main-document response.
fn navigation_from(status: i64, mime_type: &str) -> Navigation {
    Navigation {
        status: u16::try_from(status).unwrap_or_default(),
        content_type: mime_type.to_string(),
    }
}

#[async_trait]
impl BrowserPage for ChromePage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<Navigation, BrowserError> {
        let page = self.page()?;
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| BrowserError::Navigation(e.to_string()))?;

        match time::timeout(timeout, page.goto(url)).await {
            Err(_) => {
                return Err(BrowserError::NavigationTimeout {
                    secs: timeout.as_secs_f64(),
                })
            }
            Ok(Err(e)) => return Err(BrowserError::Navigation(e.to_string())),
            Ok(Ok(_)) => {}
        }

        let main_frame = page.mainframe().await.ok().flatten();
        loop {
            let event = match time::timeout(RESPONSE_GRACE, responses.next()).await {
                Ok(Some(event)) => event,
                _ => {
                    return Err(BrowserError::Navigation(
                        "no response received for the main document".into(),
                    ))
                }
            };
            if event.r#type != ResourceType::Document {
                continue;
            }
            if let (Some(main), Some(frame)) = (&main_frame, &event.frame_id) {
                if main != frame {
                    continue;
                }
            }
            return Ok(navigation_from(event.response.status, &event.response.mime_type));
        }
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
        self.page()?
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
            .map_err(|e| BrowserError::Capture(e.to_string()))
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        self.page()?
            .content()
            .await
            .map_err(|e| BrowserError::Capture(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        match self.page.take() {
            Some(page) => page
                .close()
                .await
                .map_err(|e| BrowserError::Capture(format!("failed to close page: {e}"))),
            None => Ok(()),
        }
    }
}
