//! Scriptable in-process browser used by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proxy_probe_rs::blobstore::MemoryBlobStore;
use proxy_probe_rs::browser::{
    BrowserError, BrowserLauncher, BrowserPage, BrowserRender, BrowserSession, Navigation,
};
use proxy_probe_rs::strategy::Strategy;

/// URL fragments that trigger scripted behaviour.
pub const FAIL_NAV: &str = "fail-nav";
pub const FAIL_CONTENT: &str = "fail-content";
pub const PANIC: &str = "panic";
pub const SLOW: &str = "slow";

#[derive(Debug, Default)]
pub struct FakeLog {
    pub launched: AtomicUsize,
    pub sessions_closed: AtomicUsize,
    pub pages_closed: AtomicUsize,
    pub screenshots: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub proxies: Mutex<Vec<Option<String>>>,
}

impl FakeLog {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone)]
pub struct FakeLauncher {
    pub log: Arc<FakeLog>,
    pub screenshot_fails: bool,
    pub slow_delay: Duration,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            slow_delay: Duration::from_millis(200),
            ..Self::default()
        }
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, proxy: Option<&str>) -> Result<Box<dyn BrowserSession>, BrowserError> {
        self.log.launched.fetch_add(1, Ordering::SeqCst);
        self.log
            .proxies
            .lock()
            .unwrap()
            .push(proxy.map(str::to_string));
        let now = self.log.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            launcher: self.clone(),
            closed: false,
        }))
    }
}

struct FakeSession {
    launcher: FakeLauncher,
    closed: bool,
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn new_page(&mut self) -> Result<Box<dyn BrowserPage>, BrowserError> {
        Ok(Box::new(FakePage {
            launcher: self.launcher.clone(),
            url: None,
        }))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if !self.closed {
            self.closed = true;
            self.launcher.log.sessions_closed.fetch_add(1, Ordering::SeqCst);
            self.launcher.log.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct FakePage {
    launcher: FakeLauncher,
    url: Option<String>,
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<Navigation, BrowserError> {
        self.url = Some(url.to_string());
        if url.contains(PANIC) {
            panic!("scripted panic for {url}");
        }
        if url.contains(SLOW) {
            let delay = self.launcher.slow_delay;
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(BrowserError::NavigationTimeout {
                    secs: timeout.as_secs_f64(),
                });
            }
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        if url.contains(FAIL_NAV) {
            return Err(BrowserError::Navigation("net::ERR_CONNECTION_REFUSED".into()));
        }
        Ok(Navigation {
            status: 200,
            content_type: "text/html".into(),
        })
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
        self.launcher.log.screenshots.fetch_add(1, Ordering::SeqCst);
        if self.launcher.screenshot_fails {
            return Err(BrowserError::Capture("screenshot target closed".into()));
        }
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        let url = self.url.clone().unwrap_or_default();
        if url.contains(FAIL_CONTENT) {
            return Err(BrowserError::Capture("document detached".into()));
        }
        Ok(format!("<html><body>{url}</body></html>"))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.launcher.log.pages_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn fake_strategy(launcher: FakeLauncher) -> (Arc<Strategy>, Arc<MemoryBlobStore>) {
    let store = Arc::new(MemoryBlobStore::new("http://127.0.0.1:8080"));
    let strategy = Strategy::from(BrowserRender::new(Arc::new(launcher), store.clone()));
    (Arc::new(strategy), store)
}
