use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use proxy_probe_rs::aggregator::{Aggregator, Publisher};
use proxy_probe_rs::blobstore::{BlobStore, DirBlobStore};
use proxy_probe_rs::browser::{find_chrome, BrowserRender, ChromeLauncher};
use proxy_probe_rs::config::{Cli, ConfigError, RunConfig};
use proxy_probe_rs::fetch::PlainFetch;
use proxy_probe_rs::strategy::{ExecutionMode, Strategy};
use proxy_probe_rs::types::{Snapshot, TestOutcome};
use proxy_probe_rs::{expand, proxy, render, runner, server};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const BROWSER_COMMAND_SLACK: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = RunConfig::from_cli(&cli)?;

    info!(
        urls = cfg.requests.len(),
        mode = ?cfg.mode,
        proxy = %cfg.proxy_mode,
        timeout_secs = cfg.timeout.as_secs(),
        concurrency = cfg.concurrency,
        serve_ui = cfg.serve_ui,
        output = %cfg.output.display(),
        "proxy-probe-rs configuration"
    );

    let artifacts = Arc::new(DirBlobStore::create(&cfg.blob_dir, cfg.public_url.clone()).await?);
    let store: Arc<dyn BlobStore> = artifacts.clone();
    let strategy = Arc::new(build_strategy(&cfg, store.clone())?);

    let proxies = proxy::resolve(&cfg.proxy_mode, &cfg.platform)?;
    let items = expand::expand_work_items(&proxies, &cfg.requests);
    info!(proxies = proxies.len(), items = items.len(), "worklist ready");

    let publisher = Publisher::new();
    let mut aggregator = Aggregator::new(items.len(), publisher.clone());

    // Live results page runs in the background until the run has lingered.
    let shutdown = CancellationToken::new();
    let server_task = if cfg.serve_ui {
        let state = server::AppState::new(publisher.clone(), store.clone());
        let bind = cfg.bind.clone();
        let token = shutdown.clone();
        info!("live results at {}", cfg.public_url);
        Some(tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, state, token).await {
                error!(error = %format!("{e:#}"), "HTTP UI server error");
            }
        }))
    } else {
        None
    };

    let summary = runner::run(
        items,
        strategy,
        runner::RunOptions {
            concurrency: cfg.concurrency,
            timeout: cfg.timeout,
        },
        |outcome| aggregator.on_outcome(outcome),
    )
    .await;
    aggregator.finish();
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        elapsed_secs = summary.elapsed_secs,
        "all items finished"
    );

    let snapshot = aggregator.snapshot();
    print_results_table(&snapshot);

    render::write_page(&snapshot, &artifacts, &cfg.output).await?;
    info!(
        path = %cfg.output.display(),
        artifacts = %artifacts.dir().display(),
        "wrote results page"
    );

    if let Some(path) = cfg.json_output.as_deref() {
        if let Err(e) = write_snapshot_json(path, &snapshot) {
            error!(path = %path.display(), error = %format!("{e:#}"), "failed to write JSON");
        } else {
            info!(path = %path.display(), "wrote JSON results");
        }
    }

    if let Some(task) = server_task {
        if !cfg.linger.is_zero() {
            info!(secs = cfg.linger.as_secs(), "keeping results page up for open viewers");
            tokio::select! {
                _ = tokio::time::sleep(cfg.linger) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }

    Ok(())
}

fn build_strategy(cfg: &RunConfig, store: Arc<dyn BlobStore>) -> Result<Strategy> {
    Ok(match cfg.mode {
        ExecutionMode::Plain => PlainFetch::new(store).into(),
        ExecutionMode::Browser => {
            let binary = cfg
                .chrome_path
                .clone()
                .or_else(find_chrome)
                .ok_or(ConfigError::BrowserNotFound)?;
            info!(binary = %binary.display(), "using browser");
            // DevTools commands must outlive the per-item navigation timeout.
            let launcher = ChromeLauncher::new(binary).with_request_timeout(cfg.timeout + BROWSER_COMMAND_SLACK);
            BrowserRender::new(Arc::new(launcher), store).into()
        }
    })
}

fn print_results_table(snapshot: &Snapshot) {
    let mut url_w = "url".len();
    for group in &snapshot.groups {
        for o in &group.outcomes {
            url_w = url_w.max(o.url().chars().count().min(60));
        }
    }
    let status_w = "status".len();
    let time_w = "secs".len().max(7);

    for group in &snapshot.groups {
        println!("\n{}", group.label);
        println!(
            "{:<url_w$}  {:>status_w$}  {:>time_w$}  {}",
            "url", "status", "secs", "detail"
        );
        println!(
            "{:-<url_w$}  {:-<status_w$}  {:-<time_w$}  {:-<6}",
            "", "", "", ""
        );
        for o in &group.outcomes {
            let url: String = o.url().chars().take(60).collect();
            match o {
                TestOutcome::Success {
                    status_code,
                    duration_secs,
                    content_type,
                    ..
                } => println!(
                    "{:<url_w$}  {:>status_w$}  {:>time_w$.2}  {}",
                    url, status_code, duration_secs, content_type
                ),
                TestOutcome::Failure { error, .. } => println!(
                    "{:<url_w$}  {:>status_w$}  {:>time_w$}  {}",
                    url, "ERR", "-", error
                ),
            }
        }
    }
}

fn write_snapshot_json(path: &std::path::Path, snapshot: &Snapshot) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, snapshot).context("failed to encode snapshot")?;
    Ok(())
}
