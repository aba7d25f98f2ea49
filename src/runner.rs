use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::strategy::{ExecuteOptions, Strategy};
use crate::types::{TestOutcome, WorkItem};

/// Upper bound on simultaneously running items.
pub const MAX_CONCURRENCY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub concurrency: usize,
    pub timeout: Duration,
}

/// Counters for a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_secs: f64,
}

/// Clamp a configured or derived concurrency into `1..=MAX_CONCURRENCY`.
pub fn clamp_concurrency(concurrency: usize) -> usize {
    concurrency.clamp(1, MAX_CONCURRENCY)
}

/// Execute every work item with at most `opts.concurrency` in flight.
///
/// - Items are started in list order, each on its own task.
/// - `on_outcome` is called once per item, in completion order, from this
///   task only, so callers never see two outcomes delivered at once.
/// - A failing or panicking item only produces a failure outcome for itself.
pub async fn run<F>(
    items: Vec<WorkItem>,
    strategy: Arc<Strategy>,
    opts: RunOptions,
    mut on_outcome: F,
) -> RunSummary
where
    F: FnMut(TestOutcome),
{
    let limit = clamp_concurrency(opts.concurrency);
    let exec = ExecuteOptions {
        timeout: opts.timeout,
    };
    let started = Instant::now();
    let mut summary = RunSummary {
        total: items.len(),
        ..RunSummary::default()
    };
    info!(items = summary.total, concurrency = limit, mode = ?strategy.mode(), "starting run");

    let mut deliver = |outcome: TestOutcome, summary: &mut RunSummary| {
        if outcome.is_success() {
            summary.succeeded += 1;
        } else {
            summary.failed += 1;
        }
        on_outcome(outcome);
    };

    // Items currently running, so a lost task still yields an outcome.
    let mut in_flight: HashMap<Uuid, WorkItem> = HashMap::new();
    let mut queue = items.into_iter();
    let mut set = JoinSet::new();

    loop {
        while set.len() < limit {
            let Some(item) = queue.next() else { break };
            in_flight.insert(item.id, item.clone());
            let strategy = strategy.clone();
            set.spawn(async move {
                let outcome = execute_isolated(&strategy, &item, &exec).await;
                (item.id, outcome)
            });
        }

        match set.join_next().await {
            Some(Ok((id, outcome))) => {
                in_flight.remove(&id);
                debug!(url = %outcome.url(), proxy = %outcome.proxy_label(), ok = outcome.is_success(), "item finished");
                deliver(outcome, &mut summary);
            }
            Some(Err(e)) => {
                error!(error = %e, "worker task ended without an outcome");
            }
            None => break,
        }
    }

    for (_, item) in in_flight.drain() {
        deliver(
            TestOutcome::failure(&item, "worker task aborted before producing a result"),
            &mut summary,
        );
    }

    summary.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        elapsed_secs = summary.elapsed_secs,
        "run finished"
    );
    summary
}

/// Run the strategy, turning a panic into a failure outcome.
async fn execute_isolated(strategy: &Strategy, item: &WorkItem, exec: &ExecuteOptions) -> TestOutcome {
    match AssertUnwindSafe(strategy.execute(item, exec)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(url = %item.url(), proxy = %item.proxy.label, panic = %msg, "strategy panicked");
            TestOutcome::failure(item, format!("internal error: {msg}"))
        }
    }
}
