mod common;

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{fake_strategy, FakeLauncher, FakeLog, PANIC, SLOW};
use proxy_probe_rs::aggregator::{Aggregator, Publisher};
use proxy_probe_rs::expand::expand_work_items;
use proxy_probe_rs::runner::{run, RunOptions};
use proxy_probe_rs::types::{ProxyTarget, RequestSpec, Snapshot, TestOutcome};

fn opts(concurrency: usize) -> RunOptions {
    RunOptions {
        concurrency,
        timeout: Duration::from_secs(5),
    }
}

fn record(publisher: &Publisher) -> Arc<Mutex<Vec<Arc<Snapshot>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    publisher.subscribe(move |s| {
        sink.lock().unwrap().push(s.clone());
        ControlFlow::Continue(())
    });
    seen
}

fn urls(n: usize) -> Vec<RequestSpec> {
    (0..n)
        .map(|i| RequestSpec::get(format!("http://site{i}.test/")))
        .collect()
}

#[tokio::test]
async fn single_slot_still_delivers_every_item() {
    let launcher = FakeLauncher::new();
    let log = launcher.log.clone();
    let (strategy, _store) = fake_strategy(launcher);
    let items = expand_work_items(&[ProxyTarget::direct()], &urls(5));

    let publisher = Publisher::new();
    let mut agg = Aggregator::new(items.len(), publisher.clone());
    let seen = record(&publisher);

    let summary = run(items, strategy, opts(1), |o| agg.on_outcome(o)).await;
    agg.finish();

    assert_eq!(summary.total, 5);
    assert_eq!(summary.succeeded, 5);
    assert_eq!(FakeLog::get(&log.max_in_flight), 1);

    let seen = seen.lock().unwrap();
    // attach + one per outcome + finish
    assert_eq!(seen.len(), 7);
    for (i, snap) in seen.iter().enumerate().take(6) {
        assert!(snap.is_running);
        assert_eq!(snap.completed, i);
    }
    let last = seen.last().unwrap();
    assert!(!last.is_running);
    assert_eq!(last.outcome_count(), 5);
}

#[tokio::test]
async fn empty_worklist_finishes_with_one_notification() {
    let (strategy, _store) = fake_strategy(FakeLauncher::new());
    let items = expand_work_items(&[ProxyTarget::direct()], &[]);
    assert!(items.is_empty());

    let publisher = Publisher::new();
    let mut agg = Aggregator::new(0, publisher.clone());
    let seen = record(&publisher);
    let mut delivered = 0;

    let summary = run(items, strategy, opts(4), |o| {
        delivered += 1;
        agg.on_outcome(o)
    })
    .await;
    agg.finish();

    assert_eq!(delivered, 0);
    assert_eq!(summary.total, 0);
    let seen = seen.lock().unwrap();
    // the attach delivery plus exactly one finished notification
    assert_eq!(seen.len(), 2);
    assert!(!seen[1].is_running);
    assert!(seen[1].groups.is_empty());
}

#[tokio::test]
async fn concurrency_bound_is_respected() {
    let launcher = FakeLauncher::new();
    let log = launcher.log.clone();
    let (strategy, _store) = fake_strategy(launcher);
    let requests: Vec<_> = (0..12)
        .map(|i| RequestSpec::get(format!("http://{SLOW}{i}.test/")))
        .collect();
    let items = expand_work_items(&[ProxyTarget::direct()], &requests);

    let mut outcomes = Vec::new();
    run(items, strategy, opts(3), |o| outcomes.push(o)).await;

    assert_eq!(outcomes.len(), 12);
    assert!(FakeLog::get(&log.max_in_flight) <= 3);
    assert_eq!(FakeLog::get(&log.sessions_closed), 12);
}

#[tokio::test]
async fn completion_order_follows_speed_not_submission() {
    let (strategy, _store) = fake_strategy(FakeLauncher::new());
    let requests = vec![
        RequestSpec::get(format!("http://{SLOW}.test/")),
        RequestSpec::get("http://fast.test/"),
    ];
    let items = expand_work_items(&[ProxyTarget::direct()], &requests);

    let mut order = Vec::new();
    run(items, strategy, opts(2), |o| order.push(o.url().to_string())).await;

    assert_eq!(order, vec!["http://fast.test/".to_string(), format!("http://{SLOW}.test/")]);
}

#[tokio::test]
async fn panicking_item_does_not_affect_siblings() {
    let launcher = FakeLauncher::new();
    let log = launcher.log.clone();
    let (strategy, _store) = fake_strategy(launcher);
    let requests = vec![
        RequestSpec::get("http://ok1.test/"),
        RequestSpec::get(format!("http://{PANIC}.test/")),
        RequestSpec::get("http://ok2.test/"),
    ];
    let items = expand_work_items(&[ProxyTarget::direct()], &requests);

    let mut outcomes: Vec<TestOutcome> = Vec::new();
    let summary = run(items, strategy, opts(2), |o| outcomes.push(o)).await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    let failed = outcomes.iter().find(|o| !o.is_success()).unwrap();
    assert!(failed.url().contains(PANIC));
    assert!(failed.error().unwrap().contains("scripted panic"));

    // the panicking item still releases its page and browser
    assert_eq!(FakeLog::get(&log.launched), 3);
    assert_eq!(FakeLog::get(&log.pages_closed), 3);
    assert_eq!(FakeLog::get(&log.sessions_closed), 3);
    assert_eq!(FakeLog::get(&log.in_flight), 0);
}

#[tokio::test]
async fn zero_concurrency_is_treated_as_one() {
    let launcher = FakeLauncher::new();
    let log = launcher.log.clone();
    let (strategy, _store) = fake_strategy(launcher);
    let items = expand_work_items(&[ProxyTarget::direct()], &urls(3));

    let mut count = 0;
    run(items, strategy, opts(0), |_| count += 1).await;

    assert_eq!(count, 3);
    assert_eq!(FakeLog::get(&log.max_in_flight), 1);
}
