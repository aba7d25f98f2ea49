//! Run state, grouping by proxy and snapshot publishing.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{ProxyGroup, Snapshot, TestOutcome};

pub type SubscriptionId = u64;

type SubscriberFn = Box<dyn FnMut(&Arc<Snapshot>) -> ControlFlow<()> + Send>;

struct PublisherInner {
    current: Arc<Snapshot>,
    next_id: SubscriptionId,
    subscribers: Vec<(SubscriptionId, SubscriberFn)>,
}

/// Fan-out of snapshots to subscribers.
///
/// A subscriber receives the current snapshot as soon as it attaches, then
/// every published snapshot. Returning `ControlFlow::Break` from the callback
/// detaches it.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Mutex<PublisherInner>>,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PublisherInner {
                current: Arc::new(Snapshot::default()),
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PublisherInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: FnMut(&Arc<Snapshot>) -> ControlFlow<()> + Send + 'static,
    {
        let mut callback: SubscriberFn = Box::new(callback);
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        // Delivered under the lock so no publish can slip in between.
        if callback(&inner.current).is_continue() {
            inner.subscribers.push((id, callback));
        }
        id
    }

    /// Subscribe through an unbounded channel; dropping the receiver detaches.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Arc<Snapshot>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |snapshot| match tx.send(snapshot.clone()) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sid, _)| *sid != id);
        inner.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Latest published snapshot.
    pub fn current(&self) -> Arc<Snapshot> {
        self.lock().current.clone()
    }

    /// Replace the current snapshot without notifying anyone.
    fn reset(&self, snapshot: Snapshot) {
        self.lock().current = Arc::new(snapshot);
    }

    fn publish(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        let mut inner = self.lock();
        inner.current = snapshot.clone();
        inner.subscribers.retain_mut(|(id, callback)| {
            let keep = callback(&snapshot).is_continue();
            if !keep {
                debug!(subscription = *id, "subscriber detached");
            }
            keep
        });
    }
}

/// Group outcomes by proxy label. Groups appear in order of their first
/// outcome; outcomes keep their order within a group.
pub fn group_by_proxy(outcomes: &[TestOutcome]) -> Vec<ProxyGroup> {
    let mut groups: Vec<ProxyGroup> = Vec::new();
    for outcome in outcomes {
        match groups.iter_mut().find(|g| g.label == outcome.proxy_label()) {
            Some(group) => group.outcomes.push(outcome.clone()),
            None => groups.push(ProxyGroup {
                label: outcome.proxy_label().to_string(),
                outcomes: vec![outcome.clone()],
            }),
        }
    }
    groups
}

#[derive(Debug)]
struct RunState {
    outcomes: Vec<TestOutcome>,
    is_running: bool,
}

/// Sole owner of the run state.
///
/// Mutation goes through `&mut self`, so outcomes are appended and published
/// strictly one at a time.
pub struct Aggregator {
    state: RunState,
    total: usize,
    publisher: Publisher,
}

impl Aggregator {
    /// Start a run of `total` items. The publisher's current snapshot becomes
    /// an empty running view; subscribers are not notified.
    pub fn new(total: usize, publisher: Publisher) -> Self {
        let agg = Self {
            state: RunState {
                outcomes: Vec::with_capacity(total),
                is_running: true,
            },
            total,
            publisher,
        };
        agg.publisher.reset(agg.snapshot());
        agg
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn outcomes(&self) -> &[TestOutcome] {
        &self.state.outcomes
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            groups: group_by_proxy(&self.state.outcomes),
            is_running: self.state.is_running,
            total: self.total,
            completed: self.state.outcomes.len(),
        }
    }

    pub fn on_outcome(&mut self, outcome: TestOutcome) {
        if !self.state.is_running {
            warn!(url = %outcome.url(), proxy = %outcome.proxy_label(), "outcome arrived after the run finished, ignoring");
            return;
        }
        self.state.outcomes.push(outcome);
        self.publisher.publish(self.snapshot());
    }

    /// Freeze the run and publish the final snapshot. Only the first call has
    /// any effect.
    pub fn finish(&mut self) {
        if !self.state.is_running {
            return;
        }
        self.state.is_running = false;
        self.publisher.publish(self.snapshot());
    }
}
