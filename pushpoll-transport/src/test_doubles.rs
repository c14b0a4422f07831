//! Hand-driven stand-ins for the transport's collaborators, for unit tests.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::error::BoxError;
use crate::hooks::TransportHooks;
use crate::observers::TransportObservers;
use crate::response::{Framing, ResponseSink};
use crate::source::{BatchCallback, MessageSource, Subscription};
use crate::tracker::LivenessTracker;
use crate::transport::TransportInner;
use crate::Result;
use crate::types::{ConnectionId, LogicalConnection, MessageBatch, MessageId};

pub(crate) fn transport_inner(
    source: impl MessageSource,
    tracker: impl LivenessTracker,
    hooks: TransportHooks,
    framing: impl Framing,
) -> Arc<TransportInner> {
    Arc::new(TransportInner {
        config: TransportConfig::default(),
        source: Arc::new(source),
        tracker: Arc::new(tracker),
        hooks,
        framing: Arc::new(framing),
        observers: TransportObservers::default(),
    })
}

/// A response body that remembers everything written to it
pub(crate) struct RecordingSink {
    content_type: Mutex<Option<String>>,
    writes: watch::Sender<Vec<String>>,
    ended: AtomicBool,
    attempts: AtomicUsize,
    fail_writes: bool,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            content_type: Mutex::new(None),
            writes: watch::channel(Vec::new()).0,
            ended: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            fail_writes: false,
        })
    }

    /// A sink whose client has already gone away: every write fails
    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            content_type: Mutex::new(None),
            writes: watch::channel(Vec::new()).0,
            ended: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            fail_writes: true,
        })
    }

    pub(crate) fn writes(&self) -> Vec<String> {
        self.writes.borrow().clone()
    }

    pub(crate) async fn wait_for_writes(&self, count: usize) -> Vec<String> {
        let mut rx = self.writes.subscribe();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|writes| writes.len() >= count))
            .await
            .expect("timed out waiting for writes")
            .expect("sink dropped")
            .clone()
    }

    /// Writes tried, including ones that failed
    pub(crate) fn write_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn content_type(&self) -> Option<String> {
        self.content_type.lock().unwrap().clone()
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    fn set_content_type(&self, content_type: &str) {
        *self.content_type.lock().unwrap() = Some(content_type.to_string());
    }

    async fn write(&self, body: String) -> std::result::Result<(), BoxError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes {
            return Err("client went away".into());
        }
        self.writes.send_modify(|writes| writes.push(body));
        Ok(())
    }

    async fn end(&self) -> std::result::Result<(), BoxError> {
        self.ended.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// What a [`ManualSource`] got from its most recent subscriber
#[derive(Clone)]
pub(crate) struct ManualSubscription {
    pub on_batch: BatchCallback,
    pub subscription: Subscription,
    pub cursor: MessageId,
}

/// A message source that delivers only what the test tells it to
#[derive(Clone)]
pub(crate) struct ManualSource {
    latest: Arc<watch::Sender<Option<ManualSubscription>>>,
    count: Arc<watch::Sender<usize>>,
}

impl ManualSource {
    pub(crate) fn new() -> Self {
        Self {
            latest: Arc::new(watch::channel(None).0),
            count: Arc::new(watch::channel(0).0),
        }
    }

    pub(crate) fn subscribe_count(&self) -> usize {
        *self.count.borrow()
    }

    pub(crate) async fn wait_for_subscriptions(&self, count: usize) {
        let mut rx = self.count.subscribe();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|n| *n >= count))
            .await
            .expect("timed out waiting for subscription")
            .expect("source dropped");
    }

    /// The most recent subscription, waiting for one if there hasn't been any yet
    pub(crate) async fn subscribed(&self) -> ManualSubscription {
        let mut rx = self.latest.subscribe();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(Option::is_some))
            .await
            .expect("timed out waiting for subscription")
            .expect("source dropped")
            .clone()
            .expect("checked above")
    }

    /// Hand `batch` to the most recent subscriber, returning whether it wants more
    pub(crate) async fn deliver(&self, batch: MessageBatch) -> bool {
        let subscribed = self.subscribed().await;
        (subscribed.on_batch)(batch).await
    }
}

impl MessageSource for ManualSource {
    fn subscribe(
        &self,
        _connection: &LogicalConnection,
        cursor: MessageId,
        _max_batch_size: usize,
        on_batch: BatchCallback,
    ) -> Result<Subscription> {
        let subscription = Subscription::new(CancellationToken::new());
        self.latest.send_replace(Some(ManualSubscription {
            on_batch,
            subscription: subscription.clone(),
            cursor,
        }));
        self.count.send_modify(|n| *n += 1);
        Ok(subscription)
    }
}

#[derive(Default)]
struct TrackerCalls {
    live: HashSet<ConnectionId>,
    registered: Vec<ConnectionId>,
    aborted: Vec<ConnectionId>,
    activity: usize,
    removed: usize,
}

/// A liveness tracker that records what it was asked to do
#[derive(Clone, Default)]
pub(crate) struct RecordingTracker {
    calls: Arc<Mutex<TrackerCalls>>,
}

impl RecordingTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every connection registered, in order, including repeats
    pub(crate) fn registered(&self) -> Vec<ConnectionId> {
        self.calls.lock().unwrap().registered.clone()
    }

    pub(crate) fn aborted(&self) -> Vec<ConnectionId> {
        self.calls.lock().unwrap().aborted.clone()
    }

    /// How many removals actually removed something
    pub(crate) fn removed(&self) -> usize {
        self.calls.lock().unwrap().removed
    }

    pub(crate) fn activity(&self) -> usize {
        self.calls.lock().unwrap().activity
    }
}

impl LivenessTracker for RecordingTracker {
    fn register_or_touch(&self, connection: &LogicalConnection) -> bool {
        let mut calls = self.calls.lock().unwrap();
        calls.registered.push(connection.id().clone());
        calls.live.insert(connection.id().clone())
    }

    fn abort(&self, connection_id: &ConnectionId) {
        self.calls.lock().unwrap().aborted.push(connection_id.clone());
    }

    fn mark_activity(&self, _connection: &LogicalConnection) {
        self.calls.lock().unwrap().activity += 1;
    }

    fn remove(&self, connection_id: &ConnectionId) -> bool {
        let mut calls = self.calls.lock().unwrap();
        let removed = calls.live.remove(connection_id);
        if removed {
            calls.removed += 1;
        }
        removed
    }
}
