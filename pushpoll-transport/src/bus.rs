//! In-memory [`MessageSource`] with a bounded backlog.
//!
//! This is enough for a single-process host, and it's what the tests drive the transport with.
//! Messages are kept in one shared backlog, addressed either to every connection or to a single
//! one.  Subscribers read the backlog from their cursor forward, so a client that reconnects with
//! the `messageId` it last saw picks up where it left off, provided the messages it missed haven't
//! been evicted yet.
//!
//! Termination conditions for a connection (abort, disconnect, timeout) are posted as
//! [`Signal`]s.  A pending signal is delivered on that connection's next batch, to whichever
//! physical request is subscribed at the time.  Signals nobody will ever take are cleared with
//! [`MessageBus::clear_signals`].
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::TransportConfig;
use crate::source::{BatchCallback, MessageSource, Subscription};
use crate::types::{ConnectionId, JsonValue, LogicalConnection, Message, MessageBatch, MessageId};
use crate::{Result, TransportError};

/// Who a published message is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Connection(ConnectionId),
}

impl Target {
    fn includes(&self, id: &ConnectionId) -> bool {
        match self {
            Target::All => true,
            Target::Connection(target) => target == id,
        }
    }
}

/// Termination condition posted against a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Abort,
    Disconnect,
    TimedOut,
}

#[derive(Debug, Default, Clone, Copy)]
struct PendingSignals {
    aborted: bool,
    disconnect: bool,
    timed_out: bool,
}

struct BacklogEntry {
    target: Target,
    message: Message,
}

struct BusState {
    last_id: MessageId,
    backlog: VecDeque<BacklogEntry>,
    signals: HashMap<ConnectionId, PendingSignals>,

    /// Live subscriptions per connection
    subscribers: HashMap<ConnectionId, usize>,
}

struct BusInner {
    backlog_capacity: usize,
    state: Mutex<BusState>,

    /// Bumped on every publish and signal, to wake subscribers
    version: watch::Sender<u64>,
}

/// Cheaply-clonable handle to an in-memory message bus
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(backlog_capacity: usize) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(BusInner {
                backlog_capacity: backlog_capacity.max(1),
                state: Mutex::new(BusState {
                    last_id: MessageId::START,
                    backlog: VecDeque::new(),
                    signals: HashMap::new(),
                    subscribers: HashMap::new(),
                }),
                version,
            }),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.backlog_capacity)
    }

    /// Append a message to the backlog and wake any subscriber it's addressed to.
    ///
    /// Returns the ID assigned to the message.
    pub fn publish(&self, target: Target, value: impl Into<JsonValue>) -> MessageId {
        let id = {
            let mut state = self.lock_state();
            let id = state.last_id.next();
            state.last_id = id;
            if state.backlog.len() >= self.inner.backlog_capacity {
                if let Some(evicted) = state.backlog.pop_front() {
                    tracing::trace!(message_id = %evicted.message.id, "Evicting oldest message from backlog");
                }
            }
            state.backlog.push_back(BacklogEntry {
                target,
                message: Message::new(id, value),
            });
            id
        };

        self.notify();
        id
    }

    /// Post a termination condition for a connection.
    ///
    /// It's delivered on the connection's next batch, and only once.
    pub fn signal(&self, connection_id: &ConnectionId, signal: Signal) {
        {
            let mut state = self.lock_state();
            let pending = state.signals.entry(connection_id.clone()).or_default();
            match signal {
                Signal::Abort => pending.aborted = true,
                Signal::Disconnect => pending.disconnect = true,
                Signal::TimedOut => pending.timed_out = true,
            }
        }

        tracing::debug!(connection_id = %connection_id, ?signal, "Signal posted for connection");
        self.notify();
    }

    /// Post a signal only if a physical request is subscribed for the connection right now.
    ///
    /// Returns whether the signal was posted.
    pub fn signal_subscribed(&self, connection_id: &ConnectionId, signal: Signal) -> bool {
        if !self.has_subscribers(connection_id) {
            tracing::trace!(connection_id = %connection_id, ?signal, "No subscriber; signal not posted");
            return false;
        }

        self.signal(connection_id, signal);
        true
    }

    /// Drop any signals still pending for a connection
    pub fn clear_signals(&self, connection_id: &ConnectionId) {
        if self.lock_state().signals.remove(connection_id).is_some() {
            tracing::trace!(connection_id = %connection_id, "Cleared pending signals");
        }
    }

    /// Number of connections with a signal waiting to be delivered
    pub fn pending_signals(&self) -> usize {
        self.lock_state().signals.len()
    }

    pub fn has_subscribers(&self, connection_id: &ConnectionId) -> bool {
        self.lock_state().subscribers.contains_key(connection_id)
    }

    /// The ID of the most recently published message
    pub fn last_message_id(&self) -> MessageId {
        self.lock_state().last_id
    }

    /// Number of messages currently retained
    pub fn backlog_len(&self) -> usize {
        self.lock_state().backlog.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BusState> {
        // The lock is never held across an await or around code that can panic, so poisoning
        // would mean a bug in this module.  Recover the guard rather than propagate the panic.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.inner.version.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Take whatever is ready for `connection_id` past `cursor`.
    ///
    /// Pending signals win over messages: a batch with a termination flag set carries no
    /// messages, so nothing is consumed that would then go unflushed.
    fn take_batch(&self, connection_id: &ConnectionId, cursor: MessageId, max_batch_size: usize) -> Option<MessageBatch> {
        let mut state = self.lock_state();

        if let Some(signals) = state.signals.remove(connection_id) {
            return Some(MessageBatch {
                messages: Vec::new(),
                disconnect: signals.disconnect,
                timed_out: signals.timed_out,
                aborted: signals.aborted,
            });
        }

        let messages = state
            .backlog
            .iter()
            .filter(|entry| entry.message.id > cursor && entry.target.includes(connection_id))
            .take(max_batch_size)
            .map(|entry| entry.message.clone())
            .collect::<Vec<_>>();

        if messages.is_empty() {
            None
        } else {
            Some(MessageBatch::new(messages))
        }
    }

    /// Deliver batches to one subscriber until it declines more or the subscription is disposed
    async fn pump(
        self,
        connection: LogicalConnection,
        mut cursor: MessageId,
        max_batch_size: usize,
        on_batch: BatchCallback,
        cancellation_token: CancellationToken,
    ) {
        let _subscribed = SubscriberGuard {
            bus: self.clone(),
            connection_id: connection.id().clone(),
        };
        let mut version = self.inner.version.subscribe();

        loop {
            // Mark the current version seen *before* looking at the state, so that a publish that
            // lands after the check still wakes us up.
            version.borrow_and_update();

            if cancellation_token.is_cancelled() {
                break;
            }

            if let Some(batch) = self.take_batch(connection.id(), cursor, max_batch_size) {
                if let Some(last_id) = batch.last_message_id() {
                    cursor = last_id;
                }

                tracing::trace!(
                    messages = batch.messages.len(),
                    disconnect = batch.disconnect,
                    timed_out = batch.timed_out,
                    aborted = batch.aborted,
                    %cursor,
                    "Delivering batch to subscriber"
                );

                // Run the callback to completion, even if the subscription is disposed while it's
                // running.  Disposal is only acted upon between callbacks.
                if !on_batch(batch).await {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                result = version.changed() => {
                    if result.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::trace!(connection_id = %connection.id(), "Subscription pump exiting");
    }
}

/// Counts a pump as a subscriber until it exits
struct SubscriberGuard {
    bus: MessageBus,
    connection_id: ConnectionId,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let mut state = self.bus.lock_state();
        if let Some(count) = state.subscribers.get_mut(&self.connection_id) {
            *count -= 1;
            if *count == 0 {
                state.subscribers.remove(&self.connection_id);
            }
        }
    }
}

impl MessageSource for MessageBus {
    fn subscribe(
        &self,
        connection: &LogicalConnection,
        cursor: MessageId,
        max_batch_size: usize,
        on_batch: BatchCallback,
    ) -> Result<Subscription> {
        if max_batch_size == 0 {
            return Err(TransportError::Subscribe {
                source: "max batch size must be at least 1".into(),
            });
        }

        let cancellation_token = CancellationToken::new();
        let subscription = Subscription::new(cancellation_token.clone());

        // Counted before the pump starts, so a signal raised right after subscribing isn't lost
        *self.lock_state().subscribers.entry(connection.id().clone()).or_default() += 1;

        tokio::spawn(
            self.clone()
                .pump(connection.clone(), cursor, max_batch_size, on_batch, cancellation_token)
                .instrument(tracing::Span::current()),
        );

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Subscribe with a callback that forwards every batch to a channel and returns `keep_going`
    fn subscribe_to_channel(
        bus: &MessageBus,
        connection: &LogicalConnection,
        max_batch_size: usize,
        keep_going: bool,
    ) -> (Subscription, mpsc::UnboundedReceiver<MessageBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: BatchCallback = Arc::new(move |batch| {
            let _ = tx.send(batch);
            async move { keep_going }.boxed()
        });
        let subscription = bus
            .subscribe(connection, connection.last_message_id(), max_batch_size, callback)
            .unwrap();
        (subscription, rx)
    }

    async fn next_batch(rx: &mut mpsc::UnboundedReceiver<MessageBatch>) -> MessageBatch {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for batch")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn delivers_backlog_in_bounded_batches() {
        let bus = MessageBus::new(100);
        for i in 0..25 {
            bus.publish(Target::All, json!(i));
        }

        let conn = LogicalConnection::new("conn1".into(), MessageId::START);
        let (_subscription, mut rx) = subscribe_to_channel(&bus, &conn, 10, true);

        let sizes = [
            next_batch(&mut rx).await,
            next_batch(&mut rx).await,
            next_batch(&mut rx).await,
        ]
        .map(|b| b.messages.len());
        assert_eq!(sizes, [10, 10, 5]);
    }

    #[tokio::test]
    async fn resumes_from_cursor_and_filters_targets() {
        let bus = MessageBus::new(100);
        bus.publish(Target::All, json!("old"));
        let other: ConnectionId = "conn2".into();
        bus.publish(Target::Connection(other), json!("not for you"));
        let seen = bus.publish(Target::All, json!("seen"));
        bus.publish(Target::Connection("conn1".into()), json!("mine"));

        let conn = LogicalConnection::new("conn1".into(), seen);
        let (_subscription, mut rx) = subscribe_to_channel(&bus, &conn, 10, true);

        let batch = next_batch(&mut rx).await;
        assert_eq!(
            batch.messages.iter().map(|m| m.value.clone()).collect::<Vec<_>>(),
            vec![json!("mine")]
        );
    }

    #[tokio::test]
    async fn wakes_on_publish_and_signal() {
        let bus = MessageBus::new(100);
        let conn = LogicalConnection::new("conn1".into(), MessageId::START);
        let (_subscription, mut rx) = subscribe_to_channel(&bus, &conn, 10, true);

        bus.publish(Target::All, json!("hello"));
        assert_eq!(next_batch(&mut rx).await.messages.len(), 1);

        bus.signal(conn.id(), Signal::Abort);
        let batch = next_batch(&mut rx).await;
        assert!(batch.aborted);
        assert!(!batch.disconnect && !batch.timed_out);
    }

    #[tokio::test]
    async fn signal_subscribed_needs_a_live_subscriber() {
        let bus = MessageBus::new(100);
        let conn = LogicalConnection::new("conn1".into(), MessageId::START);

        assert!(!bus.signal_subscribed(conn.id(), Signal::TimedOut));
        assert_eq!(bus.pending_signals(), 0);

        let (subscription, mut rx) = subscribe_to_channel(&bus, &conn, 10, true);
        assert!(bus.has_subscribers(conn.id()));
        assert!(bus.signal_subscribed(conn.id(), Signal::TimedOut));
        assert!(next_batch(&mut rx).await.timed_out);
        assert_eq!(bus.pending_signals(), 0);

        subscription.dispose();
        tokio::time::timeout(Duration::from_secs(1), async {
            while bus.has_subscribers(conn.id()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pump didn't exit");
    }

    #[tokio::test]
    async fn cleared_signals_are_never_delivered() {
        let bus = MessageBus::new(100);
        let conn = LogicalConnection::new("conn1".into(), MessageId::START);

        bus.signal(conn.id(), Signal::Abort);
        assert_eq!(bus.pending_signals(), 1);
        bus.clear_signals(conn.id());
        assert_eq!(bus.pending_signals(), 0);

        bus.publish(Target::All, json!("after"));
        let (_subscription, mut rx) = subscribe_to_channel(&bus, &conn, 10, true);
        let batch = next_batch(&mut rx).await;
        assert!(!batch.aborted);
        assert_eq!(batch.messages.len(), 1);
    }

    #[tokio::test]
    async fn stops_when_callback_declines() {
        let bus = MessageBus::new(100);
        bus.publish(Target::All, json!(1));

        let conn = LogicalConnection::new("conn1".into(), MessageId::START);
        let (_subscription, mut rx) = subscribe_to_channel(&bus, &conn, 10, false);
        next_batch(&mut rx).await;

        bus.publish(Target::All, json!(2));

        // The pump exits and drops the callback, which closes the channel
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn stops_when_disposed() {
        let bus = MessageBus::new(100);
        let conn = LogicalConnection::new("conn1".into(), MessageId::START);
        let (subscription, mut rx) = subscribe_to_channel(&bus, &conn, 10, true);

        subscription.dispose();

        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn evicts_oldest_when_full() {
        let bus = MessageBus::new(3);
        for i in 0..5 {
            bus.publish(Target::All, json!(i));
        }
        assert_eq!(bus.backlog_len(), 3);
        assert_eq!(bus.last_message_id(), MessageId(5));

        let conn = LogicalConnection::new("conn1".into(), MessageId::START);
        let (_subscription, mut rx) = subscribe_to_channel(&bus, &conn, 10, true);
        let ids = next_batch(&mut rx)
            .await
            .messages
            .iter()
            .map(|m| m.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![MessageId(3), MessageId(4), MessageId(5)]);
    }

    #[tokio::test]
    async fn rejects_zero_batch_size() {
        let bus = MessageBus::new(3);
        let conn = LogicalConnection::new("conn1".into(), MessageId::START);
        let callback: BatchCallback = Arc::new(|_| async { true }.boxed());
        assert!(bus.subscribe(&conn, MessageId::START, 0, callback).is_err());
    }
}
