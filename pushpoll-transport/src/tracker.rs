//! Tracking which logical connections are alive.
//!
//! The transport consumes this through the [`LivenessTracker`] trait.  [`ConnectionRegistry`] is
//! an in-memory implementation that pairs with [`crate::MessageBus`]: it raises timeouts,
//! disconnects and aborts by posting signals on the bus, which the connection's current physical
//! request then sees on its next batch.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bus::{MessageBus, Signal};
use crate::config::TransportConfig;
use crate::types::{ConnectionId, LogicalConnection};

/// Registry of live logical connections, shared by every physical request.
///
/// Implementations must be internally synchronized; the transport never locks them.
pub trait LivenessTracker: Send + Sync + 'static {
    /// Register the connection as active, or refresh it if it already is.
    ///
    /// Returns `true` if this registered a connection the tracker didn't know about.
    fn register_or_touch(&self, connection: &LogicalConnection) -> bool;

    /// Ask the connection's current physical request (if any) to end with the abort flag set
    fn abort(&self, connection_id: &ConnectionId);

    /// Note that something happened on the connection, so it isn't considered idle
    fn mark_activity(&self, connection: &LogicalConnection);

    /// Forget the connection.
    ///
    /// Returns `true` if it was registered.  Only one caller ever gets `true` for a given
    /// registration, which is what makes the disconnect notification fire exactly once.
    fn remove(&self, connection_id: &ConnectionId) -> bool;
}

struct TrackedConnection {
    connection: LogicalConnection,
    last_activity: Instant,
    timeout_signaled: bool,
}

struct RegistryInner {
    bus: MessageBus,
    connection_timeout: Duration,
    disconnect_timeout: Duration,
    heartbeat_interval: Duration,
    connections: Mutex<HashMap<ConnectionId, TrackedConnection>>,
}

/// What a single [`ConnectionRegistry::sweep`] did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Connections whose current request was told it timed out
    pub timed_out: Vec<ConnectionId>,

    /// Connections that were idle long enough to be dropped
    pub disconnected: Vec<ConnectionId>,
}

/// In-memory [`LivenessTracker`].  Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(bus: MessageBus, config: &TransportConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                bus,
                connection_timeout: config.connection_timeout,
                disconnect_timeout: config.disconnect_timeout,
                heartbeat_interval: config.heartbeat_interval,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The registry's record of a connection, if it's registered
    pub fn connection(&self, connection_id: &ConnectionId) -> Option<LogicalConnection> {
        self.lock_connections()
            .get(connection_id)
            .map(|tracked| tracked.connection.clone())
    }

    pub fn len(&self) -> usize {
        self.lock_connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look for idle connections as of `now`.
    ///
    /// A connection idle for longer than the connection timeout gets a timeout signal, once per
    /// idle period.  One idle for longer than the connection timeout plus the disconnect timeout
    /// gets a disconnect signal and is removed.
    pub fn sweep(&self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let disconnect_after = self.inner.connection_timeout + self.inner.disconnect_timeout;

        {
            let mut connections = self.lock_connections();
            connections.retain(|id, tracked| {
                let idle = now.saturating_duration_since(tracked.last_activity);
                if idle >= disconnect_after {
                    tracing::debug!(connection_id = %id,
                        idle = %humantime::format_duration(idle),
                        "Connection idle past disconnect timeout; dropping it");
                    outcome.disconnected.push(id.clone());
                    false
                } else {
                    if idle >= self.inner.connection_timeout && !tracked.timeout_signaled {
                        tracing::debug!(connection_id = %id,
                            idle = %humantime::format_duration(idle),
                            "Connection idle past connection timeout");
                        tracked.timeout_signaled = true;
                        outcome.timed_out.push(id.clone());
                    }
                    true
                }
            });
        }

        // Signal outside the registry lock; the bus has its own.  Only a request that's
        // subscribed right now can act on these, so nothing is left pending for a client that
        // isn't there.
        for id in &outcome.timed_out {
            self.inner.bus.signal_subscribed(id, Signal::TimedOut);
        }
        for id in &outcome.disconnected {
            if !self.inner.bus.signal_subscribed(id, Signal::Disconnect) {
                self.inner.bus.clear_signals(id);
            }
        }

        outcome
    }

    /// Run [`Self::sweep`] on the configured heartbeat interval until `cancellation_token` fires.
    pub fn spawn_heartbeat(&self, cancellation_token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let span = tracing::Span::current();

        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(registry.inner.heartbeat_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = cancellation_token.cancelled() => {
                            tracing::debug!("Heartbeat stopping");
                            break;
                        }
                        now = interval.tick() => {
                            let outcome = registry.sweep(now);
                            if !outcome.timed_out.is_empty() || !outcome.disconnected.is_empty() {
                                tracing::debug!(
                                    timed_out = outcome.timed_out.len(),
                                    disconnected = outcome.disconnected.len(),
                                    "Heartbeat sweep"
                                );
                            }
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, TrackedConnection>> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LivenessTracker for ConnectionRegistry {
    fn register_or_touch(&self, connection: &LogicalConnection) -> bool {
        {
            let mut connections = self.lock_connections();
            if let Some(tracked) = connections.get_mut(connection.id()) {
                tracked.connection.advance_to(connection.last_message_id());
                tracked.last_activity = Instant::now();
                tracked.timeout_signaled = false;
                return false;
            }

            connections.insert(
                connection.id().clone(),
                TrackedConnection {
                    connection: connection.clone(),
                    last_activity: Instant::now(),
                    timeout_signaled: false,
                },
            );
        }

        // Whatever was pending belonged to an earlier registration under the same id
        self.inner.bus.clear_signals(connection.id());
        true
    }

    fn abort(&self, connection_id: &ConnectionId) {
        if !self.lock_connections().contains_key(connection_id) {
            tracing::debug!(connection_id = %connection_id, "Abort for an unknown connection; ignoring it");
            return;
        }

        tracing::debug!(connection_id = %connection_id, "Aborting connection");
        self.inner.bus.signal(connection_id, Signal::Abort);
    }

    fn mark_activity(&self, connection: &LogicalConnection) {
        if let Some(tracked) = self.lock_connections().get_mut(connection.id()) {
            tracked.connection.advance_to(connection.last_message_id());
            tracked.last_activity = Instant::now();
            tracked.timeout_signaled = false;
        }
    }

    fn remove(&self, connection_id: &ConnectionId) -> bool {
        self.lock_connections().remove(connection_id).is_some()
    }
}
