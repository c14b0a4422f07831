//! The request dispatcher.
//!
//! A [`PersistentTransport`] is shared by every physical request the host serves.  The host parses
//! each request into a [`TransportRequest`], provides a [`ResponseSink`] for its body, and hands
//! both to [`PersistentTransport::process_request`], which works out what kind of request it is
//! and does whatever that kind of request requires.
use std::sync::Arc;

use serde::Serialize;
use tracing::instrument;

use crate::config::TransportConfig;
use crate::gate::InitGate;
use crate::hooks::{self, LifecycleHook, TransportHooks};
use crate::interleave::interleave;
use crate::observers::{TransportEvent, TransportObservers};
use crate::receive_loop::{self, ReceiveRequest, Termination};
use crate::request::{RequestKind, TransportRequest};
use crate::response::{EventStreamFraming, Framing, JSON_CONTENT_TYPE, ResponseSink, to_json};
use crate::source::MessageSource;
use crate::telemetry;
use crate::tracker::LivenessTracker;
use crate::types::{LogicalConnection, MessageId};
use crate::{Result, TransportError};

/// What a call to [`PersistentTransport::process_request`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Data from the client was handed to the received hook
    Received,

    /// The logical connection was asked to abort
    Aborted,

    /// A receiving request ran to completion
    Completed(Termination),
}

/// State shared by the dispatcher and every receive loop it starts
pub(crate) struct TransportInner {
    pub(crate) config: TransportConfig,
    pub(crate) source: Arc<dyn MessageSource>,
    pub(crate) tracker: Arc<dyn LivenessTracker>,
    pub(crate) hooks: TransportHooks,
    pub(crate) framing: Arc<dyn Framing>,
    pub(crate) observers: TransportObservers,
}

impl TransportInner {
    /// Forget the connection and tell the application it's gone.
    ///
    /// Whoever gets the connection out of the tracker first does the telling, so however many
    /// requests observe the abort, the disconnected hook runs at most once per registration.
    pub(crate) async fn disconnect(&self, connection: &LogicalConnection) {
        if !self.tracker.remove(connection.id()) {
            tracing::debug!(connection_id = %connection.id(), "Connection already removed; not notifying again");
            return;
        }

        telemetry::connection_disconnected();

        if let Some(hook) = &self.hooks.disconnected {
            if let Err(e) = hooks::invoke("disconnected", hook(connection.clone())).await {
                telemetry::record_error();
                tracing::warn!(err = %e, connection_id = %connection.id(), "Disconnected hook failed");
            }
        }
    }
}

pub struct TransportBuilder<Stage> {
    stage: Stage,
}

impl Default for TransportBuilder<Stage1> {
    fn default() -> Self {
        Self { stage: Stage1 }
    }
}

impl TransportBuilder<Stage1> {
    /// Where messages come from, and who keeps track of which connections are alive.
    ///
    /// For a single process, that's usually a [`crate::MessageBus`] and a
    /// [`crate::ConnectionRegistry`] built on top of it.
    pub fn with_backend(
        self,
        source: impl MessageSource,
        tracker: impl LivenessTracker,
    ) -> TransportBuilder<Stage2> {
        TransportBuilder {
            stage: Stage2 {
                config: TransportConfig::default(),
                source: Arc::new(source),
                tracker: Arc::new(tracker),
                hooks: TransportHooks::default(),
                framing: Arc::new(EventStreamFraming),
                observers: TransportObservers::default(),
            },
        }
    }
}

impl TransportBuilder<Stage2> {
    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.stage.config = config;
        self
    }

    pub fn with_hooks(mut self, hooks: TransportHooks) -> Self {
        self.stage.hooks = hooks;
        self
    }

    /// How batches are laid out on the wire.  Defaults to [`EventStreamFraming`].
    pub fn with_framing(mut self, framing: impl Framing) -> Self {
        self.stage.framing = Arc::new(framing);
        self
    }

    pub fn with_observers(mut self, observers: TransportObservers) -> Self {
        self.stage.observers = observers;
        self
    }

    pub fn build(self) -> PersistentTransport {
        let Stage2 {
            config,
            source,
            tracker,
            hooks,
            framing,
            observers,
        } = self.stage;

        PersistentTransport {
            inner: Arc::new(TransportInner {
                config,
                source,
                tracker,
                hooks,
                framing,
                observers,
            }),
        }
    }
}

#[doc(hidden)]
pub struct Stage1;

#[doc(hidden)]
pub struct Stage2 {
    config: TransportConfig,
    source: Arc<dyn MessageSource>,
    tracker: Arc<dyn LivenessTracker>,
    hooks: TransportHooks,
    framing: Arc<dyn Framing>,
    observers: TransportObservers,
}

/// Server side of a persistent connection transport.  Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct PersistentTransport {
    inner: Arc<TransportInner>,
}

impl PersistentTransport {
    pub fn builder() -> TransportBuilder<Stage1> {
        TransportBuilder::default()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn observers(&self) -> &TransportObservers {
        &self.inner.observers
    }

    /// Serve one physical request.
    ///
    /// Send and abort requests complete right away.  Receiving requests (connect, reconnect, and
    /// plain receive) complete when the receive loop does, which for a streaming framing can be a
    /// very long time.  The response is ended before this returns, in every case where the request
    /// got far enough to have used it.
    ///
    /// Requests that are malformed fail without side effects: no hook runs, nothing is
    /// subscribed, and the tracker isn't touched.
    #[instrument(skip_all, fields(path = %request.path(), kind = ?request.kind(), connection_id = tracing::field::Empty))]
    pub async fn process_request(
        &self,
        request: TransportRequest,
        response: Arc<dyn ResponseSink>,
    ) -> Result<RequestOutcome> {
        let connection_id = request.connection_id()?;
        tracing::Span::current().record("connection_id", tracing::field::display(&connection_id));

        match request.kind() {
            RequestKind::Send => {
                let data = request.data()?;
                let connection = LogicalConnection::new(connection_id, MessageId::START);
                let result = self.process_send(&connection, data).await;
                end_response(response.as_ref()).await;
                result.map(|()| RequestOutcome::Received)
            }
            RequestKind::Abort => {
                tracing::debug!("Client aborting the connection");
                self.inner.tracker.abort(&connection_id);
                end_response(response.as_ref()).await;
                Ok(RequestOutcome::Aborted)
            }
            kind @ (RequestKind::Connect | RequestKind::Reconnect | RequestKind::Receive) => {
                let connection = LogicalConnection::new(connection_id, request.message_id()?);

                if request.cancellation_token().is_cancelled() {
                    // The client is already gone; don't register or subscribe on its behalf
                    tracing::warn!("Request cancelled before the receive loop started; dropping it");
                    end_response(response.as_ref()).await;
                    return Err(TransportError::Cancelled);
                }

                let result = self
                    .process_receive(kind, connection, request, response.clone())
                    .await;
                end_response(response.as_ref()).await;
                result.map(RequestOutcome::Completed)
            }
        }
    }

    /// Write `value` as a complete JSON response.
    ///
    /// This is for one-off responses the host wants to send outside of a receive loop, like the
    /// reply to a negotiation request.
    pub async fn send_json<T: Serialize>(&self, response: &dyn ResponseSink, value: &T) -> Result<()> {
        let body = to_json(value)?;

        self.inner
            .observers
            .notify(TransportEvent::Sending { body: &body });

        response.set_content_type(JSON_CONTENT_TYPE);
        response.write(body).await.map_err(|source| {
            telemetry::record_transport_error();
            TransportError::Write { source }
        })?;
        response.end().await.map_err(|source| {
            telemetry::record_transport_error();
            TransportError::Write { source }
        })
    }

    async fn process_send(&self, connection: &LogicalConnection, data: &str) -> Result<()> {
        self.inner.observers.notify(TransportEvent::Receiving {
            connection_id: connection.id(),
            data,
        });
        self.inner.tracker.mark_activity(connection);

        let Some(hook) = &self.inner.hooks.received else {
            tracing::trace!("No received hook; dropping data");
            return Ok(());
        };

        hooks::invoke("received", hook(connection.clone(), data.to_string()))
            .await
            .inspect_err(|e| {
                telemetry::record_error();
                tracing::warn!(err = %e, "Received hook failed");
            })
    }

    async fn process_receive(
        &self,
        kind: RequestKind,
        connection: LogicalConnection,
        request: TransportRequest,
        response: Arc<dyn ResponseSink>,
    ) -> Result<Termination> {
        let mut receive = ReceiveRequest {
            connection: connection.clone(),
            response,
            cancellation_token: request.cancellation_token().clone(),
            register: true,
            flush_dependency: None,
        };

        let lifecycle = match kind {
            RequestKind::Connect => {
                // Connect registers up front rather than in the loop, since only a connection the
                // tracker didn't know about gets the connected hook
                receive.register = false;
                let fresh = self.inner.tracker.register_or_touch(&connection);
                if fresh {
                    tracing::debug!("New logical connection");
                } else {
                    tracing::debug!("Connect for a connection that's already registered");
                }

                fresh.then_some(Lifecycle {
                    hook: self.inner.hooks.connected.clone(),
                    name: "connected",
                    count: telemetry::connection_connected,
                })
            }
            RequestKind::Reconnect => Some(Lifecycle {
                hook: self.inner.hooks.reconnected.clone(),
                name: "reconnected",
                count: telemetry::connection_reconnected,
            }),
            _ => None,
        };

        let lifecycle = match lifecycle {
            Some(Lifecycle { hook: None, count, .. }) => {
                count();
                None
            }
            Some(Lifecycle {
                hook: Some(hook),
                name,
                count,
            }) => Some((hook, name, count)),
            None => None,
        };

        let Some((hook, name, count)) = lifecycle else {
            return receive_loop::run(self.inner.clone(), receive).await;
        };

        // The hook and the receive loop start together, but the loop doesn't flush anything
        // until the hook is done, successfully or not.  Cancellation doesn't wait for it.
        let hook_done = InitGate::new();
        receive.flush_dependency = Some(hook_done.clone());

        let loop_fut = receive_loop::run(self.inner.clone(), receive);
        let hook_fut = {
            let open_when_done = hook_done.open_on_drop();
            async move {
                let _open_when_done = open_when_done;

                match hooks::invoke(name, hook(connection)).await {
                    Ok(()) => {
                        count();
                        Ok(())
                    }
                    Err(e) => {
                        telemetry::record_error();
                        tracing::warn!(err = %e, "Lifecycle hook failed");
                        Err(e)
                    }
                }
            }
        };

        let (termination, ()) = interleave(loop_fut, hook_fut).await?;
        Ok(termination)
    }
}

/// The lifecycle hook a receiving request has to run alongside its receive loop
struct Lifecycle {
    hook: Option<LifecycleHook>,
    name: &'static str,
    count: fn(),
}

async fn end_response(response: &dyn ResponseSink) {
    if let Err(e) = response.end().await {
        // Almost always the client having gone away already
        tracing::debug!(err = %e, "Failed to end the response");
    }
}
