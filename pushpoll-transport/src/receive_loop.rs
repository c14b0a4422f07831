//! The receive loop serves a single receiving physical request: it subscribes to the message
//! source, initializes the response, and then flushes batches to the client until something ends
//! the request.
//!
//! Three things run concurrently for each request:
//!
//! - The setup work in [`run`]: the transport-connected hook and response initialization.
//! - The batch callback the message source invokes, see [`ReceiveLoop::on_batch`].
//! - A cancellation observer that ends the request when the host abandons it.
//!
//! They are ordered by an [`InitGate`].  Neither the callback nor the observer does anything
//! until setup has finished and the gate is open, no matter how early the source delivers its
//! first batch or how early the client goes away.
//!
//! Batches additionally wait for the lifecycle hook running alongside the loop, if there is one,
//! so the application hears about a new connection before the client hears anything.  The
//! observer doesn't: a hook that never finishes can't keep an abandoned request subscribed.
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::gate::InitGate;
use crate::hooks;
use crate::observers::TransportEvent;
use crate::response::{ResponseSink, encode_batch};
use crate::source::{BatchCallback, Subscription};
use crate::telemetry;
use crate::transport::TransportInner;
use crate::types::{LogicalConnection, MessageBatch};
use crate::{Result, TransportError};

/// Why a receiving physical request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The source said the logical connection is gone
    Disconnected,

    /// The source said the request has been open long enough; the client should poll again
    TimedOut,

    /// The client aborted the logical connection
    Aborted,

    /// The host abandoned the request, usually because the client went away
    Cancelled,

    /// A response that carries a single batch has delivered it
    Delivered,

    /// A batch couldn't be encoded or written
    FlushFailed,

    /// The response couldn't be initialized, so nothing was ever flushed
    InitializationFailed,
}

/// Everything the receive loop needs to know about the request it's serving
pub(crate) struct ReceiveRequest {
    pub connection: LogicalConnection,
    pub response: Arc<dyn ResponseSink>,
    pub cancellation_token: CancellationToken,

    /// Register the connection with the liveness tracker before subscribing.  Connect requests
    /// register up front themselves, since they need to know if the connection is fresh.
    pub register: bool,

    /// Something else that must finish before the first flush.  Only batches wait for it.
    pub flush_dependency: Option<InitGate>,
}

/// What must be updated together when the loop finishes
#[derive(Default)]
struct Outcome {
    termination: Option<Termination>,
    subscription: Option<Subscription>,
}

struct ReceiveLoop {
    inner: Arc<TransportInner>,
    connection: LogicalConnection,
    response: Arc<dyn ResponseSink>,
    request_token: CancellationToken,

    /// Opens once the response is initialized
    gate: InitGate,

    /// Opens after `gate`, once the flush dependency (if any) is done too
    flush_gate: InitGate,

    /// Cancelled exactly once, when the loop finishes for whatever reason
    completed: CancellationToken,

    /// Held for the duration of every flush, so that finishing the loop from the cancellation
    /// observer can't happen in the middle of a write
    flushing: tokio::sync::Mutex<()>,

    outcome: Mutex<Outcome>,
}

/// Serve a receiving request until it ends, returning why it ended.
///
/// The returned error is for failures that kept the loop from ever serving the request
/// (subscribing, initializing the response).  Anything that goes wrong after that ends the loop
/// with the corresponding [`Termination`] and is logged and counted, but isn't an error.
pub(crate) async fn run(inner: Arc<TransportInner>, request: ReceiveRequest) -> Result<Termination> {
    let ReceiveRequest {
        connection,
        response,
        cancellation_token,
        register,
        flush_dependency,
    } = request;

    if register {
        inner.tracker.register_or_touch(&connection);
    }

    let state = Arc::new(ReceiveLoop {
        inner: inner.clone(),
        connection: connection.clone(),
        response,
        request_token: cancellation_token,
        gate: InitGate::new(),
        flush_gate: InitGate::new(),
        completed: CancellationToken::new(),
        flushing: tokio::sync::Mutex::new(()),
        outcome: Mutex::new(Outcome::default()),
    });

    // If the caller stops polling us, the request is over and the subscription must not outlive it
    let _finish_guard = FinishOnDrop(state.clone());

    let observer = tokio::spawn(state.clone().observe_cancellation().instrument(tracing::Span::current()));

    let callback: BatchCallback = {
        let state = state.clone();
        Arc::new(move |batch| state.clone().on_batch(batch).boxed())
    };

    // Resume from what the client says it has seen.  Anything written since then may never have
    // reached it.
    let subscription = match inner.source.subscribe(
        &connection,
        connection.last_message_id(),
        inner.config.max_batch_size,
        callback,
    ) {
        Ok(subscription) => subscription,
        Err(e) => {
            telemetry::record_transport_error();
            tracing::error!(err = %e, "Failed to subscribe to the message source");

            state.finish(Termination::InitializationFailed);
            state.open_gates();
            join_observer(observer).await;
            return Err(e);
        }
    };
    state.attach_subscription(subscription);

    if let Err(e) = state.initialize().await {
        // Finish before opening the gates, so a batch held there sees the loop is over instead of
        // writing to a response that couldn't be initialized
        state.finish(Termination::InitializationFailed);
        state.open_gates();
        join_observer(observer).await;
        return Err(e);
    }
    state.gate.open();

    if let Some(dependency) = flush_dependency {
        tracing::trace!("Waiting for the lifecycle hook before the first flush");
        tokio::select! {
            _ = dependency.wait() => {}
            _ = state.completed.cancelled() => {}
        }
    }
    state.flush_gate.open();

    state.completed.cancelled().await;
    join_observer(observer).await;

    Ok(state.termination().unwrap_or(Termination::Cancelled))
}

/// The observer exits as soon as the loop completes
async fn join_observer(observer: tokio::task::JoinHandle<()>) {
    if let Err(e) = observer.await {
        tracing::warn!(err = %e, "Cancellation observer task failed");
    }
}

impl ReceiveLoop {
    /// Set up the response.  The gate is opened by the caller once this returns.
    async fn initialize(&self) -> Result<()> {
        if let Some(hook) = &self.inner.hooks.transport_connected {
            if let Err(e) = hooks::invoke("transport_connected", hook(self.connection.clone())).await {
                // Not worth failing the request over
                telemetry::record_error();
                tracing::warn!(err = %e, "Transport connected hook failed");
            }
        }

        self.response.set_content_type(self.inner.framing.content_type());

        if let Some(preamble) = self.inner.framing.preamble() {
            if let Err(source) = self.response.write(preamble).await {
                telemetry::record_transport_error();
                tracing::warn!(err = %source, "Failed to initialize the response");
                return Err(TransportError::Write { source });
            }
        }

        tracing::trace!("Receive loop initialized");
        Ok(())
    }

    /// End the request when the host cancels it, but not before setup has finished and not in
    /// the middle of a flush
    async fn observe_cancellation(self: Arc<Self>) {
        tokio::select! {
            _ = self.completed.cancelled() => return,
            _ = self.request_token.cancelled() => {}
        }

        self.gate.wait().await;
        let _flushing = self.flushing.lock().await;

        tracing::debug!("Request cancelled by the host");
        self.finish(Termination::Cancelled);
    }

    /// Batch callback handed to the message source.  Returns `true` to keep receiving.
    async fn on_batch(self: Arc<Self>, batch: MessageBatch) -> bool {
        // Nothing goes out before the response is initialized and the lifecycle hook is done, no
        // matter how early the source delivers.  A loop that ends meanwhile releases the batch.
        tokio::select! {
            _ = self.flush_gate.wait() => {}
            _ = self.completed.cancelled() => return false,
        }
        let _flushing = self.flushing.lock().await;

        if self.completed.is_cancelled() {
            return false;
        }

        let cancelled = self.request_token.is_cancelled();
        if batch.is_terminal() || cancelled {
            let termination = if batch.aborted {
                self.inner.disconnect(&self.connection).await;
                Termination::Aborted
            } else if batch.disconnect {
                Termination::Disconnected
            } else if batch.timed_out {
                Termination::TimedOut
            } else {
                Termination::Cancelled
            };

            self.finish(termination);
            return false;
        }

        if let Err(e) = self.flush(&batch).await {
            telemetry::record_transport_error();
            tracing::warn!(err = %e, "Failed to flush batch; ending the request");
            self.finish(Termination::FlushFailed);
            return false;
        }

        if self.inner.framing.completes_after_flush() {
            self.finish(Termination::Delivered);
            return false;
        }

        true
    }

    async fn flush(&self, batch: &MessageBatch) -> Result<()> {
        let cursor = self.connection.last_message_id();
        let (response, body) = encode_batch(self.inner.framing.as_ref(), batch, cursor)?;

        self.inner.observers.notify(TransportEvent::SendingResponse {
            connection_id: self.connection.id(),
            response: &response,
        });

        self.response
            .write(body)
            .await
            .map_err(|source| TransportError::Write { source })?;

        let cursor = self.connection.advance_to(response.message_id);
        telemetry::messages_flushed(batch.messages.len());
        self.inner.tracker.mark_activity(&self.connection);

        tracing::trace!(messages = batch.messages.len(), %cursor, "Flushed batch");
        Ok(())
    }

    fn attach_subscription(&self, subscription: Subscription) {
        let mut outcome = self.lock_outcome();
        if outcome.termination.is_some() {
            // Finished before the source even returned the subscription
            drop(outcome);
            subscription.dispose();
        } else {
            outcome.subscription = Some(subscription);
        }
    }

    /// Record why the loop ended and tear it down.  Only the first call has any effect.
    fn finish(&self, termination: Termination) {
        let subscription = {
            let mut outcome = self.lock_outcome();
            if outcome.termination.is_some() {
                return;
            }
            outcome.termination = Some(termination);
            outcome.subscription.take()
        };

        tracing::debug!(?termination, "Receive loop finished");

        if let Some(subscription) = subscription {
            subscription.dispose();
        }
        self.completed.cancel();
    }

    /// Release anything waiting on either gate
    fn open_gates(&self) {
        self.gate.open();
        self.flush_gate.open();
    }

    fn termination(&self) -> Option<Termination> {
        self.lock_outcome().termination
    }

    fn lock_outcome(&self) -> std::sync::MutexGuard<'_, Outcome> {
        self.outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct FinishOnDrop(Arc<ReceiveLoop>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.finish(Termination::Cancelled);
        self.0.open_gates();
    }
}
