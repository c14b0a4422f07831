//! Application callbacks invoked at points in a connection's lifecycle.
//!
//! Every hook is optional.  When one isn't set, the step it belongs to is skipped entirely.
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::{BoxError, panic_err_to_string};
use crate::types::LogicalConnection;
use crate::{Result, TransportError};

pub type HookResult = std::result::Result<(), BoxError>;

/// A hook that only needs to know which connection it's about
pub type LifecycleHook = Arc<dyn Fn(LogicalConnection) -> BoxFuture<'static, HookResult> + Send + Sync>;

/// A hook that receives data the client sent
pub type ReceivedHook =
    Arc<dyn Fn(LogicalConnection, String) -> BoxFuture<'static, HookResult> + Send + Sync>;

#[derive(Clone, Default)]
pub struct TransportHooks {
    pub(crate) connected: Option<LifecycleHook>,
    pub(crate) reconnected: Option<LifecycleHook>,
    pub(crate) transport_connected: Option<LifecycleHook>,
    pub(crate) received: Option<ReceivedHook>,
    pub(crate) disconnected: Option<LifecycleHook>,
}

fn lifecycle_hook<F, Fut>(hook: F) -> LifecycleHook
where
    F: Fn(LogicalConnection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HookResult> + Send + 'static,
{
    Arc::new(move |connection| hook(connection).boxed())
}

impl TransportHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs when a brand new logical connection is established
    pub fn on_connected<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(LogicalConnection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.connected = Some(lifecycle_hook(hook));
        self
    }

    /// Runs when a client resumes a logical connection it already had
    pub fn on_reconnected<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(LogicalConnection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.reconnected = Some(lifecycle_hook(hook));
        self
    }

    /// Runs on every receiving physical request, before its response is initialized.
    ///
    /// A failure here is logged and counted but doesn't fail the request.
    pub fn on_transport_connected<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(LogicalConnection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.transport_connected = Some(lifecycle_hook(hook));
        self
    }

    /// Runs with the payload of each send request
    pub fn on_received<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(LogicalConnection, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.received = Some(Arc::new(move |connection, data| hook(connection, data).boxed()));
        self
    }

    /// Runs once when the client aborts a logical connection
    pub fn on_disconnected<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(LogicalConnection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.disconnected = Some(lifecycle_hook(hook));
        self
    }
}

/// Run a hook's future, turning both its error and any panic into [`TransportError::Hook`].
///
/// Hooks are application code; a panic in one must not take down the task serving the request.
pub(crate) async fn invoke(hook: &'static str, fut: BoxFuture<'static, HookResult>) -> Result<()> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(TransportError::Hook { hook, source }),
        Err(panic) => Err(TransportError::Hook {
            hook,
            source: panic_err_to_string(panic).into(),
        }),
    }
}
