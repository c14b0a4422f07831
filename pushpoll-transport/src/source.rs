//! The interface between the transport and whatever produces the messages it delivers.
//!
//! A message source is subscribed to once per physical request, starting from the cursor the
//! client sent.  It hands batches to the transport through a callback, and the callback decides
//! whether the subscription should keep going.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::types::{LogicalConnection, MessageBatch, MessageId};

/// Callback through which a [`MessageSource`] delivers batches.
///
/// The returned future resolves to `true` if the source should keep delivering, `false` if the
/// subscription is done.  Sources must wait for the returned future to complete before invoking
/// the callback again; that is what keeps batches for one request in order and keeps two flushes
/// of the same request from running at once.
pub type BatchCallback = Arc<dyn Fn(MessageBatch) -> BoxFuture<'static, bool> + Send + Sync + 'static>;

/// A producer of message batches that can be subscribed to.
///
/// Implementations are shared by every physical request, so they must be internally
/// synchronized.  The transport never locks them.
pub trait MessageSource: Send + Sync + 'static {
    /// Start delivering batches for `connection`, beginning with the first message after `cursor`.
    ///
    /// At most `max_batch_size` messages are passed to `on_batch` per invocation.  `on_batch` may
    /// be invoked on another task than the one calling `subscribe`, and it may be invoked before
    /// this method returns.
    fn subscribe(
        &self,
        connection: &LogicalConnection,
        cursor: MessageId,
        max_batch_size: usize,
        on_batch: BatchCallback,
    ) -> Result<Subscription>;
}

/// A live registration with a [`MessageSource`].
///
/// Disposing a subscription asks the source to stop delivering.  A source must observe this
/// between callback invocations, never while one is running, so a callback is never torn down
/// halfway through.
///
/// Clones share the same underlying registration, so disposing any of them disposes all of them.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    cancellation_token: CancellationToken,
    disposed: AtomicBool,
}

impl Subscription {
    /// Create a subscription whose disposal signals `cancellation_token`.
    ///
    /// The source is expected to watch the token and stop delivering once it's cancelled.
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                cancellation_token,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Dispose of this subscription.
    ///
    /// Only the first call has any effect; it returns `true`.  Every later call returns `false`.
    pub fn dispose(&self) -> bool {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            tracing::trace!("Subscription already disposed");
            false
        } else {
            self.inner.cancellation_token.cancel();
            true
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Token that is cancelled when this subscription is disposed
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancellation_token
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
