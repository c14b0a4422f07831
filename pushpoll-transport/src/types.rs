//! Data types shared between the transport, its message source, and its liveness tracker.
//!
//! The message payloads themselves are opaque JSON as far as the transport is concerned.  It only
//! cares about the ordering of messages (via [`MessageId`]) and the termination flags carried on
//! each [`MessageBatch`].
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub use serde_json::Value as JsonValue;

/// Identifier of a logical connection, as supplied by the client on every physical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Make a new, unique connection ID.
    ///
    /// Hosts that negotiate connections before the first connect request can use this to hand out
    /// IDs.  UUIDv7 is used so that IDs sort roughly by creation time, which is handy in logs.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Position of a message in the message source's sequence.
///
/// IDs are assigned in strictly increasing order by the source.  [`MessageId::START`] means the
/// client hasn't seen anything yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const START: MessageId = MessageId(0);

    pub fn next(self) -> MessageId {
        MessageId(self.0 + 1)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single message delivered to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub value: JsonValue,
}

impl Message {
    pub fn new(id: MessageId, value: impl Into<JsonValue>) -> Self {
        Self {
            id,
            value: value.into(),
        }
    }
}

/// The unit in which the message source hands messages to the transport.
///
/// Besides the messages, a batch carries the termination conditions that apply to the logical
/// connection at the moment the batch was produced.  Any one of them ends the physical request
/// without flushing the batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBatch {
    pub messages: Vec<Message>,

    /// The server wants the logical connection to end
    pub disconnect: bool,

    /// The connection saw no activity within the allowed window
    pub timed_out: bool,

    /// The client explicitly closed the logical connection
    pub aborted: bool,
}

impl MessageBatch {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn disconnected() -> Self {
        Self {
            disconnect: true,
            ..Default::default()
        }
    }

    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Default::default()
        }
    }

    pub fn aborted() -> Self {
        Self {
            aborted: true,
            ..Default::default()
        }
    }

    /// True if any of the termination flags is set
    pub fn is_terminal(&self) -> bool {
        self.disconnect || self.timed_out || self.aborted
    }

    /// ID of the newest message in this batch, if it has any.
    pub fn last_message_id(&self) -> Option<MessageId> {
        self.messages.iter().map(|m| m.id).max()
    }
}

/// The shape in which a batch is written to the client.
///
/// `message_id` is the cursor the client should send back as `messageId` on its next physical
/// request to resume where it left off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentResponse {
    pub message_id: MessageId,
    pub messages: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub disconnect: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub aborted: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl PersistentResponse {
    pub fn from_batch(batch: &MessageBatch, cursor: MessageId) -> Self {
        Self {
            message_id: batch.last_message_id().map_or(cursor, |id| id.max(cursor)),
            messages: batch.messages.iter().map(|m| m.value.clone()).collect(),
            disconnect: batch.disconnect,
            timed_out: batch.timed_out,
            aborted: batch.aborted,
        }
    }
}

/// Cheaply-clonable handle to a logical connection.
///
/// The liveness tracker owns the long-lived record of the connection; physical requests hold a
/// clone for as long as they run.  All clones share the same cursor.
#[derive(Clone)]
pub struct LogicalConnection {
    inner: Arc<LogicalConnectionInner>,
}

struct LogicalConnectionInner {
    id: ConnectionId,
    last_message_id: AtomicU64,
}

impl LogicalConnection {
    pub fn new(id: ConnectionId, last_message_id: MessageId) -> Self {
        Self {
            inner: Arc::new(LogicalConnectionInner {
                id,
                last_message_id: AtomicU64::new(last_message_id.0),
            }),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    pub fn last_message_id(&self) -> MessageId {
        MessageId(self.inner.last_message_id.load(Ordering::Acquire))
    }

    /// Move the cursor forward to `id`.
    ///
    /// The cursor never moves backwards; an older `id` is ignored.  Returns the cursor after the
    /// update.
    pub fn advance_to(&self, id: MessageId) -> MessageId {
        let previous = self.inner.last_message_id.fetch_max(id.0, Ordering::AcqRel);
        MessageId(previous.max(id.0))
    }
}

impl fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("id", &self.inner.id)
            .field("last_message_id", &self.last_message_id())
            .finish()
    }
}
