//! Writing to the client.
//!
//! The physical response is owned by the host and reached through [`ResponseSink`].  How batches
//! are laid out on the wire is up to a [`Framing`], one per transport variant.
use async_trait::async_trait;

use crate::error::BoxError;
use crate::types::{MessageBatch, MessageId, PersistentResponse};
use crate::{Result, TransportError};

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// The body of a physical response, as provided by the host.
///
/// Writes must complete in the order they're issued.  A write that fails because the client went
/// away should return an error rather than block.
#[async_trait]
pub trait ResponseSink: Send + Sync + 'static {
    /// Set the content type.  Only meaningful before the first write.
    fn set_content_type(&self, content_type: &str);

    async fn write(&self, body: String) -> std::result::Result<(), BoxError>;

    /// Finish the response.  Nothing is written after this.
    async fn end(&self) -> std::result::Result<(), BoxError>;
}

/// How a transport variant lays out batches on the wire
pub trait Framing: Send + Sync + 'static {
    fn content_type(&self) -> &'static str;

    /// Written once, when the response is initialized, before any batch
    fn preamble(&self) -> Option<String> {
        None
    }

    fn encode(&self, response: &PersistentResponse) -> Result<String>;

    /// If `true`, a physical request ends after a single batch is flushed.  Otherwise it stays
    /// open and keeps receiving batches.
    fn completes_after_flush(&self) -> bool {
        false
    }
}

/// Encode a value as JSON, mapping failures to [`TransportError::Serialize`]
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|source| TransportError::Serialize {
        source,
        type_name: std::any::type_name::<T>(),
    })
}

/// Server-sent events.  Each batch is a `data:` event and the response stays open.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventStreamFraming;

impl Framing for EventStreamFraming {
    fn content_type(&self) -> &'static str {
        EVENT_STREAM_CONTENT_TYPE
    }

    fn preamble(&self) -> Option<String> {
        Some("data: initialized\n\n".to_string())
    }

    fn encode(&self, response: &PersistentResponse) -> Result<String> {
        Ok(format!("data: {}\n\n", to_json(response)?))
    }
}

/// Long polling.  The first batch becomes the whole response body and ends the request; the
/// client then polls again with the cursor from that body.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongPollingFraming;

impl Framing for LongPollingFraming {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, response: &PersistentResponse) -> Result<String> {
        to_json(response)
    }

    fn completes_after_flush(&self) -> bool {
        true
    }
}

/// Encode `batch` with `framing`, resuming after `cursor`
pub(crate) fn encode_batch(
    framing: &dyn Framing,
    batch: &MessageBatch,
    cursor: MessageId,
) -> Result<(PersistentResponse, String)> {
    let response = PersistentResponse::from_batch(batch, cursor);
    let body = framing.encode(&response)?;
    Ok((response, body))
}
