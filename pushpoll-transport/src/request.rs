//! The parts of a physical request the transport needs, already parsed by the host.
use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::types::{ConnectionId, MessageId};
use crate::{Result, TransportError};

pub const CONNECTION_ID_PARAM: &str = "connectionId";
pub const MESSAGE_ID_PARAM: &str = "messageId";
pub const ABORT_PARAM: &str = "abort";
pub const DATA_FIELD: &str = "data";

/// What a physical request is asking for.
///
/// Decided once per request from its shape, see [`TransportRequest::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Client is sending data to the server
    Send,
    /// Client is closing the logical connection
    Abort,
    /// First receiving request of a new logical connection
    Connect,
    /// First receiving request after the client lost its previous one
    Reconnect,
    /// Any other receiving request
    Receive,
}

/// A physical request as seen by the transport.
///
/// The host is responsible for reading the path, query string and form body, and for providing a
/// cancellation token that fires when the request is abandoned (the client went away, the server
/// is shutting down, ...).
#[derive(Debug, Clone)]
pub struct TransportRequest {
    path: String,
    query: HashMap<String, String>,
    form: HashMap<String, String>,
    cancellation_token: CancellationToken,
}

impl TransportRequest {
    pub fn new(path: impl Into<String>, cancellation_token: CancellationToken) -> Self {
        Self {
            path: path.into(),
            query: HashMap::new(),
            form: HashMap::new(),
            cancellation_token,
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_form(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.insert(name.into(), value.into());
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn form(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Classify the request.  The first rule that matches wins:
    ///
    /// 1. A path ending in `/send` is a [`RequestKind::Send`]
    /// 2. A path ending in `/abort`, or an `abort` query parameter, is a [`RequestKind::Abort`]
    /// 3. A path ending in `/reconnect`, or in `/connect` with a `messageId` the client is resuming
    ///    from, is a [`RequestKind::Reconnect`]
    /// 4. A path ending in `/connect` is a [`RequestKind::Connect`]
    /// 5. Anything else is a [`RequestKind::Receive`]
    pub fn kind(&self) -> RequestKind {
        let path = self.path.trim_end_matches('/');

        if path.ends_with("/send") {
            RequestKind::Send
        } else if path.ends_with("/abort") || self.query.contains_key(ABORT_PARAM) {
            RequestKind::Abort
        } else if path.ends_with("/reconnect") {
            RequestKind::Reconnect
        } else if path.ends_with("/connect") {
            if self.query.contains_key(MESSAGE_ID_PARAM) {
                RequestKind::Reconnect
            } else {
                RequestKind::Connect
            }
        } else {
            RequestKind::Receive
        }
    }

    pub fn connection_id(&self) -> Result<ConnectionId> {
        self.query(CONNECTION_ID_PARAM)
            .filter(|id| !id.is_empty())
            .map(ConnectionId::from)
            .ok_or(TransportError::MissingConnectionId)
    }

    /// The last message the client saw, or [`MessageId::START`] if it didn't say
    pub fn message_id(&self) -> Result<MessageId> {
        match self.query(MESSAGE_ID_PARAM) {
            None | Some("") => Ok(MessageId::START),
            Some(value) => value
                .parse::<u64>()
                .map(MessageId)
                .map_err(|source| TransportError::InvalidMessageId {
                    value: value.to_string(),
                    source,
                }),
        }
    }

    /// The payload of a send request
    pub fn data(&self) -> Result<&str> {
        self.form(DATA_FIELD)
            .ok_or(TransportError::MissingFormField { field: DATA_FIELD })
    }
}
