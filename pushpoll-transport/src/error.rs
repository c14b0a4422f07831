use std::any::Any;

use thiserror::Error;

pub type Result<T, E = TransportError> = std::result::Result<T, E>;

/// Type-erased error reported by collaborators the transport doesn't own: lifecycle hooks, the
/// physical response, message sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request is missing the required 'connectionId' query parameter")]
    MissingConnectionId,

    #[error("Request is missing the required form field '{field}'")]
    MissingFormField { field: &'static str },

    #[error("Invalid message id '{value}'")]
    InvalidMessageId {
        value: String,
        source: std::num::ParseIntError,
    },

    #[error("Lifecycle hook '{hook}' failed")]
    Hook { hook: &'static str, source: BoxError },

    #[error("Error writing to the response")]
    Write { source: BoxError },

    #[error("Error serializing {type_name} to JSON")]
    Serialize {
        source: serde_json::Error,
        type_name: &'static str,
    },

    #[error("Error subscribing to the message source")]
    Subscribe { source: BoxError },

    #[error("Concurrent task failed: {message}")]
    TaskFailed { message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl TransportError {
    /// Convert a failed join of a spawned task into an error.
    ///
    /// Panics are captured as their message, so that a panicking hook doesn't take the serving
    /// task down with it.
    pub(crate) fn from_join_error(e: tokio::task::JoinError) -> Self {
        if e.is_panic() {
            Self::TaskFailed {
                message: panic_err_to_string(e.into_panic()),
            }
        } else {
            Self::TaskFailed {
                message: "task was cancelled before completion".to_string(),
            }
        }
    }
}

/// Best-effort extraction of the message from a panic payload
pub(crate) fn panic_err_to_string(err: Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
