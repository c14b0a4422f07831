//! Server side of a persistent connection transport for clients that can't hold a real socket
//! open: long polling and forever-frame style streaming over plain HTTP requests.
//!
//! A *logical* connection between a client and the server outlives any one *physical* HTTP
//! request.  The client keeps a receiving request open (or re-opens it after each response), sends
//! data with separate short requests, and resumes from the last message id it saw whenever a
//! physical request ends.  [`PersistentTransport`] is the server half of that arrangement.
//!
//! This crate doesn't speak HTTP.  The host parses requests into [`TransportRequest`]s and
//! exposes response bodies as [`ResponseSink`]s, and the transport takes it from there.  Messages
//! come from a [`MessageSource`], and a [`LivenessTracker`] keeps track of which logical
//! connections are alive.  [`MessageBus`] and [`ConnectionRegistry`] are in-memory
//! implementations of both, suitable for a single process.

/// Re-export the exact async-trait macro we use, for compatibility
#[doc(hidden)]
pub use async_trait::async_trait;

mod bus;
mod config;
mod error;
mod gate;
mod hooks;
mod interleave;
mod observers;
mod receive_loop;
mod request;
mod response;
mod source;
mod telemetry;
#[cfg(test)]
mod test_doubles;
#[cfg(test)]
pub mod testing;
mod tracker;
mod transport;
mod types;

pub use bus::{MessageBus, Signal, Target};
pub use config::{DEFAULT_MAX_BATCH_SIZE, TransportConfig};
pub use error::{BoxError, Result, TransportError};
pub use gate::{InitGate, OpenOnDrop};
pub use hooks::{HookResult, LifecycleHook, ReceivedHook, TransportHooks};
pub use interleave::interleave;
pub use observers::{ObserverRegistration, TransportEvent, TransportObserver, TransportObservers};
pub use receive_loop::Termination;
pub use request::{ABORT_PARAM, CONNECTION_ID_PARAM, DATA_FIELD, MESSAGE_ID_PARAM, RequestKind, TransportRequest};
pub use response::{
    EVENT_STREAM_CONTENT_TYPE, EventStreamFraming, Framing, JSON_CONTENT_TYPE, LongPollingFraming, ResponseSink,
};
pub use source::{BatchCallback, MessageSource, Subscription};
pub use tracker::{ConnectionRegistry, LivenessTracker, SweepOutcome};
pub use transport::{PersistentTransport, RequestOutcome, TransportBuilder};
pub use types::{
    ConnectionId, JsonValue, LogicalConnection, Message, MessageBatch, MessageId, PersistentResponse,
};
