//! Counters describing transport activity.
//!
//! These go through the `metrics` facade; the library never installs a recorder, so unless the
//! host does, every call here is a no-op.

pub(crate) const CONNECTIONS_CONNECTED: &str = "pushpoll_connections_connected_total";
pub(crate) const CONNECTIONS_RECONNECTED: &str = "pushpoll_connections_reconnected_total";
pub(crate) const CONNECTIONS_DISCONNECTED: &str = "pushpoll_connections_disconnected_total";
pub(crate) const MESSAGES_FLUSHED: &str = "pushpoll_messages_flushed_total";
pub(crate) const ERRORS_ALL: &str = "pushpoll_errors_all_total";
pub(crate) const ERRORS_TRANSPORT: &str = "pushpoll_errors_transport_total";

pub(crate) fn connection_connected() {
    metrics::counter!(CONNECTIONS_CONNECTED).increment(1);
}

pub(crate) fn connection_reconnected() {
    metrics::counter!(CONNECTIONS_RECONNECTED).increment(1);
}

pub(crate) fn connection_disconnected() {
    metrics::counter!(CONNECTIONS_DISCONNECTED).increment(1);
}

pub(crate) fn messages_flushed(count: usize) {
    metrics::counter!(MESSAGES_FLUSHED).increment(count as u64);
}

/// Any error, wherever it came from.  Each counter moves exactly once per error.
pub(crate) fn record_error() {
    metrics::counter!(ERRORS_ALL).increment(1);
}

/// An error in the transport itself (writes, subscriptions), as opposed to application hooks.
pub(crate) fn record_transport_error() {
    metrics::counter!(ERRORS_ALL).increment(1);
    metrics::counter!(ERRORS_TRANSPORT).increment(1);
}
