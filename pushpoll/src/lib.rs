//! Persistent push connections over plain request/response.
//!
//! This is the umbrella crate.  Everything lives in the component crates and is re-exported from
//! here according to which features are enabled:
//!
//! - `transport` (default): the server-side transport, from `pushpoll-transport`
#[cfg(feature = "transport")]
pub use pushpoll_transport::*;
