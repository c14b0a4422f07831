use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The default number of messages delivered to a physical request in a single batch
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// The maximum number of messages the message source hands over per batch.
    ///
    /// This bounds the size of each write and the memory used while draining a large backlog.  It
    /// does not limit how many messages a connection receives over its lifetime; the receive loop
    /// keeps accepting batches until the request terminates.
    pub max_batch_size: usize,

    /// How long a connection can go without any activity before the liveness tracker flags its
    /// current request as timed out.
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// How long past [`Self::connection_timeout`] a connection can remain idle before it's
    /// considered gone and is disconnected for good.
    #[serde(with = "humantime_serde")]
    pub disconnect_timeout: Duration,

    /// How often the liveness tracker sweeps for idle connections
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// How many messages the in-memory bus retains for clients that reconnect behind.
    ///
    /// Once full, the oldest message is evicted for each new one.
    pub backlog_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            connection_timeout: Duration::from_secs(110),
            disconnect_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            backlog_capacity: 1000,
        }
    }
}
