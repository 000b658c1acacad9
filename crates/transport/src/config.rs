use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a [`NymTransport`](crate::NymTransport).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// How long a dial waits for the remote ConnectionResponse.
    pub handshake_timeout: Duration,

    /// Backlog of fully established inbound connections per listener.
    pub listener_backlog: usize,

    /// Backlog of accepted-but-unclaimed substreams per connection.
    pub inbound_substreams: usize,

    /// Buffered data frames per substream.
    pub substream_buffer: usize,

    pub mixnet: MixnetConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            listener_backlog: 16,
            inbound_substreams: 8,
            substream_buffer: 32,
            mixnet: MixnetConfig::default(),
        }
    }
}

/// Queue depths of the gateway session.
///
/// The substrate has no retransmit, so a full inbound queue drops frames;
/// size these for the expected burstiness of the application.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixnetConfig {
    pub inbound_queue: usize,
    pub outbound_queue: usize,
}

impl Default for MixnetConfig {
    fn default() -> Self {
        Self {
            inbound_queue: 32,
            outbound_queue: 32,
        }
    }
}
