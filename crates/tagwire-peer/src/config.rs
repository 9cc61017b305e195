use std::time::Duration;

use tagwire_frame::FrameConfig;

/// Default depth of the inbound and outbound frame queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Default time a request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay before a dropped client connection is redialed.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Default depth of the server's registry event queue.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 32;

/// Per-connection channel behavior.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Inbound frame queue depth. A full queue stalls the read loop.
    pub inbound_capacity: usize,
    /// Outbound frame queue depth.
    pub outbound_capacity: usize,
    /// How long a request waits for its reply.
    pub request_timeout: Duration,
    /// Framing limits.
    pub frame: FrameConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            frame: FrameConfig::default(),
        }
    }
}

/// Client connection manager behavior.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub channel: ChannelConfig,
    /// Wait before redialing after an established connection drops.
    pub reconnect_backoff: Duration,
    /// Upper bound on a single dial. `None` leaves it to the OS.
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            connect_timeout: None,
        }
    }
}

/// Server behavior.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub channel: ChannelConfig,
    /// Depth of the queue feeding the registry loop.
    pub registry_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
        }
    }
}
