//! Client timing and socket configuration.

use std::time::Duration;

/// Configuration for a [`Client`](crate::Client)
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// How long `connect` waits for `REGISTERED`
    pub registration_timeout: Duration,

    /// Default timeout for `send_to`, `broadcast`, and introspection calls
    pub request_timeout: Duration,

    /// Interval between heartbeat pings once ready.
    ///
    /// Set to `Duration::ZERO` to disable the heartbeat.
    pub heartbeat_interval: Duration,

    /// Maximum time to wait for a heartbeat pong
    pub heartbeat_timeout: Duration,

    /// Events buffered per subscriber before the slowest one starts lagging
    pub event_capacity: usize,

    /// Dial deadline for `connect_tcp` and `connect_unix`; `None` waits
    /// as long as the OS does
    pub connect_timeout: Option<Duration>,

    /// Deadline for each frame written to a socket port. A write that
    /// misses it fails the operation that issued it.
    pub write_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registration_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(5),
            event_capacity: 64,
            connect_timeout: Some(Duration::from_secs(5)),
            write_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl ClientConfig {
    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Configure the heartbeat; a zero interval disables it.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat_interval = Duration::ZERO;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }
}
